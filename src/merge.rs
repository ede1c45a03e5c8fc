//! Symbol-merge resolution.
//!
//! A [`GroupTable`] collects everything known about each partial-array group
//! while inputs are read: the element signature declared for it, the fragments
//! contributing to it, and the modules that reference it. [`GroupTable::finish`]
//! turns that into the final list of groups or reports why the build cannot
//! proceed. The linker and the manifest generator both feed the same table,
//! with a different fragment payload `F`.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::symbol::is_valid_group_name;

/// Size and alignment of one array element, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementLayout {
    pub size: u64,
    pub align: u64,
}

impl ElementLayout {
    pub fn new(size: u64, align: u64) -> Self {
        Self { size, align }
    }
}

impl fmt::Display for ElementLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "size {} align {}", self.size, self.align)
    }
}

/// What a contributor claims about the group's element type.
///
/// Objects only know the layout; manifests know the type name and may know the
/// layout. Two signatures are compatible when every field present on both
/// sides is equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementSignature {
    pub type_name: Option<String>,
    pub layout: Option<ElementLayout>,
}

impl ElementSignature {
    pub fn from_layout(layout: ElementLayout) -> Self {
        Self { type_name: None, layout: Some(layout) }
    }

    pub fn named(type_name: impl Into<String>, layout: Option<ElementLayout>) -> Self {
        Self { type_name: Some(type_name.into()), layout }
    }

    pub fn is_compatible(&self, other: &ElementSignature) -> bool {
        let names = match (&self.type_name, &other.type_name) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        let layouts = match (self.layout, other.layout) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        names && layouts
    }

    /// Fills fields this signature lacks from `other`.
    fn absorb(&mut self, other: &ElementSignature) {
        if self.type_name.is_none() {
            self.type_name.clone_from(&other.type_name);
        }
        if self.layout.is_none() {
            self.layout = other.layout;
        }
    }
}

impl fmt::Display for ElementSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.type_name, self.layout) {
            (Some(name), Some(layout)) => write!(f, "`{name}` ({layout})"),
            (Some(name), None) => write!(f, "`{name}`"),
            (None, Some(layout)) => write!(f, "{layout}"),
            (None, None) => f.write_str("unknown element type"),
        }
    }
}

/// Build-time failures of the merge. None of these can occur at run time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error(
        "partial array `{group}`: element type {found} in {found_module} conflicts with {expected} declared in {expected_module}"
    )]
    TypeMismatch {
        group: String,
        expected: ElementSignature,
        expected_module: String,
        found: ElementSignature,
        found_module: String,
    },

    #[error("undefined partial array `{group}` referenced from {}", .modules.join(", "))]
    UndefinedGroup { group: String, modules: Vec<String> },

    #[error(
        "partial array `{group}`: fragment in {module} is {bytes} bytes, not a multiple of the {element_size}-byte element"
    )]
    RaggedFragment {
        group: String,
        module: String,
        bytes: u64,
        element_size: u64,
    },

    #[error("partial array `{group}` is declared in both {first} and {second}")]
    DuplicateDeclaration {
        group: String,
        first: String,
        second: String,
    },

    #[error("invalid partial array name `{name}` in {module}")]
    InvalidGroupName { name: String, module: String },

    #[error("partial array `{group}` in {module} has a zero-sized element type")]
    ZeroSizedElement { group: String, module: String },
}

/// One group as seen by the resolver.
#[derive(Debug)]
pub struct MergeGroup<F> {
    pub name: String,
    pub signature: ElementSignature,
    /// Module whose contribution first fixed the signature.
    pub origin: Option<String>,
    /// Whether any contributor declared the element type.
    pub declared: bool,
    /// Element count promised by fragment descriptors.
    pub described_elements: u64,
    /// Fragments in the order they were added (link order).
    pub fragments: Vec<F>,
    /// Modules holding unresolved references to the group.
    pub references: Vec<String>,
}

impl<F> MergeGroup<F> {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            signature: ElementSignature::default(),
            origin: None,
            declared: false,
            described_elements: 0,
            fragments: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn element_layout(&self) -> Option<ElementLayout> {
        self.signature.layout
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// Accumulates group facts from every input.
#[derive(Debug)]
pub struct GroupTable<F> {
    groups: BTreeMap<String, MergeGroup<F>>,
}

impl<F> Default for GroupTable<F> {
    fn default() -> Self {
        Self { groups: BTreeMap::new() }
    }
}

impl<F> GroupTable<F> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, group: &str, module: &str) -> Result<&mut MergeGroup<F>, MergeError> {
        if !is_valid_group_name(group) {
            return Err(MergeError::InvalidGroupName {
                name: group.to_string(),
                module: module.to_string(),
            });
        }
        Ok(self
            .groups
            .entry(group.to_string())
            .or_insert_with(|| MergeGroup::new(group)))
    }

    /// Records `module`'s claim about the element type of `group`.
    ///
    /// The first claim fixes the signature; later claims must be compatible.
    pub fn declare(
        &mut self,
        group: &str,
        module: &str,
        signature: ElementSignature,
    ) -> Result<&mut MergeGroup<F>, MergeError> {
        if signature.layout.is_some_and(|l| l.size == 0) {
            return Err(MergeError::ZeroSizedElement {
                group: group.to_string(),
                module: module.to_string(),
            });
        }
        let entry = self.entry(group, module)?;
        if !entry.signature.is_compatible(&signature) {
            return Err(MergeError::TypeMismatch {
                group: group.to_string(),
                expected: entry.signature.clone(),
                expected_module: entry.origin.clone().unwrap_or_default(),
                found: signature,
                found_module: module.to_string(),
            });
        }
        entry.signature.absorb(&signature);
        if entry.origin.is_none() {
            entry.origin = Some(module.to_string());
        }
        entry.declared = true;
        Ok(entry)
    }

    pub fn add_fragment(&mut self, group: &str, module: &str, fragment: F) -> Result<(), MergeError> {
        self.entry(group, module)?.fragments.push(fragment);
        Ok(())
    }

    /// Adds `count` elements to the tally promised by descriptors.
    pub fn describe_elements(&mut self, group: &str, module: &str, count: u64) -> Result<(), MergeError> {
        self.entry(group, module)?.described_elements += count;
        Ok(())
    }

    pub fn add_reference(&mut self, group: &str, module: &str) -> Result<(), MergeError> {
        let entry = self.entry(group, module)?;
        if !entry.references.iter().any(|m| m == module) {
            entry.references.push(module.to_string());
        }
        Ok(())
    }

    pub fn get(&self, group: &str) -> Option<&MergeGroup<F>> {
        self.groups.get(group)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Closes the table. Groups come back sorted by name.
    ///
    /// A referenced group that nobody declared and nobody contributed to is an
    /// unresolved external. A declared group without fragments is kept: it
    /// merges to a zero-length array.
    pub fn finish(self) -> Result<Vec<MergeGroup<F>>, MergeError> {
        let mut merged = Vec::with_capacity(self.groups.len());
        for (name, group) in self.groups {
            if !group.declared && group.fragments.is_empty() {
                if group.references.is_empty() {
                    continue;
                }
                return Err(MergeError::UndefinedGroup {
                    group: name,
                    modules: group.references,
                });
            }
            merged.push(group);
        }
        Ok(merged)
    }
}

/// Extent of one merged group in the final image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryMetadata {
    pub group: String,
    /// Address of `__start_partial_array_<group>`.
    pub start: u64,
    /// Address of `__stop_partial_array_<group>`.
    pub end: u64,
    /// `None` when only foreign fragments without descriptors contributed.
    pub element_size: Option<u64>,
}

impl BoundaryMetadata {
    pub fn byte_len(&self) -> u64 {
        self.end - self.start
    }

    /// Element count, the value the runtime size query recovers.
    pub fn len(&self) -> Option<u64> {
        self.element_size
            .filter(|size| *size != 0)
            .map(|size| self.byte_len() / size)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(size: u64, align: u64) -> ElementSignature {
        ElementSignature::from_layout(ElementLayout::new(size, align))
    }

    #[test]
    fn fragments_keep_link_order() {
        let mut table = GroupTable::new();
        table.declare("tests", "a.o", layout(8, 8)).unwrap();
        table.add_fragment("tests", "a.o", "a").unwrap();
        table.declare("tests", "b.o", layout(8, 8)).unwrap();
        table.add_fragment("tests", "b.o", "b").unwrap();
        table.add_fragment("tests", "a.o", "c").unwrap();

        let groups = table.finish().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].fragments, vec!["a", "b", "c"]);
        assert_eq!(groups[0].origin.as_deref(), Some("a.o"));
    }

    #[test]
    fn size_mismatch_names_both_modules() {
        let mut table: GroupTable<()> = GroupTable::new();
        table.declare("hashes", "md5.o", layout(16, 8)).unwrap();
        let err = table.declare("hashes", "sha.o", layout(24, 8)).unwrap_err();

        let message = err.to_string();
        assert!(matches!(err, MergeError::TypeMismatch { .. }));
        assert!(message.contains("hashes"));
        assert!(message.contains("md5.o"));
        assert!(message.contains("sha.o"));
    }

    #[test]
    fn alignment_only_mismatch_is_fatal() {
        let mut table: GroupTable<()> = GroupTable::new();
        table.declare("words", "a.o", layout(8, 8)).unwrap();
        assert!(table.declare("words", "b.o", layout(8, 4)).is_err());
    }

    #[test]
    fn type_names_are_compared_when_both_sides_have_one() {
        let mut table: GroupTable<()> = GroupTable::new();
        table
            .declare("drivers", "core.toml", ElementSignature::named("crate::Driver", None))
            .unwrap();
        // A layout-only claim neither confirms nor contradicts the name.
        table.declare("drivers", "x.o", layout(32, 8)).unwrap();
        let err = table
            .declare("drivers", "extra.toml", ElementSignature::named("crate::Plugin", None))
            .unwrap_err();
        assert!(matches!(err, MergeError::TypeMismatch { .. }));

        let group = table.get("drivers").unwrap();
        assert_eq!(group.signature.type_name.as_deref(), Some("crate::Driver"));
        assert_eq!(group.element_layout(), Some(ElementLayout::new(32, 8)));
    }

    #[test]
    fn referenced_group_without_contributors_is_undefined() {
        let mut table: GroupTable<()> = GroupTable::new();
        table.add_reference("plugins", "main.o").unwrap();
        table.add_reference("plugins", "main.o").unwrap();
        table.add_reference("plugins", "runner.o").unwrap();

        let err = table.finish().unwrap_err();
        assert_eq!(
            err,
            MergeError::UndefinedGroup {
                group: "plugins".to_string(),
                modules: vec!["main.o".to_string(), "runner.o".to_string()],
            }
        );
    }

    #[test]
    fn declared_group_without_fragments_is_empty_not_undefined() {
        let mut table: GroupTable<()> = GroupTable::new();
        table.declare("empty", "main.o", layout(4, 4)).unwrap();
        table.add_reference("empty", "main.o").unwrap();

        let groups = table.finish().unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_empty());
    }

    #[test]
    fn groups_finish_in_name_order() {
        let mut table = GroupTable::new();
        for name in ["zeta", "alpha", "mid"] {
            table.declare(name, "m.o", layout(1, 1)).unwrap();
            table.add_fragment(name, "m.o", name).unwrap();
        }
        let names: Vec<_> = table.finish().unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn rejects_bad_names_and_zero_sized_elements() {
        let mut table: GroupTable<()> = GroupTable::new();
        assert!(matches!(
            table.add_reference("not-an-ident", "m.o"),
            Err(MergeError::InvalidGroupName { .. })
        ));
        assert!(matches!(
            table.declare("units", "m.o", layout(0, 1)),
            Err(MergeError::ZeroSizedElement { .. })
        ));
    }

    #[test]
    fn boundary_metadata_recovers_count() {
        let meta = BoundaryMetadata {
            group: "g".to_string(),
            start: 0x1000,
            end: 0x1018,
            element_size: Some(8),
        };
        assert_eq!(meta.byte_len(), 24);
        assert_eq!(meta.len(), Some(3));
        assert!(!meta.is_empty());

        let foreign = BoundaryMetadata { element_size: None, ..meta };
        assert_eq!(foreign.len(), None);
    }
}
