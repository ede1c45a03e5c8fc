//! Fragment manifests.
//!
//! When the target linker cannot merge sections, each module lists its
//! fragments in a TOML manifest instead. A [`ManifestSet`] gathers the
//! manifests of a whole build, resolves them through the same
//! [`GroupTable`] the linker uses, and hands the result to
//! [`codegen`](crate::codegen).
//!
//! ```toml
//! references = ["hash_algorithms"]
//!
//! [[group]]
//! name = "hash_algorithms"
//! element = "crate::HashAlgorithm"
//!
//! [[fragment]]
//! group = "hash_algorithms"
//! element = "crate::HashAlgorithm"
//! priority = 10
//! elements = ["crate::md5::MD5"]
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::codegen;
use crate::merge::{ElementLayout, ElementSignature, GroupTable, MergeError};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("manifest {module}: `size` and `align` must be given together")]
    PartialLayout { module: String },

    #[error("partial arrays `{first}` and `{second}` both generate the item `{ident}`")]
    IdentifierCollision {
        first: String,
        second: String,
        ident: String,
    },

    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// Declares a group and its element type without contributing elements.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GroupDecl {
    pub name: String,
    pub element: String,
    pub size: Option<u64>,
    pub align: Option<u64>,
}

/// One fragment: an ordered list of element expressions.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FragmentDecl {
    pub group: String,
    pub element: String,
    pub size: Option<u64>,
    pub align: Option<u64>,
    /// Lower priorities are placed first; ties keep contribution order.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub elements: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Groups this module consumes.
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default, rename = "group")]
    pub groups: Vec<GroupDecl>,
    #[serde(default, rename = "fragment")]
    pub fragments: Vec<FragmentDecl>,
}

impl Manifest {
    pub fn parse(path: &Path, content: &str) -> Result<Self, ManifestError> {
        toml::from_str(content).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &content)
    }
}

fn signature(
    module: &str,
    element: &str,
    size: Option<u64>,
    align: Option<u64>,
) -> Result<ElementSignature, ManifestError> {
    let layout = match (size, align) {
        (Some(size), Some(align)) => Some(ElementLayout::new(size, align)),
        (None, None) => None,
        _ => {
            return Err(ManifestError::PartialLayout {
                module: module.to_string(),
            })
        }
    };
    Ok(ElementSignature::named(element.trim(), layout))
}

/// A fragment waiting to be ordered.
#[derive(Debug, Clone)]
struct PendingFragment {
    priority: i32,
    module: String,
    elements: Vec<String>,
}

/// A group ready for code generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGroup {
    pub name: String,
    pub element: String,
    /// Element expressions in final order.
    pub elements: Vec<String>,
    /// Modules that contributed elements, in final order, without repeats.
    pub contributors: Vec<String>,
}

impl ResolvedGroup {
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Every manifest of one build, in contribution order.
#[derive(Debug, Default)]
pub struct ManifestSet {
    manifests: Vec<(String, Manifest)>,
}

impl ManifestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, module: impl Into<String>, manifest: Manifest) {
        self.manifests.push((module.into(), manifest));
    }

    pub fn load(&mut self, path: &Path) -> Result<(), ManifestError> {
        let manifest = Manifest::load(path)?;
        self.add(path.display().to_string(), manifest);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    /// Merges all manifests. `required` lists groups the caller itself
    /// consumes, on top of each manifest's `references`.
    pub fn resolve(&self, required: &[String]) -> Result<Vec<ResolvedGroup>, ManifestError> {
        let mut table: GroupTable<PendingFragment> = GroupTable::new();

        for (module, manifest) in &self.manifests {
            for decl in &manifest.groups {
                let sig = signature(module, &decl.element, decl.size, decl.align)?;
                table.declare(&decl.name, module, sig)?;
            }
            for fragment in &manifest.fragments {
                let sig = signature(module, &fragment.element, fragment.size, fragment.align)?;
                table.declare(&fragment.group, module, sig)?;
                table.describe_elements(&fragment.group, module, fragment.elements.len() as u64)?;
                table.add_fragment(
                    &fragment.group,
                    module,
                    PendingFragment {
                        priority: fragment.priority,
                        module: module.clone(),
                        elements: fragment.elements.clone(),
                    },
                )?;
            }
            for group in &manifest.references {
                table.add_reference(group, module)?;
            }
        }
        for group in required {
            table.add_reference(group, "<command line>")?;
        }

        let mut resolved = Vec::new();
        for mut group in table.finish()? {
            // Stable: equal priorities keep contribution order.
            group.fragments.sort_by_key(|f| f.priority);

            let mut elements = Vec::new();
            let mut contributors: Vec<String> = Vec::new();
            for fragment in group.fragments {
                if !fragment.elements.is_empty() && !contributors.contains(&fragment.module) {
                    contributors.push(fragment.module.clone());
                }
                elements.extend(fragment.elements);
            }
            tracing::debug!("partial array `{}`: {} elements", group.name, elements.len());

            resolved.push(ResolvedGroup {
                name: group.name,
                element: group.signature.type_name.unwrap_or_default(),
                elements,
                contributors,
            });
        }
        check_identifiers(&resolved)?;
        Ok(resolved)
    }
}

/// Generated items are named after the upper-cased group, so distinct groups
/// can still land on one identifier.
fn check_identifiers(groups: &[ResolvedGroup]) -> Result<(), ManifestError> {
    let mut owners: HashMap<String, &str> = HashMap::new();
    for group in groups {
        let name = codegen::static_name(&group.name);
        let len = codegen::len_name(&group.name);
        for ident in [name, len] {
            if let Some(first) = owners.insert(ident.clone(), &group.name) {
                return Err(ManifestError::IdentifierCollision {
                    first: first.to_string(),
                    second: group.name.clone(),
                    ident,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(text: &str) -> Manifest {
        Manifest::parse(Path::new("test.toml"), text).unwrap()
    }

    #[test]
    fn parses_groups_fragments_and_references() {
        let parsed = manifest(
            r#"
            references = ["test_cases"]

            [[group]]
            name = "test_cases"
            element = "fn()"

            [[fragment]]
            group = "test_cases"
            element = "fn()"
            elements = ["crate::a::first", "crate::a::second"]
            "#,
        );
        assert_eq!(parsed.references, vec!["test_cases".to_string()]);
        assert_eq!(parsed.groups.len(), 1);
        assert_eq!(parsed.fragments[0].priority, 0);
        assert_eq!(parsed.fragments[0].elements.len(), 2);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Manifest::parse(Path::new("bad.toml"), "[[fragment]]\ngroup = \"g\"\nelement = \"u8\"\ncolour = 1\n")
            .unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn fragments_concatenate_preserving_inner_order() {
        let mut set = ManifestSet::new();
        set.add(
            "md5.toml",
            manifest(
                r#"
                [[fragment]]
                group = "hash_algorithms"
                element = "crate::HashAlgorithm"
                elements = ["MD5"]
                "#,
            ),
        );
        set.add(
            "sha.toml",
            manifest(
                r#"
                [[fragment]]
                group = "hash_algorithms"
                element = "crate::HashAlgorithm"
                elements = ["SHA1", "SHA256"]
                "#,
            ),
        );

        let groups = set.resolve(&[]).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].elements, vec!["MD5", "SHA1", "SHA256"]);
        assert_eq!(groups[0].contributors, vec!["md5.toml", "sha.toml"]);
        assert_eq!(groups[0].element, "crate::HashAlgorithm");
    }

    #[test]
    fn priority_orders_fragments_across_modules() {
        let mut set = ManifestSet::new();
        set.add(
            "late.toml",
            manifest(
                r#"
                [[fragment]]
                group = "drivers"
                element = "Driver"
                priority = 5
                elements = ["late"]
                "#,
            ),
        );
        set.add(
            "early.toml",
            manifest(
                r#"
                [[fragment]]
                group = "drivers"
                element = "Driver"
                priority = -1
                elements = ["early_a", "early_b"]

                [[fragment]]
                group = "drivers"
                element = "Driver"
                priority = 5
                elements = ["tie"]
                "#,
            ),
        );

        let groups = set.resolve(&[]).unwrap();
        assert_eq!(groups[0].elements, vec!["early_a", "early_b", "late", "tie"]);
    }

    #[test]
    fn element_type_mismatch_fails() {
        let mut set = ManifestSet::new();
        set.add(
            "a.toml",
            manifest("[[fragment]]\ngroup = \"g\"\nelement = \"u32\"\nelements = [\"1\"]\n"),
        );
        set.add(
            "b.toml",
            manifest("[[fragment]]\ngroup = \"g\"\nelement = \"u64\"\nelements = [\"2\"]\n"),
        );

        let err = set.resolve(&[]).unwrap_err();
        assert!(matches!(err, ManifestError::Merge(MergeError::TypeMismatch { .. })));
        let message = err.to_string();
        assert!(message.contains("a.toml") && message.contains("b.toml"));
    }

    #[test]
    fn layout_mismatch_with_same_name_fails() {
        let mut set = ManifestSet::new();
        set.add(
            "a.toml",
            manifest("[[group]]\nname = \"g\"\nelement = \"Entry\"\nsize = 16\nalign = 8\n"),
        );
        set.add(
            "b.toml",
            manifest("[[fragment]]\ngroup = \"g\"\nelement = \"Entry\"\nsize = 24\nalign = 8\n"),
        );
        assert!(set.resolve(&[]).is_err());
    }

    #[test]
    fn half_a_layout_is_rejected() {
        let mut set = ManifestSet::new();
        set.add("a.toml", manifest("[[group]]\nname = \"g\"\nelement = \"Entry\"\nsize = 16\n"));
        assert!(matches!(set.resolve(&[]), Err(ManifestError::PartialLayout { .. })));
    }

    #[test]
    fn declared_but_empty_group_resolves_to_zero_elements() {
        let mut set = ManifestSet::new();
        set.add(
            "runner.toml",
            manifest("references = [\"test_cases\"]\n[[group]]\nname = \"test_cases\"\nelement = \"fn()\"\n"),
        );
        let groups = set.resolve(&[]).unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_empty());
        assert!(groups[0].contributors.is_empty());
    }

    #[test]
    fn missing_producer_is_undefined() {
        let mut set = ManifestSet::new();
        set.add("runner.toml", manifest("references = [\"plugins\"]\n"));
        let err = set.resolve(&[]).unwrap_err();
        assert!(matches!(err, ManifestError::Merge(MergeError::UndefinedGroup { .. })));
        assert!(err.to_string().contains("runner.toml"));

        let err = ManifestSet::new().resolve(&["tools".to_string()]).unwrap_err();
        assert!(err.to_string().contains("<command line>"));
    }

    #[test]
    fn load_reports_missing_file() {
        let mut set = ManifestSet::new();
        let err = set.load(Path::new("/nonexistent/partlink.toml")).unwrap_err();
        assert!(matches!(err, ManifestError::Io { .. }));
        assert!(set.is_empty());
    }

    #[test]
    fn groups_generating_the_same_item_are_rejected() {
        let declare = |names: &[&str]| {
            let mut set = ManifestSet::new();
            for name in names {
                set.add(
                    format!("{name}.toml"),
                    manifest(&format!("[[group]]\nname = \"{name}\"\nelement = \"u8\"\n")),
                );
            }
            set.resolve(&[])
        };

        match declare(&["foo", "FOO"]).unwrap_err() {
            ManifestError::IdentifierCollision { first, second, ident } => {
                assert_eq!((first.as_str(), second.as_str()), ("FOO", "foo"));
                assert_eq!(ident, "FOO");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = declare(&["foo", "foo_len"]).unwrap_err();
        assert!(err.to_string().contains("`FOO_LEN`"));

        assert_eq!(declare(&["foo", "bar"]).unwrap().len(), 2);
    }

    #[test]
    fn resolution_is_deterministic() {
        let build = || {
            let mut set = ManifestSet::new();
            for (module, element) in [("x.toml", "1"), ("y.toml", "2"), ("z.toml", "3")] {
                set.add(
                    module,
                    manifest(&format!(
                        "[[fragment]]\ngroup = \"numbers\"\nelement = \"u8\"\nelements = [\"{element}\"]\n"
                    )),
                );
            }
            set.resolve(&[]).unwrap()
        };
        assert_eq!(build(), build());
    }
}
