//! Symbol table management and the partial-array naming convention.
//!
//! Every group `G` is carried in an allocated section named `partial_array_G`.
//! The merged block is framed by `__start_partial_array_G` and
//! `__stop_partial_array_G`, the same names a stock ELF linker synthesizes for
//! sections whose names are C identifiers.

use object::read::SectionIndex;

/// Prefix of every section holding fragment data.
pub const GROUP_SECTION_PREFIX: &str = "partial_array_";

/// Section holding descriptor records.
pub const META_SECTION: &str = "partial_array_meta";

/// Prefix of the exported symbol each declaration defines. Two declarations
/// of one group collide on it at link time.
pub const DECLARATION_GUARD_PREFIX: &str = "__partial_array_decl_";

const START_PREFIX: &str = "__start_";
const STOP_PREFIX: &str = "__stop_";

/// Longest group name a descriptor can carry.
pub const MAX_GROUP_NAME: usize = 64;

/// A symbol defined in an input object file.
///
/// Only indices are stored; the final address is derived from the section map
/// once layout has run.
#[derive(Debug, Clone, Copy)]
pub struct DefinedSymbol {
    /// Index of the input file in the linker's file list.
    pub input_file_index: usize,
    /// Section index within that input file.
    pub section_index: SectionIndex,
    /// Offset within the section (or absolute value if `is_absolute`).
    pub value: u64,
    pub is_weak: bool,
    pub is_absolute: bool,
}

/// Which end of a merged group a boundary symbol marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Start,
    Stop,
}

/// Returns the group carried by `section_name`, if it is a fragment section.
pub fn group_of_section(section_name: &str) -> Option<&str> {
    if section_name == META_SECTION {
        return None;
    }
    section_name.strip_prefix(GROUP_SECTION_PREFIX)
}

/// Splits `__start_partial_array_G` / `__stop_partial_array_G` into its parts.
pub fn parse_boundary_symbol(name: &str) -> Option<(Boundary, &str)> {
    let (boundary, section) = if let Some(rest) = name.strip_prefix(START_PREFIX) {
        (Boundary::Start, rest)
    } else if let Some(rest) = name.strip_prefix(STOP_PREFIX) {
        (Boundary::Stop, rest)
    } else {
        return None;
    };
    group_of_section(section).map(|group| (boundary, group))
}

pub fn boundary_symbol(boundary: Boundary, group: &str) -> String {
    let prefix = match boundary {
        Boundary::Start => START_PREFIX,
        Boundary::Stop => STOP_PREFIX,
    };
    format!("{prefix}{GROUP_SECTION_PREFIX}{group}")
}

pub fn declaration_guard_symbol(group: &str) -> String {
    format!("{DECLARATION_GUARD_PREFIX}{group}")
}

/// Returns the group a declaration guard symbol belongs to.
pub fn parse_declaration_guard(name: &str) -> Option<&str> {
    name.strip_prefix(DECLARATION_GUARD_PREFIX).filter(|group| !group.is_empty())
}

/// Group names must be usable inside section and symbol names.
pub fn is_valid_group_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    name.len() <= MAX_GROUP_NAME
        && (first.is_ascii_alphabetic() || first == b'_')
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Known symbols that can remain undefined (resolve to 0).
pub fn is_optional_symbol(name: &str) -> bool {
    matches!(
        name,
        "_DYNAMIC" | "__dso_handle" | "_dl_find_object" | "__TMC_END__"
    ) || name.starts_with("__TMC_")
        || name.starts_with("__gcc_")
        || name.starts_with("__bid_")
        || name.starts_with("__morestack")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_names_round_trip_through_parser() {
        let start = boundary_symbol(Boundary::Start, "test_cases");
        assert_eq!(start, "__start_partial_array_test_cases");
        assert_eq!(parse_boundary_symbol(&start), Some((Boundary::Start, "test_cases")));

        let stop = boundary_symbol(Boundary::Stop, "HASHES");
        assert_eq!(parse_boundary_symbol(&stop), Some((Boundary::Stop, "HASHES")));
    }

    #[test]
    fn unrelated_start_symbols_are_not_boundaries() {
        assert_eq!(parse_boundary_symbol("__start_my_section"), None);
        assert_eq!(parse_boundary_symbol("__start_partial_array_meta"), None);
        assert_eq!(parse_boundary_symbol("partial_array_x"), None);
    }

    #[test]
    fn declaration_guards_name_their_group() {
        let guard = declaration_guard_symbol("HASH_ALGORITHMS");
        assert_eq!(guard, "__partial_array_decl_HASH_ALGORITHMS");
        assert_eq!(parse_declaration_guard(&guard), Some("HASH_ALGORITHMS"));
        assert_eq!(parse_declaration_guard("__partial_array_decl_"), None);
        assert_eq!(parse_declaration_guard("__start_partial_array_x"), None);
    }

    #[test]
    fn meta_section_is_not_a_group() {
        assert_eq!(group_of_section(META_SECTION), None);
        assert_eq!(group_of_section("partial_array_drivers"), Some("drivers"));
        assert_eq!(group_of_section(".data"), None);
    }

    #[test]
    fn group_names_must_be_identifiers() {
        assert!(is_valid_group_name("hash_algorithms"));
        assert!(is_valid_group_name("_private2"));
        assert!(!is_valid_group_name(""));
        assert!(!is_valid_group_name("2fast"));
        assert!(!is_valid_group_name("has-dash"));
        assert!(!is_valid_group_name(&"x".repeat(MAX_GROUP_NAME + 1)));
    }
}
