//! Rust source generation for manifest-resolved groups.
//!
//! Each group becomes a sized static array plus a length constant:
//!
//! ```text
//! pub static HASH_ALGORITHMS: [crate::HashAlgorithm; 3] = [ ... ];
//! pub const HASH_ALGORITHMS_LEN: usize = 3;
//! ```

use crate::manifest::ResolvedGroup;

const HEADER: &str = "// @generated by partgen. Do not edit.\n";

/// Identifier used for a group's static.
pub fn static_name(group: &str) -> String {
    group.to_ascii_uppercase()
}

/// Identifier used for a group's length constant.
pub fn len_name(group: &str) -> String {
    format!("{}_LEN", static_name(group))
}

/// Renders every group, in the order given.
pub fn render(groups: &[ResolvedGroup]) -> String {
    let mut out = String::from(HEADER);
    for group in groups {
        out.push('\n');
        out.push_str(&render_group(group));
    }
    out
}

fn render_group(group: &ResolvedGroup) -> String {
    let name = static_name(&group.name);
    let mut out = String::new();

    if !group.contributors.is_empty() {
        out.push_str(&format!("// Contributed by: {}\n", group.contributors.join(", ")));
    }
    out.push_str(&format!(
        "pub static {name}: [{}; {}] = [",
        group.element,
        group.len()
    ));
    if group.is_empty() {
        out.push_str("];\n");
    } else {
        out.push('\n');
        for element in &group.elements {
            out.push_str(&format!("    {},\n", element.trim()));
        }
        out.push_str("];\n");
    }
    out.push_str(&format!("pub const {}: usize = {};\n", len_name(&group.name), group.len()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, element: &str, elements: &[&str]) -> ResolvedGroup {
        ResolvedGroup {
            name: name.to_string(),
            element: element.to_string(),
            elements: elements.iter().map(|e| e.to_string()).collect(),
            contributors: if elements.is_empty() { vec![] } else { vec!["a.toml".to_string()] },
        }
    }

    #[test]
    fn renders_sized_array_and_length() {
        let source = render(&[group("hash_algorithms", "crate::HashAlgorithm", &["MD5", "SHA1"])]);
        assert!(source.starts_with("// @generated"));
        assert!(source.contains("// Contributed by: a.toml\n"));
        assert!(source.contains("pub static HASH_ALGORITHMS: [crate::HashAlgorithm; 2] = [\n    MD5,\n    SHA1,\n];\n"));
        assert!(source.contains("pub const HASH_ALGORITHMS_LEN: usize = 2;\n"));
    }

    #[test]
    fn empty_group_renders_zero_length_array() {
        let source = render(&[group("test_cases", "fn()", &[])]);
        assert!(source.contains("pub static TEST_CASES: [fn(); 0] = [];\n"));
        assert!(source.contains("pub const TEST_CASES_LEN: usize = 0;\n"));
        assert!(!source.contains("Contributed by"));
    }

    #[test]
    fn groups_render_in_given_order() {
        let source = render(&[group("alpha", "u8", &["1"]), group("beta", "u8", &["2"])]);
        let alpha = source.find("ALPHA").unwrap();
        let beta = source.find("BETA").unwrap();
        assert!(alpha < beta);
    }
}
