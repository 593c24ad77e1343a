//! Logical path handling.
//!
//! Callers always address secrets with `/`-delimited paths. Backends whose
//! name alphabet is restricted (Azure Key Vault allows only alphanumerics and
//! hyphens) normalize at their boundary with [`normalize_name`].

/// Normalize a logical path into a restricted-alphabet secret name.
///
/// `/`, `.` and `_` all become `-`; everything else passes through. The
/// mapping is not reversible, so backends that need to list original paths
/// must store the logical path alongside the value.
#[must_use]
pub fn normalize_name(path: &str) -> String {
    path.chars()
        .map(|c| match c {
            '/' | '.' | '_' => '-',
            other => other,
        })
        .collect()
}

/// Split a logical path into its parent prefix and leaf name.
#[must_use]
pub fn split_leaf(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators() {
        assert_eq!(
            normalize_name("ssh-ca/default/private_key"),
            "ssh-ca-default-private-key"
        );
        assert_eq!(normalize_name("cloud/aws.prod"), "cloud-aws-prod");
    }

    #[test]
    fn split_leaf_variants() {
        assert_eq!(split_leaf("a/b/c"), ("a/b", "c"));
        assert_eq!(split_leaf("top"), ("", "top"));
    }
}
