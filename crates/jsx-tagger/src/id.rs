use md5::{Digest, Md5};

/// Length of the hex digest suffix carried by every tag id.
pub const HASH_LEN: usize = 8;

/// A tag id split into its optional prefix and hex suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    pub prefix: Option<String>,
    pub hash: String,
}

/// Generate the stable id for an element at `file:line:column`.
///
/// The id is the first 8 hex chars of `md5("{file}:{line}:{column}")`,
/// optionally prefixed as `"{prefix}-{hash}"`. The same inputs always
/// produce the same id, which is what lets an external editor map a DOM
/// node back to its source location across rebuilds.
pub fn generate_stable_id(file: &str, line: u32, column: u32, prefix: Option<&str>) -> String {
    let mut hasher = Md5::new();
    hasher.update(file.as_bytes());
    hasher.update(b":");
    hasher.update(line.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(column.to_string().as_bytes());
    let digest = hasher.finalize();
    let hash: String = hex_lower(&digest)[..HASH_LEN].to_string();

    match prefix {
        Some(p) if !p.is_empty() => format!("{p}-{hash}"),
        _ => hash,
    }
}

/// Split a tag id into `{prefix?, hash}`. Returns `None` for anything
/// `is_valid_jsx_id` rejects.
pub fn parse_id(id: &str) -> Option<ParsedId> {
    if !is_valid_jsx_id(id) {
        return None;
    }
    if id.len() == HASH_LEN {
        return Some(ParsedId {
            prefix: None,
            hash: id.to_string(),
        });
    }
    let (prefix, hash) = id.split_at(id.len() - HASH_LEN - 1);
    Some(ParsedId {
        prefix: Some(prefix.to_string()),
        hash: hash[1..].to_string(),
    })
}

/// A valid id is an optional non-empty prefix followed by `-` and exactly
/// 8 lowercase hex chars, or the bare 8 hex chars.
pub fn is_valid_jsx_id(id: &str) -> bool {
    if id.len() < HASH_LEN || !id.is_ascii() {
        return false;
    }
    let hash = &id[id.len() - HASH_LEN..];
    if !hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return false;
    }
    if id.len() == HASH_LEN {
        return true;
    }
    // Prefixed form: something before a separating dash.
    id.len() > HASH_LEN + 1 && id.as_bytes()[id.len() - HASH_LEN - 1] == b'-'
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn id_is_stable() {
        let a = generate_stable_id("/src/App.tsx", 3, 10, Some("demo"));
        let b = generate_stable_id("/src/App.tsx", 3, 10, Some("demo"));
        assert_eq!(a, b);
        assert!(a.starts_with("demo-"));
        assert_eq!(a.len(), "demo-".len() + HASH_LEN);
    }

    #[test]
    fn id_without_prefix_is_bare_hash() {
        let id = generate_stable_id("/src/App.tsx", 3, 10, None);
        assert_eq!(id.len(), HASH_LEN);
        assert!(is_valid_jsx_id(&id));

        let empty = generate_stable_id("/src/App.tsx", 3, 10, Some(""));
        assert_eq!(empty, id);
    }

    #[test]
    fn changing_any_input_changes_the_hash() {
        let base = generate_stable_id("/src/App.tsx", 3, 10, None);
        assert_ne!(base, generate_stable_id("/src/App.tsx", 4, 10, None));
        assert_ne!(base, generate_stable_id("/src/App.tsx", 3, 11, None));
        assert_ne!(base, generate_stable_id("/src/Other.tsx", 3, 10, None));
    }

    #[test]
    fn validation_rejects_malformed_ids() {
        assert!(!is_valid_jsx_id(""));
        assert!(!is_valid_jsx_id("123"));
        assert!(!is_valid_jsx_id("123456789"));
        assert!(!is_valid_jsx_id("1234567g"));
        assert!(!is_valid_jsx_id("-12345678"));
        assert!(is_valid_jsx_id("12345678"));
        assert!(is_valid_jsx_id("demo-12345678"));
        assert!(is_valid_jsx_id("my-app-12345678"));
    }

    #[test]
    fn parse_splits_prefix_and_hash() {
        let parsed = parse_id("demo-deadbeef").unwrap();
        assert_eq!(parsed.prefix.as_deref(), Some("demo"));
        assert_eq!(parsed.hash, "deadbeef");

        let bare = parse_id("deadbeef").unwrap();
        assert_eq!(bare.prefix, None);
        assert_eq!(bare.hash, "deadbeef");

        assert!(parse_id("nope").is_none());
    }

    proptest! {
        #[test]
        fn generated_ids_always_validate(
            file in "[a-zA-Z0-9/._-]{1,40}",
            line in 1u32..100_000,
            col in 0u32..500,
            prefix in proptest::option::of("[a-z0-9]{1,12}"),
        ) {
            let id = generate_stable_id(&file, line, col, prefix.as_deref());
            prop_assert!(is_valid_jsx_id(&id));
            let parsed = parse_id(&id).unwrap();
            prop_assert_eq!(parsed.prefix, prefix.filter(|p| !p.is_empty()));
        }
    }
}
