//! Share permission vocabulary and its canonical CSV encoding.
//!
//! Grants are stored as a comma-separated, sorted list. Unknown tokens are
//! dropped on decode so a downgraded schema never widens access.

use std::collections::BTreeSet;

pub const PERMISSIONS: &[&str] = &[
    "read",
    "download",
    "request_send",
    "accept_incoming",
    "manage_share",
];

pub const OWNER_PERMISSIONS: &[&str] = &[
    "read",
    "download",
    "request_send",
    "accept_incoming",
    "manage_share",
];

pub const DEFAULT_EXTERNAL_PERMISSIONS: &[&str] = &["read", "download", "request_send"];

/// Sorted set of permission names. `BTreeSet` keeps iteration order stable
/// so encoded grants and ticket claims are deterministic.
pub type PermissionSet = BTreeSet<String>;

pub fn permission_set(values: &[&str]) -> PermissionSet {
    values.iter().map(|value| (*value).to_string()).collect()
}

pub fn normalize_permissions<I, S>(values: I) -> PermissionSet
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .filter_map(|value| {
            let trimmed = value.as_ref().trim();
            if trimmed.is_empty() || !PERMISSIONS.contains(&trimmed) {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

pub fn encode_permissions(values: &PermissionSet) -> String {
    let normalized = normalize_permissions(values.iter());
    normalized.into_iter().collect::<Vec<_>>().join(",")
}

pub fn decode_permissions(raw: Option<&str>) -> PermissionSet {
    match raw {
        None => PermissionSet::new(),
        Some(raw) => normalize_permissions(raw.split(',')),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_sorts_and_dedupes() {
        let set = normalize_permissions(["request_send", "read", "read", " download "]);
        assert_eq!(encode_permissions(&set), "download,read,request_send");
    }

    #[test]
    fn decode_drops_unknown_tokens() {
        let set = decode_permissions(Some("read,admin,download,,write"));
        assert_eq!(encode_permissions(&set), "download,read");
    }

    #[test]
    fn decode_none_is_empty() {
        assert!(decode_permissions(None).is_empty());
    }

    #[test]
    fn owner_set_covers_vocabulary() {
        assert_eq!(permission_set(OWNER_PERMISSIONS).len(), PERMISSIONS.len());
    }
}
