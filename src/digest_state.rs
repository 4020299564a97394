//! Persisted per-workload digest state.
//!
//! The last observed digests live in a single workload annotation. Current
//! controllers write comma-separated `container:digest` pairs sorted by
//! container name. Annotations written before multi-container tracking hold a
//! single bare digest instead, which is decoded as [`StoredDigests::Legacy`]
//! and migrated onto the first tracked container.

use std::collections::BTreeMap;
use std::fmt;

const LEGACY_DIGEST_PREFIXES: [&str; 3] = ["sha256:", "sha384:", "sha512:"];

/// Container name to content digest, ordered by container name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestMap(BTreeMap<String, String>);

impl DigestMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, container: impl Into<String>, digest: impl Into<String>) {
        self.0.insert(container.into(), digest.into());
    }

    pub fn get(&self, container: &str) -> Option<&str> {
        self.0.get(container).map(String::as_str)
    }

    pub fn contains(&self, container: &str) -> bool {
        self.0.contains_key(container)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn encode(&self) -> String {
        self.iter()
            .map(|(name, digest)| format!("{}:{}", name, digest))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for DigestMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DigestMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Decoded form of the last-observed-digest annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredDigests {
    Empty,
    /// Bare digest written before containers were tracked by name.
    Legacy(String),
    Tracked(DigestMap),
}

impl StoredDigests {
    pub fn decode(raw: Option<&str>) -> Self {
        let raw = match raw {
            Some(raw) if !raw.is_empty() => raw,
            _ => return StoredDigests::Empty,
        };

        if is_legacy_digest(raw) {
            return StoredDigests::Legacy(raw.to_string());
        }

        let digests: DigestMap = raw
            .split(',')
            .filter_map(|entry| entry.split_once(':'))
            .map(|(name, digest)| (name.trim(), digest.trim()))
            .filter(|(name, digest)| !name.is_empty() && !digest.is_empty())
            .collect();

        if digests.is_empty() {
            StoredDigests::Empty
        } else {
            StoredDigests::Tracked(digests)
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, StoredDigests::Legacy(_))
    }

    /// Attributes a legacy digest to `primary_container`. Any other state is
    /// returned unchanged.
    pub fn migrate_legacy(self, primary_container: &str) -> Self {
        match self {
            StoredDigests::Legacy(digest) => {
                StoredDigests::Tracked([(primary_container, digest)].into_iter().collect())
            }
            other => other,
        }
    }

    /// Two-way diff against freshly resolved digests: a new, changed or
    /// removed container all count as a change. An unmigrated legacy digest
    /// carries no container name, so it never counts as removed.
    pub fn has_changed(&self, current: &DigestMap) -> bool {
        let stored = match self {
            StoredDigests::Tracked(stored) => stored,
            StoredDigests::Empty | StoredDigests::Legacy(_) => return !current.is_empty(),
        };

        let modified = current
            .iter()
            .any(|(name, digest)| stored.get(name) != Some(digest));
        let removed = stored.iter().any(|(name, _)| !current.contains(name));

        modified || removed
    }

    pub fn encode(&self) -> String {
        match self {
            StoredDigests::Empty => String::new(),
            StoredDigests::Legacy(digest) => digest.clone(),
            StoredDigests::Tracked(digests) => digests.encode(),
        }
    }
}

fn is_legacy_digest(raw: &str) -> bool {
    !raw.contains(',')
        && LEGACY_DIGEST_PREFIXES
            .iter()
            .any(|prefix| raw.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> DigestMap {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(StoredDigests::decode(None), StoredDigests::Empty);
        assert_eq!(StoredDigests::decode(Some("")), StoredDigests::Empty);
    }

    #[test]
    fn test_decode_current_format() {
        assert_eq!(
            StoredDigests::decode(Some("nginx:sha256:abc123")),
            StoredDigests::Tracked(map(&[("nginx", "sha256:abc123")]))
        );
        assert_eq!(
            StoredDigests::decode(Some("nginx:sha256:abc123,sidecar:sha256:def456")),
            StoredDigests::Tracked(map(&[
                ("nginx", "sha256:abc123"),
                ("sidecar", "sha256:def456")
            ]))
        );
    }

    #[test]
    fn test_decode_legacy_format() {
        assert_eq!(
            StoredDigests::decode(Some("sha256:legacy123")),
            StoredDigests::Legacy("sha256:legacy123".to_string())
        );
        assert_eq!(
            StoredDigests::decode(Some("sha384:legacy456")),
            StoredDigests::Legacy("sha384:legacy456".to_string())
        );
        assert!(StoredDigests::decode(Some("sha512:abc")).is_legacy());
    }

    #[test]
    fn test_decode_skips_malformed_entries() {
        let decoded = StoredDigests::decode(Some(" nginx : sha256:abc ,garbage,:sha256:x,empty:, "));
        assert_eq!(decoded, StoredDigests::Tracked(map(&[("nginx", "sha256:abc")])));

        assert_eq!(StoredDigests::decode(Some("garbage")), StoredDigests::Empty);
    }

    #[test]
    fn test_encode_sorts_by_container_name() {
        let digests = map(&[
            ("sidecar", "sha256:def"),
            ("nginx", "sha256:abc"),
            ("init-db", "sha256:xyz"),
        ]);
        assert_eq!(
            digests.encode(),
            "init-db:sha256:xyz,nginx:sha256:abc,sidecar:sha256:def"
        );
        assert_eq!(DigestMap::new().encode(), "");
    }

    #[test]
    fn test_encode_is_stable_on_own_output() {
        let raw = "sidecar:sha256:def, nginx:sha256:abc";
        let once = StoredDigests::decode(Some(raw)).encode();
        assert_eq!(once, "nginx:sha256:abc,sidecar:sha256:def");
        assert_eq!(StoredDigests::decode(Some(&once)).encode(), once);
    }

    #[test]
    fn test_migrate_legacy() {
        let migrated = StoredDigests::decode(Some("sha256:abc")).migrate_legacy("nginx");
        assert_eq!(migrated, StoredDigests::Tracked(map(&[("nginx", "sha256:abc")])));

        let tracked = StoredDigests::Tracked(map(&[("nginx", "sha256:abc123")]));
        assert_eq!(tracked.clone().migrate_legacy("other"), tracked);
        assert_eq!(StoredDigests::Empty.migrate_legacy("nginx"), StoredDigests::Empty);
    }

    #[test]
    fn test_has_changed_same_digests() {
        let stored = StoredDigests::Tracked(map(&[("nginx", "sha256:same"), ("sidecar", "sha256:same")]));
        let current = map(&[("nginx", "sha256:same"), ("sidecar", "sha256:same")]);
        assert!(!stored.has_changed(&current));
    }

    #[test]
    fn test_has_changed_modified_added_removed() {
        let stored = StoredDigests::Tracked(map(&[("nginx", "sha256:old")]));
        assert!(stored.has_changed(&map(&[("nginx", "sha256:new")])));

        let stored = StoredDigests::Tracked(map(&[("nginx", "sha256:abc")]));
        assert!(stored.has_changed(&map(&[("nginx", "sha256:abc"), ("sidecar", "sha256:def")])));

        let stored = StoredDigests::Tracked(map(&[("nginx", "sha256:abc"), ("sidecar", "sha256:def")]));
        assert!(stored.has_changed(&map(&[("nginx", "sha256:abc")])));
    }

    #[test]
    fn test_has_changed_from_empty_and_legacy() {
        assert!(StoredDigests::Empty.has_changed(&map(&[("nginx", "sha256:abc")])));
        assert!(!StoredDigests::Empty.has_changed(&DigestMap::new()));

        let legacy = StoredDigests::Legacy("sha256:abc".to_string());
        assert!(!legacy.has_changed(&DigestMap::new()));
        assert!(legacy.has_changed(&map(&[("nginx", "sha256:abc")])));
        assert!(!legacy.migrate_legacy("nginx").has_changed(&map(&[("nginx", "sha256:abc")])));
    }
}
