//! Content hashing for sync operations.
//!
//! Hashes follow the Git blob convention, `sha1("blob {len}\0" + content)`,
//! so a locally computed hash is directly comparable to the blob id the
//! remote tree reports for the same bytes. "Skip if unchanged" needs no
//! network round trip.

use sha1::{Digest, Sha1};

/// Compute the Git blob id of `content` as lowercase hex.
///
/// # Example
///
/// ```
/// let hash = psync::sync::blob_hash(b"hello\n");
/// assert_eq!(hash, "ce013625030ba8dba906f756967f9e9ca394464a");
/// ```
#[must_use]
pub fn blob_hash(content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", content.len()).as_bytes());
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Check if content has changed since it was last synced.
///
/// Returns `true` if there is no stored hash (never synced) or the current
/// hash differs from it.
#[must_use]
pub fn has_changed(current_hash: &str, stored_hash: Option<&str>) -> bool {
    stored_hash.is_none_or(|h| h != current_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_hash_matches_git() {
        // `printf 'hello\n' | git hash-object --stdin`
        assert_eq!(blob_hash(b"hello\n"), "ce013625030ba8dba906f756967f9e9ca394464a");
        // `git hash-object /dev/null`
        assert_eq!(blob_hash(b""), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn test_blob_hash_deterministic() {
        let content = br#"{"id": "x", "name": "Intake"}"#;
        let hash1 = blob_hash(content);
        let hash2 = blob_hash(content);

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 40); // SHA-1 produces 40 hex chars
    }

    #[test]
    fn test_blob_hash_distinguishes_content() {
        assert_ne!(blob_hash(b"a"), blob_hash(b"b"));
        // Length is part of the header, so a trailing newline matters
        assert_ne!(blob_hash(b"hello"), blob_hash(b"hello\n"));
    }

    #[test]
    fn test_has_changed() {
        assert!(has_changed("abc", None));
        assert!(has_changed("abc", Some("def")));
        assert!(!has_changed("abc", Some("abc")));
    }
}
