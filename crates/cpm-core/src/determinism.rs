//! Deterministic hashing utilities.
//!
//! All content identities in CPM derive from two primitives:
//! - canonical JSON: object keys sorted, `,`/`:` separators, UTF-8, no
//!   trailing newline (default serde formatting is never hashed)
//! - sha256 over bytes or file contents, lowercase hex
//!
//! `directory_tree_hash` combines both: a sorted `rel:sha256` line list over
//! every file below a root, hashed as one payload.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::{CpmError, CpmResult};

/// Lowercase hex sha256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// Lowercase hex sha256 of a file, streamed in 1 MiB chunks.
pub fn sha256_file_hex(path: &Path) -> CpmResult<String> {
    let mut file = File::open(path)
        .map_err(|e| CpmError::io(format!("unable to open {}: {e}", path.display())))?;
    let mut h = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(hex::encode(h.finalize()))
}

/// Encode a JSON value canonically: sorted keys, compact separators.
pub fn canonical_json_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Canonical JSON as UTF-8 bytes.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    canonical_json_string(value).into_bytes()
}

/// sha256 of the canonical encoding of any serializable value.
pub fn hash_canonical<T: Serialize>(value: &T) -> CpmResult<String> {
    let v = serde_json::to_value(value)
        .map_err(|e| CpmError::serialization(format!("canonical hash input: {e}")))?;
    Ok(sha256_hex(&canonical_json_bytes(&v)))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            // Scalars already have a single serde_json encoding.
            out.push_str(&serde_json::to_string(value).expect("scalar encoding"));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).expect("key encoding"));
                out.push(':');
                write_canonical(&map[k], out);
            }
            out.push('}');
        }
    }
}

/// Posix-slashed relative path.
pub fn normalize_rel_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Hash every file under `root` as `"{rel}:{sha256}"` lines joined by `\n`,
/// sorted by relative path, then sha256 the payload.
pub fn directory_tree_hash(root: &Path) -> CpmResult<String> {
    let mut entries: Vec<(String, String)> = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| CpmError::io(format!("walk {}: {e}", root.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| CpmError::invariant(format!("walk escaped root: {e}")))?;
        entries.push((normalize_rel_path(rel), sha256_file_hex(entry.path())?));
    }
    entries.sort();
    let payload = entries
        .iter()
        .map(|(rel, digest)| format!("{rel}:{digest}"))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(sha256_hex(payload.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sha256_stable() {
        assert_eq!(sha256_hex(b"abc"), sha256_hex(b"abc"));
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn canonical_sorts_keys_and_compacts() {
        let v = json!({"b": 1, "a": {"z": [1, 2], "y": "x"}});
        assert_eq!(
            canonical_json_string(&v),
            r#"{"a":{"y":"x","z":[1,2]},"b":1}"#
        );
    }

    #[test]
    fn canonical_hash_is_order_independent() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(
            sha256_hex(&canonical_json_bytes(&a)),
            sha256_hex(&canonical_json_bytes(&b))
        );
    }

    #[test]
    fn tree_hash_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "two").unwrap();
        let h1 = directory_tree_hash(dir.path()).unwrap();
        let h2 = directory_tree_hash(dir.path()).unwrap();
        assert_eq!(h1, h2);

        std::fs::write(dir.path().join("a.txt"), "changed").unwrap();
        let h3 = directory_tree_hash(dir.path()).unwrap();
        assert_ne!(h1, h3);
    }
}
