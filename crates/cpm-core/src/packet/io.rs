//! Readers/writers for packet artifacts: docs.jsonl, vectors.f16.bin,
//! manifest.json, cpm.yml and checksums.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::determinism::{sha256_file_hex, sha256_hex};
use crate::errors::{CpmError, CpmResult};
use crate::matrix::Matrix;
use crate::model::{Checksum, DocChunk, PacketInfo, PacketManifest};

/// One line of `docs.jsonl`: the chunk plus its content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocRecord {
    pub id: String,
    pub text: String,
    pub hash: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl DocRecord {
    pub fn from_chunk(chunk: &DocChunk) -> Self {
        Self {
            id: chunk.id.clone(),
            text: chunk.text.clone(),
            hash: sha256_hex(chunk.text.as_bytes()),
            metadata: chunk.metadata.clone(),
        }
    }

    pub fn into_chunk(self) -> DocChunk {
        DocChunk {
            id: self.id,
            text: self.text,
            metadata: self.metadata,
        }
    }
}

/// Write chunks as JSONL, one record per line, with `hash = sha256(text)`.
pub fn write_docs_jsonl(chunks: &[DocChunk], path: &Path) -> CpmResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(path)?);
    for chunk in chunks {
        let record = DocRecord::from_chunk(chunk);
        serde_json::to_writer(&mut out, &record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Read `docs.jsonl` records. Blank lines are skipped; malformed lines fail.
pub fn read_docs_jsonl(path: &Path) -> CpmResult<Vec<DocRecord>> {
    let file = File::open(path)
        .map_err(|e| CpmError::io(format!("unable to open {}: {e}", path.display())))?;
    let mut records = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: DocRecord = serde_json::from_str(trimmed).map_err(|e| {
            CpmError::serialization(format!(
                "{}:{}: invalid doc record: {e}",
                path.display(),
                lineno + 1
            ))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Write the vector matrix as row-major little-endian float16.
pub fn write_vectors_f16(matrix: &Matrix, path: &Path) -> CpmResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, matrix.to_f16_bytes())?;
    Ok(())
}

/// Read `vectors.f16.bin` into f32 rows of width `dim`. Rejects lengths not
/// divisible by `dim`.
pub fn read_vectors_f16(path: &Path, dim: usize) -> CpmResult<Matrix> {
    let bytes = fs::read(path)
        .map_err(|e| CpmError::io(format!("unable to read {}: {e}", path.display())))?;
    Matrix::from_f16_bytes(&bytes, dim)
}

/// sha256 checksums for the given relative paths that exist under `root`.
pub fn compute_checksums(root: &Path, relative_paths: &[&str]) -> CpmResult<BTreeMap<String, Checksum>> {
    let mut out = BTreeMap::new();
    for rel in relative_paths {
        let target = root.join(rel);
        if !target.exists() {
            continue;
        }
        let key = rel.replace('\\', "/");
        out.insert(key, Checksum::sha256(sha256_file_hex(&target)?));
    }
    Ok(out)
}

/// Load and validate a packet manifest (unknown keys land in `extras`).
pub fn load_manifest(path: &Path) -> CpmResult<PacketManifest> {
    let raw = fs::read_to_string(path)
        .map_err(|e| CpmError::io(format!("unable to read {}: {e}", path.display())))?;
    let manifest: PacketManifest = serde_json::from_str(&raw)
        .map_err(|e| CpmError::manifest_invalid(format!("{}: {e}", path.display())))?;
    Ok(manifest)
}

pub fn write_manifest(manifest: &PacketManifest, path: &Path) -> CpmResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(manifest)?)?;
    Ok(())
}

pub fn load_packet_info(path: &Path) -> CpmResult<PacketInfo> {
    let raw = fs::read_to_string(path)
        .map_err(|e| CpmError::io(format!("unable to read {}: {e}", path.display())))?;
    let info: PacketInfo = serde_yaml::from_str(&raw)
        .map_err(|e| CpmError::manifest_invalid(format!("{}: {e}", path.display())))?;
    Ok(info)
}

pub fn write_packet_info(info: &PacketInfo, path: &Path) -> CpmResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_yaml::to_string(info)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn docs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs.jsonl");
        let chunks = vec![
            DocChunk::new("a:0", "first").with_meta("path", json!("a.md")),
            DocChunk::new("a:1", "second"),
        ];
        write_docs_jsonl(&chunks, &path).unwrap();

        let records = read_docs_jsonl(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].hash, sha256_hex(b"first"));
        let back: Vec<DocChunk> = records.into_iter().map(DocRecord::into_chunk).collect();
        assert_eq!(back, chunks);
    }

    #[test]
    fn vectors_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.f16.bin");
        let m = Matrix::from_rows(&[vec![0.5, -0.25, 1.0], vec![0.0, 2.0, -1.5]]).unwrap();
        write_vectors_f16(&m, &path).unwrap();

        let back = read_vectors_f16(&path, 3).unwrap();
        assert_eq!(back.nrows(), 2);
        for (a, b) in m.as_flat().iter().zip(back.as_flat()) {
            assert!((a - b).abs() < 1e-3);
        }
        assert!(read_vectors_f16(&path, 4).is_err());
    }

    #[test]
    fn checksums_skip_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present"), "x").unwrap();
        let sums = compute_checksums(dir.path(), &["present", "absent"]).unwrap();
        assert_eq!(sums.len(), 1);
        assert_eq!(sums["present"].algo, "sha256");
    }
}
