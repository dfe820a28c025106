//! Flat inner-product vector index.
//!
//! The index is the full vector matrix behind a small versioned header,
//! persisted at the contractual `faiss/index.faiss` path. Vectors are
//! L2-normalized at build time, so inner product equals cosine similarity.
//! Search is brute force; for packet-scale corpora that is the pack-proven
//! approach and keeps the artifact byte-stable.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crate::errors::{CpmError, CpmResult};
use crate::matrix::{dot, Matrix};

const MAGIC: &[u8; 8] = b"CPMFIP01";

/// Index type tag recorded in manifests and lockfiles.
pub const INDEX_TYPE: &str = "flat-ip";

/// In-memory flat inner-product index.
#[derive(Debug, Clone)]
pub struct FlatIpIndex {
    vectors: Matrix,
}

impl FlatIpIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            vectors: Matrix::new(dim),
        }
    }

    /// Build from an existing matrix (rows are the corpus order).
    pub fn from_matrix(vectors: Matrix) -> Self {
        Self { vectors }
    }

    pub fn dim(&self) -> usize {
        self.vectors.dim()
    }

    pub fn ntotal(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn add(&mut self, row: &[f32]) -> CpmResult<()> {
        self.vectors.push_row(row)
    }

    /// Top-k by inner product. Mirrors flat-index conventions: exactly `k`
    /// entries come back, padded with id `-1` when the corpus is smaller.
    pub fn search(&self, query: &[f32], k: usize) -> CpmResult<(Vec<f32>, Vec<i64>)> {
        if query.len() != self.vectors.dim() {
            return Err(CpmError::dim_mismatch(format!(
                "query width {} does not match index dim {}",
                query.len(),
                self.vectors.dim()
            )));
        }
        let k = k.max(1);
        let mut scored: Vec<(f32, i64)> = self
            .vectors
            .rows()
            .enumerate()
            .map(|(i, row)| (dot(query, row), i as i64))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        while scored.len() < k {
            scored.push((f32::MIN, -1));
        }
        Ok(scored.into_iter().map(|(s, i)| (s, i)).unzip())
    }

    /// Persist: magic, u32 LE dim, u64 LE ntotal, f32 LE row-major body.
    pub fn save(&self, path: &Path) -> CpmResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(path)?;
        out.write_all(MAGIC)?;
        out.write_all(&(self.vectors.dim() as u32).to_le_bytes())?;
        out.write_all(&(self.vectors.nrows() as u64).to_le_bytes())?;
        for v in self.vectors.as_flat() {
            out.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn load(path: &Path) -> CpmResult<Self> {
        let mut file = File::open(path)
            .map_err(|e| CpmError::io(format!("unable to open {}: {e}", path.display())))?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)
            .map_err(|_| CpmError::manifest_invalid("index file truncated"))?;
        if &magic != MAGIC {
            return Err(CpmError::manifest_invalid("unrecognized index file header"));
        }
        let mut dim_bytes = [0u8; 4];
        file.read_exact(&mut dim_bytes)
            .map_err(|_| CpmError::manifest_invalid("index file truncated"))?;
        let dim = u32::from_le_bytes(dim_bytes) as usize;
        let mut count_bytes = [0u8; 8];
        file.read_exact(&mut count_bytes)
            .map_err(|_| CpmError::manifest_invalid("index file truncated"))?;
        let ntotal = u64::from_le_bytes(count_bytes) as usize;

        let mut body = Vec::new();
        file.read_to_end(&mut body)?;
        if body.len() != ntotal * dim * 4 {
            return Err(CpmError::manifest_invalid(format!(
                "index body has {} bytes, expected {}",
                body.len(),
                ntotal * dim * 4
            )));
        }
        let mut data = Vec::with_capacity(ntotal * dim);
        for quad in body.chunks_exact(4) {
            data.push(f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]));
        }
        Ok(Self {
            vectors: Matrix::from_flat(dim.max(1), data)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(i: usize, dim: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        v
    }

    #[test]
    fn search_ranks_by_inner_product() {
        let mut idx = FlatIpIndex::new(4);
        for i in 0..4 {
            idx.add(&unit(i, 4)).unwrap();
        }
        let (scores, ids) = idx.search(&unit(2, 4), 2).unwrap();
        assert_eq!(ids[0], 2);
        assert!((scores[0] - 1.0).abs() < 1e-6);
        assert_eq!(scores.len(), 2);
    }

    #[test]
    fn search_pads_with_negative_ids() {
        let mut idx = FlatIpIndex::new(2);
        idx.add(&[1.0, 0.0]).unwrap();
        let (_, ids) = idx.search(&[1.0, 0.0], 3).unwrap();
        assert_eq!(ids, vec![0, -1, -1]);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faiss").join("index.faiss");
        let mut idx = FlatIpIndex::new(3);
        idx.add(&[0.1, 0.2, 0.3]).unwrap();
        idx.add(&[-1.0, 0.5, 0.0]).unwrap();
        idx.save(&path).unwrap();

        let back = FlatIpIndex::load(&path).unwrap();
        assert_eq!(back.dim(), 3);
        assert_eq!(back.ntotal(), 2);
        let (scores, ids) = back.search(&[-1.0, 0.5, 0.0], 1).unwrap();
        assert_eq!(ids[0], 1);
        assert!(scores[0] > 1.0);
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.faiss");
        std::fs::write(&path, b"not an index").unwrap();
        assert!(FlatIpIndex::load(&path).is_err());
    }

    #[test]
    fn search_rejects_wrong_width() {
        let mut idx = FlatIpIndex::new(3);
        idx.add(&[0.0, 0.0, 1.0]).unwrap();
        assert!(idx.search(&[1.0, 0.0], 1).is_err());
    }
}
