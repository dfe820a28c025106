//! Dense row-major f32 matrix with float16 serialization.
//!
//! Vectors travel through CPM as f32 in memory and little-endian float16 on
//! disk (`vectors.f16.bin`). The matrix is flat: `data.len() == rows * dim`.

use half::f16;

use crate::errors::{CpmError, CpmResult};

/// Row-major dense matrix of f32 values.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    dim: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// An empty matrix with a fixed row width.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    /// Build from a flat buffer. The length must be divisible by `dim`.
    pub fn from_flat(dim: usize, data: Vec<f32>) -> CpmResult<Self> {
        if dim == 0 {
            return Err(CpmError::dim_mismatch("matrix dim must be positive"));
        }
        if data.len() % dim != 0 {
            return Err(CpmError::dim_mismatch(format!(
                "flat length {} is not divisible by dim={dim}",
                data.len()
            )));
        }
        Ok(Self { dim, data })
    }

    /// Build from rows; every row must share the first row's width.
    pub fn from_rows(rows: &[Vec<f32>]) -> CpmResult<Self> {
        let dim = rows.first().map(|r| r.len()).unwrap_or(0);
        if dim == 0 {
            return Ok(Self::new(0));
        }
        let mut data = Vec::with_capacity(rows.len() * dim);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != dim {
                return Err(CpmError::dim_mismatch(format!(
                    "row {i} has width {} but expected {dim}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self { dim, data })
    }

    /// Pre-sized zero matrix, filled via `set_row`.
    pub fn zeros(rows: usize, dim: usize) -> Self {
        Self {
            dim,
            data: vec![0.0; rows * dim],
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nrows(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn set_row(&mut self, i: usize, row: &[f32]) -> CpmResult<()> {
        if row.len() != self.dim {
            return Err(CpmError::dim_mismatch(format!(
                "row width {} does not match dim {}",
                row.len(),
                self.dim
            )));
        }
        self.data[i * self.dim..(i + 1) * self.dim].copy_from_slice(row);
        Ok(())
    }

    pub fn push_row(&mut self, row: &[f32]) -> CpmResult<()> {
        if self.dim == 0 {
            self.dim = row.len();
        }
        if row.len() != self.dim {
            return Err(CpmError::dim_mismatch(format!(
                "row width {} does not match dim {}",
                row.len(),
                self.dim
            )));
        }
        self.data.extend_from_slice(row);
        Ok(())
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dim.max(1))
    }

    pub fn as_flat(&self) -> &[f32] {
        &self.data
    }

    /// Nested `Vec` rows, for JSON payloads.
    pub fn to_nested(&self) -> Vec<Vec<f32>> {
        self.rows().map(|r| r.to_vec()).collect()
    }

    /// In-place L2 normalization of each row (epsilon-guarded).
    pub fn l2_normalize(&mut self) {
        if self.dim == 0 {
            return;
        }
        for row in self.data.chunks_exact_mut(self.dim) {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt() + 1e-12;
            for v in row.iter_mut() {
                *v /= norm;
            }
        }
    }

    /// Serialize as little-endian float16, row-major.
    pub fn to_f16_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() * 2);
        for v in &self.data {
            out.extend_from_slice(&f16::from_f32(*v).to_le_bytes());
        }
        out
    }

    /// Parse little-endian float16 bytes into f32 rows of width `dim`.
    pub fn from_f16_bytes(bytes: &[u8], dim: usize) -> CpmResult<Self> {
        if dim == 0 {
            return Err(CpmError::dim_mismatch("dim must be positive"));
        }
        if bytes.len() % 2 != 0 {
            return Err(CpmError::dim_mismatch("odd byte length for float16 payload"));
        }
        let values = bytes.len() / 2;
        if values % dim != 0 {
            return Err(CpmError::dim_mismatch(format!(
                "vectors length {values} is not divisible by dim={dim}"
            )));
        }
        let mut data = Vec::with_capacity(values);
        for pair in bytes.chunks_exact(2) {
            data.push(f16::from_le_bytes([pair[0], pair[1]]).to_f32());
        }
        Ok(Self { dim, data })
    }
}

/// Inner product of two equal-length slices.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_roundtrip() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(m.nrows(), 2);
        assert_eq!(m.dim(), 2);
        assert_eq!(m.row(1), &[3.0, 4.0]);
    }

    #[test]
    fn rejects_ragged_rows() {
        assert!(Matrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn f16_roundtrip_within_tolerance() {
        let m = Matrix::from_rows(&[vec![0.25, -1.5, 0.33], vec![10.0, 0.0, -0.125]]).unwrap();
        let bytes = m.to_f16_bytes();
        let back = Matrix::from_f16_bytes(&bytes, 3).unwrap();
        for (a, b) in m.as_flat().iter().zip(back.as_flat()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn f16_rejects_bad_lengths() {
        assert!(Matrix::from_f16_bytes(&[0u8; 6], 4).is_err());
        assert!(Matrix::from_f16_bytes(&[0u8; 5], 2).is_err());
    }

    #[test]
    fn normalize_makes_unit_rows() {
        let mut m = Matrix::from_rows(&[vec![3.0, 4.0]]).unwrap();
        m.l2_normalize();
        let norm: f32 = m.row(0).iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
