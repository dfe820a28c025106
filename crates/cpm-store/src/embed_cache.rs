//! Persistent embedding cache.
//!
//! Key is `(model, sha256(text))`; values are vectors stored as float16
//! blobs by default. Backend is a single SQLite file in WAL mode with
//! `synchronous=NORMAL`; every operation opens a short-lived connection and
//! operations are serialized by an in-process mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use half::f16;
use rusqlite::{params, Connection};

use cpm_core::determinism::sha256_hex;
use cpm_core::errors::{CpmError, CpmResult};
use cpm_core::matrix::Matrix;

/// Running hit/miss/put counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
}

/// Value dtype stored in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDtype {
    Float16,
    Float32,
}

impl StoreDtype {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Float16 => "float16",
            Self::Float32 => "float32",
        }
    }
}

/// sha256-keyed persistent embedding cache.
pub struct EmbedCache {
    db_path: PathBuf,
    store_dtype: StoreDtype,
    lock: Mutex<()>,
    stats: Mutex<CacheStats>,
}

impl EmbedCache {
    pub fn open(cache_dir: &Path) -> CpmResult<Self> {
        Self::open_with_dtype(cache_dir, StoreDtype::Float16)
    }

    pub fn open_with_dtype(cache_dir: &Path, store_dtype: StoreDtype) -> CpmResult<Self> {
        std::fs::create_dir_all(cache_dir)?;
        let cache = Self {
            db_path: cache_dir.join("embeddings.sqlite"),
            store_dtype,
            lock: Mutex::new(()),
            stats: Mutex::new(CacheStats::default()),
        };
        let conn = cache.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS emb_cache (
                model TEXT NOT NULL,
                h     TEXT NOT NULL,
                dim   INTEGER NOT NULL,
                dtype TEXT NOT NULL,
                vec   BLOB NOT NULL,
                ts    INTEGER NOT NULL,
                PRIMARY KEY (model, h)
            );
            CREATE INDEX IF NOT EXISTS idx_emb_cache_model ON emb_cache(model);",
        )
        .map_err(|e| CpmError::io(format!("cache init: {e}")))?;
        Ok(cache)
    }

    fn connect(&self) -> CpmResult<Connection> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| CpmError::io(format!("cache open: {e}")))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(|e| CpmError::io(format!("cache pragma: {e}")))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA temp_store=MEMORY;")
            .map_err(|e| CpmError::io(format!("cache pragma: {e}")))?;
        Ok(conn)
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock().expect("stats lock")
    }

    /// Hash every text and look the hashes up. Returns the aligned hash list
    /// plus `{input index -> f32 vector}` for hits. Duplicate texts in one
    /// request share a single row.
    pub fn get_many(
        &self,
        model: &str,
        texts: &[String],
    ) -> CpmResult<(Vec<String>, HashMap<usize, Vec<f32>>)> {
        let model = model.trim();
        let hashes: Vec<String> = texts.iter().map(|t| sha256_hex(t.as_bytes())).collect();
        if hashes.is_empty() {
            return Ok((hashes, HashMap::new()));
        }

        let mut by_hash: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, h) in hashes.iter().enumerate() {
            by_hash.entry(h.as_str()).or_default().push(i);
        }
        let mut unique: Vec<&str> = by_hash.keys().copied().collect();
        unique.sort();

        let _guard = self.lock.lock().expect("cache lock");
        let conn = self.connect()?;
        let mut found: HashMap<usize, Vec<f32>> = HashMap::new();

        // SQLite caps host parameters; chunk the IN list.
        for part in unique.chunks(800) {
            let marks = vec!["?"; part.len()].join(",");
            let sql = format!(
                "SELECT h, dim, dtype, vec FROM emb_cache WHERE model=?1 AND h IN ({marks})"
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| CpmError::io(format!("cache select: {e}")))?;
            let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&model];
            for h in part {
                params_vec.push(h);
            }
            let mut rows = stmt
                .query(params_vec.as_slice())
                .map_err(|e| CpmError::io(format!("cache select: {e}")))?;
            while let Some(row) = rows.next().map_err(|e| CpmError::io(format!("cache row: {e}")))? {
                let h: String = row.get(0).map_err(|e| CpmError::io(e.to_string()))?;
                let dim: i64 = row.get(1).map_err(|e| CpmError::io(e.to_string()))?;
                let dtype: String = row.get(2).map_err(|e| CpmError::io(e.to_string()))?;
                let blob: Vec<u8> = row.get(3).map_err(|e| CpmError::io(e.to_string()))?;
                let vector = decode_blob(&blob, dim as usize, &dtype)?;
                if let Some(indices) = by_hash.get(h.as_str()) {
                    for &i in indices {
                        found.insert(i, vector.clone());
                    }
                }
            }
        }

        let mut stats = self.stats.lock().expect("stats lock");
        stats.hits += found.len() as u64;
        stats.misses += (texts.len() - found.len()) as u64;
        Ok((hashes, found))
    }

    /// Upsert vectors for the given hashes (`vectors` row i <-> `hashes[i]`).
    pub fn put_many(
        &self,
        model: &str,
        hashes: &[String],
        vectors: &Matrix,
        now_unix: i64,
    ) -> CpmResult<usize> {
        let model = model.trim();
        if vectors.nrows() != hashes.len() {
            return Err(CpmError::dim_mismatch(format!(
                "{} hashes for {} vector rows",
                hashes.len(),
                vectors.nrows()
            )));
        }
        let dim = vectors.dim();

        let _guard = self.lock.lock().expect("cache lock");
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| CpmError::io(format!("cache tx: {e}")))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO emb_cache(model, h, dim, dtype, vec, ts)
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(model, h) DO UPDATE SET
                         dim=excluded.dim,
                         dtype=excluded.dtype,
                         vec=excluded.vec,
                         ts=excluded.ts",
                )
                .map_err(|e| CpmError::io(format!("cache upsert: {e}")))?;
            for (i, hash) in hashes.iter().enumerate() {
                let blob = encode_row(vectors.row(i), self.store_dtype);
                stmt.execute(params![
                    model,
                    hash,
                    dim as i64,
                    self.store_dtype.as_str(),
                    blob,
                    now_unix
                ])
                .map_err(|e| CpmError::io(format!("cache upsert: {e}")))?;
            }
        }
        tx.commit().map_err(|e| CpmError::io(format!("cache commit: {e}")))?;

        self.stats.lock().expect("stats lock").puts += hashes.len() as u64;
        Ok(hashes.len())
    }

    /// Delete rows whose model is not in `allowed`. An empty allowlist
    /// clears everything.
    pub fn prune_models(&self, allowed: &[String]) -> CpmResult<usize> {
        let allowed: Vec<String> = allowed
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        let _guard = self.lock.lock().expect("cache lock");
        let conn = self.connect()?;
        let removed = if allowed.is_empty() {
            conn.execute("DELETE FROM emb_cache", [])
                .map_err(|e| CpmError::io(format!("cache prune: {e}")))?
        } else {
            let marks = vec!["?"; allowed.len()].join(",");
            let sql = format!("DELETE FROM emb_cache WHERE model NOT IN ({marks})");
            let params_vec: Vec<&dyn rusqlite::ToSql> =
                allowed.iter().map(|m| m as &dyn rusqlite::ToSql).collect();
            conn.execute(&sql, params_vec.as_slice())
                .map_err(|e| CpmError::io(format!("cache prune: {e}")))?
        };
        Ok(removed)
    }

    /// Delete all rows for one model.
    pub fn clear_model(&self, model: &str) -> CpmResult<usize> {
        let _guard = self.lock.lock().expect("cache lock");
        let conn = self.connect()?;
        let removed = conn
            .execute("DELETE FROM emb_cache WHERE model=?1", params![model.trim()])
            .map_err(|e| CpmError::io(format!("cache clear: {e}")))?;
        Ok(removed)
    }

    /// Number of rows for a model (status reporting).
    pub fn count_model(&self, model: &str) -> CpmResult<u64> {
        let _guard = self.lock.lock().expect("cache lock");
        let conn = self.connect()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM emb_cache WHERE model=?1",
                params![model.trim()],
                |row| row.get(0),
            )
            .map_err(|e| CpmError::io(format!("cache count: {e}")))?;
        Ok(count as u64)
    }
}

fn encode_row(row: &[f32], dtype: StoreDtype) -> Vec<u8> {
    match dtype {
        StoreDtype::Float16 => {
            let mut out = Vec::with_capacity(row.len() * 2);
            for v in row {
                out.extend_from_slice(&f16::from_f32(*v).to_le_bytes());
            }
            out
        }
        StoreDtype::Float32 => {
            let mut out = Vec::with_capacity(row.len() * 4);
            for v in row {
                out.extend_from_slice(&v.to_le_bytes());
            }
            out
        }
    }
}

fn decode_blob(blob: &[u8], dim: usize, dtype: &str) -> CpmResult<Vec<f32>> {
    let values: Vec<f32> = match dtype {
        "float16" => blob
            .chunks_exact(2)
            .map(|p| f16::from_le_bytes([p[0], p[1]]).to_f32())
            .collect(),
        "float32" => blob
            .chunks_exact(4)
            .map(|p| f32::from_le_bytes([p[0], p[1], p[2], p[3]]))
            .collect(),
        other => {
            return Err(CpmError::serialization(format!(
                "unknown cache dtype: {other}"
            )))
        }
    };
    if values.len() != dim {
        return Err(CpmError::dim_mismatch(format!(
            "cache row has {} values, expected {dim}",
            values.len()
        )));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: &[Vec<f32>]) -> Matrix {
        Matrix::from_rows(rows).unwrap()
    }

    #[test]
    fn put_then_get_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = EmbedCache::open(tmp.path()).unwrap();
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let (hashes, found) = cache.get_many("m", &texts).unwrap();
        assert!(found.is_empty());

        cache
            .put_many("m", &hashes, &matrix(&[vec![0.5, -1.0], vec![1.5, 0.25]]), 1)
            .unwrap();

        let (_, found) = cache.get_many("m", &texts).unwrap();
        assert_eq!(found.len(), 2);
        assert!((found[&0][0] - 0.5).abs() < 1e-3);
        assert!((found[&1][1] - 0.25).abs() < 1e-3);
        assert_eq!(cache.stats().puts, 2);
    }

    #[test]
    fn duplicate_texts_share_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = EmbedCache::open(tmp.path()).unwrap();
        let texts = vec!["same".to_string(), "same".to_string()];
        let (hashes, _) = cache.get_many("m", &texts).unwrap();
        assert_eq!(hashes[0], hashes[1]);
        cache
            .put_many("m", &hashes[..1].to_vec(), &matrix(&[vec![1.0]]), 1)
            .unwrap();
        let (_, found) = cache.get_many("m", &texts).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn upsert_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = EmbedCache::open(tmp.path()).unwrap();
        let texts = vec!["x".to_string()];
        let (hashes, _) = cache.get_many("m", &texts).unwrap();
        cache.put_many("m", &hashes, &matrix(&[vec![1.0]]), 1).unwrap();
        cache.put_many("m", &hashes, &matrix(&[vec![2.0]]), 2).unwrap();
        let (_, found) = cache.get_many("m", &texts).unwrap();
        assert!((found[&0][0] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn prune_removes_unlisted_models() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = EmbedCache::open(tmp.path()).unwrap();
        let texts = vec!["t".to_string()];
        let (hashes, _) = cache.get_many("keep", &texts).unwrap();
        cache.put_many("keep", &hashes, &matrix(&[vec![1.0]]), 1).unwrap();
        cache.put_many("drop", &hashes, &matrix(&[vec![1.0]]), 1).unwrap();

        let removed = cache.prune_models(&["keep".to_string()]).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.count_model("keep").unwrap(), 1);
        assert_eq!(cache.count_model("drop").unwrap(), 0);
    }
}
