//! cpm-core
//!
//! Core primitives for CPM:
//! - Packet models (manifest, doc chunks, cpm.yml info)
//! - Canonical JSON encoding for deterministic hashing
//! - Version algebra with qualifier semantics
//! - Chunker router with token-budgeted packing
//! - Packet artifact readers/writers (docs, vectors, flat index)
//! - Build pipeline with incremental embedding reuse
//! - Retrieval pipeline with deterministic output hashes
//! - Lockfile schema and verification
//! - Policy evaluation

pub mod build;
pub mod chunk;
pub mod determinism;
pub mod errors;
pub mod lockfile;
pub mod matrix;
pub mod model;
pub mod packet;
pub mod policy;
pub mod retrieve;
pub mod version;

pub use crate::errors::{CpmError, CpmResult};

/// Manifest schema version emitted by the builder.
pub const MANIFEST_SCHEMA_VERSION: &str = "1.0";

/// Lockfile schema version (`lockfileVersion`).
pub const LOCKFILE_VERSION: u64 = 1;

/// Canonical artifact file names inside a packet directory.
/// These must remain stable across versions.
pub mod files {
    pub const MANIFEST: &str = "manifest.json";
    pub const PACKET_INFO: &str = "cpm.yml";
    pub const DOCS: &str = "docs.jsonl";
    pub const VECTORS: &str = "vectors.f16.bin";
    pub const INDEX: &str = "faiss/index.faiss";
    pub const LOCKFILE: &str = "packet.lock.json";
}

/// Convenience re-exports.
pub mod prelude {
    pub use crate::determinism::{canonical_json_bytes, sha256_file_hex, sha256_hex};
    pub use crate::matrix::Matrix;
    pub use crate::model::{DocChunk, EmbeddingSpec, PacketInfo, PacketManifest};
    pub use crate::version::{compare, normalize_latest, parts, VersionKey};
    pub use crate::{CpmError, CpmResult};
}
