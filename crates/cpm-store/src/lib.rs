//! cpm-store
//!
//! Deterministic local persistence for CPM:
//! - workspace layout (`.cpm` directory hierarchy)
//! - versioned packet store with pins, active markers and pruning
//! - install locks with append-only history snapshots
//! - persistent sha256-keyed embedding cache (SQLite)
//! - content-addressed object cache for fetched query sources

pub mod embed_cache;
pub mod install_lock;
pub mod layout;
pub mod objects;
pub mod packages;

pub use embed_cache::EmbedCache;
pub use install_lock::{read_install_lock, read_install_lock_as_of, write_install_lock, InstallLock};
pub use layout::WorkspaceLayout;
pub use packages::{parse_package_spec, PackageStore, PackageSummary};
