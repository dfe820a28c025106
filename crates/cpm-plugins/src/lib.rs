//! cpm-plugins
//!
//! Feature registry and plugin system for CPM:
//! - features (commands, builders, retrievers) registered under `group:name`
//!   with collision and ambiguity detection
//! - manifest-driven plugin discovery (`plugin.toml`) with first-wins ids
//! - entrypoints resolved from a host-registered constructor table; plugins
//!   register their features explicitly through the init context
//! - load failures isolate to the offending plugin and roll back the
//!   features it registered
//! - typed synchronous event bus with deterministic delivery

pub mod builtin;
pub mod events;
pub mod loader;
pub mod manifest;
pub mod registry;

pub use events::{Event, EventBus};
pub use loader::{PluginContext, PluginEntrypoint, PluginHost, PluginManager, PluginRecord,
    PluginSource, PluginState};
pub use manifest::PluginManifest;
pub use registry::{FeatureEntry, FeatureKind, FeatureRegistry, FeatureTarget, Retriever};
