//! cpm-pool
//!
//! The embedding pool: a long-lived multi-model server that dispatches
//! embedding requests to per-model replica pools, plus the client side of
//! both wire shapes CPM speaks (internal `/embed` and OpenAI-style
//! `/v1/embeddings`).
//!
//! Server pieces:
//! - [`types`]: `pool.yml` model specs and server configuration
//! - [`drivers`]: in-process, HTTP and subprocess embedding drivers
//! - [`runtime`]: per-model queue + autoscaled replica set
//! - [`server`]: the axum HTTP surface with the persistent sha256 cache
//!
//! Client pieces:
//! - [`client`]: `PoolClient`, `OpenAiEmbeddingsClient` and the uniform
//!   batching [`client::EmbeddingClient`] with adaptive shrink

pub mod client;
pub mod drivers;
pub mod runtime;
pub mod server;
pub mod types;

pub use client::{EmbedMode, EmbeddingClient, OpenAiEmbeddingsClient, PoolClient};
pub use runtime::ModelRuntime;
pub use types::{DriverSpec, DriverType, ModelSpec, PoolConfig, PoolFile, QueueSpec, ScalingSpec};
