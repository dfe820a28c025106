//! cpm-registry
//!
//! Remote collaborators of the packet lifecycle:
//! - OCI artifact transport (thin `oras` CLI wrapper with retries and
//!   security checks)
//! - referrer discovery and trust scoring (signature / SBOM / provenance)
//! - remote policy hub client
//! - packet registry HTTP client (listing, publish, download)

pub mod hub;
pub mod http;
pub mod oci;
pub mod security;

pub use hub::{HubClient, HubSettings};
pub use oci::{OciClient, OciClientConfig, OciPullResult, OciPushResult, ReferrerReport};
pub use security::{assert_allowlisted, evaluate_trust_report, redact_command_for_log, TrustReport};
