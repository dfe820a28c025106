//! Error types for CPM.
//!
//! Every error carries a stable kind usable for exit-code decisions and
//! user-facing tags. Constructors are provided per kind so call sites stay
//! terse and consistent across crates.

use thiserror::Error;

/// Result alias used across the CPM crates.
pub type CpmResult<T> = Result<T, CpmError>;

/// Stable error kinds, grouped by failure domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // Input
    InvalidSpec,
    InvalidVersion,
    MissingRequired,
    InvalidConfig,
    // Resolution
    NotInstalled,
    VersionNotFound,
    PacketNotFound,
    ManifestInvalid,
    // Network
    EmbedUnreachable,
    Timeout,
    RateLimited,
    UpstreamError,
    HubUnreachable,
    // Security
    PolicyDeny,
    TrustBelowThreshold,
    SignatureMissing,
    AllowlistViolation,
    PathTraversal,
    // Integrity
    LockMismatch,
    ArtifactHashMismatch,
    DimMismatch,
    // Runtime
    QueueFull,
    ModelDisabled,
    WorkerCrashed,
    Cancelled,
    // Collision
    FeatureCollision,
    AmbiguousFeature,
    FeatureNotFound,
    // Catch-all
    Io,
    Serialization,
    Invariant,
}

impl ErrorKind {
    /// Stable snake_case code for logs and JSON payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSpec => "invalid_spec",
            Self::InvalidVersion => "invalid_version",
            Self::MissingRequired => "missing_required",
            Self::InvalidConfig => "invalid_config",
            Self::NotInstalled => "not_installed",
            Self::VersionNotFound => "version_not_found",
            Self::PacketNotFound => "packet_not_found",
            Self::ManifestInvalid => "manifest_invalid",
            Self::EmbedUnreachable => "embed_unreachable",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::UpstreamError => "upstream_error",
            Self::HubUnreachable => "hub_unreachable",
            Self::PolicyDeny => "policy_deny",
            Self::TrustBelowThreshold => "trust_below_threshold",
            Self::SignatureMissing => "signature_missing",
            Self::AllowlistViolation => "allowlist_violation",
            Self::PathTraversal => "path_traversal",
            Self::LockMismatch => "lock_mismatch",
            Self::ArtifactHashMismatch => "artifact_hash_mismatch",
            Self::DimMismatch => "dim_mismatch",
            Self::QueueFull => "queue_full",
            Self::ModelDisabled => "model_disabled",
            Self::WorkerCrashed => "worker_crashed",
            Self::Cancelled => "cancelled",
            Self::FeatureCollision => "feature_collision",
            Self::AmbiguousFeature => "ambiguous_feature",
            Self::FeatureNotFound => "feature_not_found",
            Self::Io => "io",
            Self::Serialization => "serialization",
            Self::Invariant => "invariant",
        }
    }
}

/// The CPM error type: a kind plus a human-readable message.
#[derive(Debug, Error)]
#[error("{}: {message}", kind.code())]
pub struct CpmError {
    pub kind: ErrorKind,
    pub message: String,
}

macro_rules! ctor {
    ($name:ident, $kind:ident) => {
        pub fn $name(message: impl Into<String>) -> Self {
            Self {
                kind: ErrorKind::$kind,
                message: message.into(),
            }
        }
    };
}

impl CpmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    ctor!(invalid_spec, InvalidSpec);
    ctor!(invalid_version, InvalidVersion);
    ctor!(missing_required, MissingRequired);
    ctor!(invalid_config, InvalidConfig);
    ctor!(not_installed, NotInstalled);
    ctor!(version_not_found, VersionNotFound);
    ctor!(packet_not_found, PacketNotFound);
    ctor!(manifest_invalid, ManifestInvalid);
    ctor!(embed_unreachable, EmbedUnreachable);
    ctor!(timeout, Timeout);
    ctor!(rate_limited, RateLimited);
    ctor!(upstream, UpstreamError);
    ctor!(hub_unreachable, HubUnreachable);
    ctor!(policy_deny, PolicyDeny);
    ctor!(trust_below_threshold, TrustBelowThreshold);
    ctor!(signature_missing, SignatureMissing);
    ctor!(allowlist_violation, AllowlistViolation);
    ctor!(path_traversal, PathTraversal);
    ctor!(lock_mismatch, LockMismatch);
    ctor!(artifact_hash_mismatch, ArtifactHashMismatch);
    ctor!(dim_mismatch, DimMismatch);
    ctor!(queue_full, QueueFull);
    ctor!(model_disabled, ModelDisabled);
    ctor!(worker_crashed, WorkerCrashed);
    ctor!(cancelled, Cancelled);
    ctor!(feature_collision, FeatureCollision);
    ctor!(ambiguous_feature, AmbiguousFeature);
    ctor!(feature_not_found, FeatureNotFound);
    ctor!(serialization, Serialization);
    ctor!(invariant, Invariant);

    pub fn io(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: message.into(),
        }
    }

    /// Returns true when the error may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::UpstreamError
        )
    }
}

impl From<std::io::Error> for CpmError {
    fn from(e: std::io::Error) -> Self {
        CpmError::io(e.to_string())
    }
}

impl From<serde_json::Error> for CpmError {
    fn from(e: serde_json::Error) -> Self {
        CpmError::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for CpmError {
    fn from(e: serde_yaml::Error) -> Self {
        CpmError::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorKind::LockMismatch.code(), "lock_mismatch");
        assert_eq!(ErrorKind::QueueFull.code(), "queue_full");
    }

    #[test]
    fn display_includes_code_and_message() {
        let e = CpmError::invalid_version("empty version");
        assert_eq!(e.to_string(), "invalid_version: empty version");
    }

    #[test]
    fn retriable_kinds() {
        assert!(CpmError::rate_limited("x").is_retriable());
        assert!(CpmError::timeout("x").is_retriable());
        assert!(!CpmError::policy_deny("x").is_retriable());
    }
}
