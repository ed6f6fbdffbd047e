use std::fmt;

use crate::api::ErrorMessage;

pub(crate) type Result<T, E = ClusterError> = std::result::Result<T, E>;

/// Failure reported by the artifact store or service registry.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// An artifact with this name already exists.
    #[error("artifact name already in use: {0}")]
    NameConflict(String),

    /// The addressed object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The service changed since its version index was read.
    #[error("service {service} changed since version {version} was read")]
    VersionConflict { service: String, version: u64 },

    /// Any other non-2xx engine response.
    #[error("engine responded {status}: {message}")]
    Api { status: u16, message: ErrorMessage },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Socket(#[from] hyper::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Decode(#[from] serde_json::Error),
}

impl ClusterError {
    /// Returns true for failures that leave nothing to clean up.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

/// A best-effort side effect that failed without stopping the surrounding operation.
///
/// Returned instead of being dropped so the caller decides how to report it.
#[derive(Debug)]
#[must_use]
pub struct Degraded {
    pub operation: &'static str,
    pub target: String,
    pub error: eyre::Report,
}

impl Degraded {
    pub fn new(
        operation: &'static str,
        target: impl Into<String>,
        error: impl Into<eyre::Report>,
    ) -> Degraded {
        Degraded {
            operation,
            target: target.into(),
            error: error.into(),
        }
    }

    /// Logs the failure at warn level.
    pub fn log(&self) {
        log::warn!("{self}");
    }
}

impl fmt::Display for Degraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {:#}", self.operation, self.target, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_display() {
        let degraded = Degraded::new(
            "delete secret",
            "edge_tls_crt_202401010000",
            ClusterError::NotFound("ktnbjxoalbkvbvedmg1urrz8h".to_owned()),
        );

        assert_eq!(
            degraded.to_string(),
            "delete secret edge_tls_crt_202401010000: not found: ktnbjxoalbkvbvedmg1urrz8h"
        );
    }
}
