//! C1: the tagged error taxonomy shared by every component, plus the
//! HTTP-status mapping table from spec §6/§7.

use std::fmt;

/// A single tagged failure. Every public fallible operation in this crate
/// returns a concrete variant of this enum so that the HTTP-status mapping
/// (`Error::status_code`) stays a total function — no error crosses an
/// internal boundary as an opaque, unclassified value.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("vmm error (status {status_code}): {body}")]
    Vmm { status_code: u16, body: String },

    #[error("hypervisor error: {0}")]
    Hypervisor2(String),

    #[error("docker cli error: {0}")]
    DockerCli(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("vsock error: {0}")]
    Vsock(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("path traversal rejected: {path}")]
    PathTraversal { path: String },

    #[error("circuit open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("image pull failed for {reference}: {cause}")]
    ImagePull { reference: String, cause: String },

    #[error("image conversion failed for {reference}: {cause}")]
    ImageConvert { reference: String, cause: String },

    #[error("invalid image reference: {input}")]
    InvalidImageRef { input: String },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("guest port did not become reachable in time: {0}")]
    PortUnavailable(String),
}

impl Error {
    /// Maps a tagged error to the HTTP status code the external HTTP layer
    /// should return, per spec §6's table. This is a total function: every
    /// variant is listed so a new variant added later is a compile error
    /// here, not a silent 500.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Validation(_) | Error::PathTraversal { .. } => 400,
            Error::Timeout(_) => 504,
            Error::Vsock(_) => 502,
            Error::CircuitOpen { .. } | Error::PortUnavailable(_) => 503,
            Error::Vmm { status_code, .. } if (500..600).contains(status_code) => 502,
            Error::Vmm { .. } => 400,
            Error::Hypervisor2(_)
            | Error::DockerCli(_)
            | Error::Runtime(_)
            | Error::ImagePull { .. }
            | Error::ImageConvert { .. }
            | Error::InvalidImageRef { .. }
            | Error::Cache(_) => 500,
        }
    }

    /// The bare tag name, as used in the `{error:{tag, message, ...}}`
    /// envelope and by `retryOn` classifiers.
    pub fn tag(&self) -> &'static str {
        match self {
            Error::Vmm { .. } => "VMM",
            Error::Hypervisor2(_) => "Hypervisor2",
            Error::DockerCli(_) => "DockerCLI",
            Error::NotFound(_) => "NotFound",
            Error::Validation(_) => "Validation",
            Error::Timeout(_) => "Timeout",
            Error::Vsock(_) => "Vsock",
            Error::Runtime(_) => "Runtime",
            Error::PathTraversal { .. } => "PathTraversal",
            Error::CircuitOpen { .. } => "CircuitOpen",
            Error::ImagePull { .. } => "ImagePull",
            Error::ImageConvert { .. } => "ImageConvert",
            Error::InvalidImageRef { .. } => "InvalidImageRef",
            Error::Cache(_) => "Cache",
            Error::PortUnavailable(_) => "PortUnavailable",
        }
    }

    /// Whether a retryable caller should attempt this operation again.
    /// Used as the default `retryOn` predicate for [`crate::resilience::retry::with_retry`].
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::Vsock(_) => true,
            Error::Vmm { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Runtime(e.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Runtime(format!("store: {e}"))
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Error::Runtime(format!("migration: {e}"))
    }
}

/// A structured error envelope matching `{error:{tag, message, ...}}`, for
/// the external HTTP layer to serialize.
#[derive(Debug, serde::Serialize)]
pub struct ErrorEnvelope {
    pub tag: String,
    pub message: String,
    pub status: u16,
}

impl From<&Error> for ErrorEnvelope {
    fn from(err: &Error) -> Self {
        ErrorEnvelope {
            tag: err.tag().to_string(),
            message: err.to_string(),
            status: err.status_code(),
        }
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.tag, self.status, self.message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_timeout_to_504() {
        assert_eq!(Error::Timeout("slow".into()).status_code(), 504);
    }

    #[test]
    fn maps_port_unavailable_to_503_distinct_from_timeout() {
        let err = Error::PortUnavailable("guest port did not come up".into());
        assert_eq!(err.status_code(), 503);
        assert_eq!(err.tag(), "PortUnavailable");
        assert!(!err.is_transient());
    }

    #[test]
    fn maps_path_traversal_to_400() {
        let err = Error::PathTraversal {
            path: "../etc/passwd".into(),
        };
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.tag(), "PathTraversal");
    }

    #[test]
    fn maps_vmm_5xx_to_bad_gateway_and_4xx_to_bad_request() {
        let server_err = Error::Vmm {
            status_code: 500,
            body: "boom".into(),
        };
        assert_eq!(server_err.status_code(), 502);

        let client_err = Error::Vmm {
            status_code: 400,
            body: "bad".into(),
        };
        assert_eq!(client_err.status_code(), 400);
    }
}
