// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Error kinds surfaced at component boundaries.
///
/// Everything except [`EdgeError::FatalIo`] on the persistency root is
/// recovered locally: dropped data increments counters instead of
/// propagating errors up the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    /// Parsing or validation failed; the previous accepted artifact stays in
    /// place.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// An id, key or topic is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// A byte or count limit was reached (raw buffer, stream, spool, output
    /// queue).
    #[error("quota exceeded: {0}")]
    QuotaExceeded(&'static str),

    /// Transport or filesystem error eligible for retry.
    #[error("transient i/o error: {0}")]
    TransientIo(#[source] std::io::Error),

    /// Filesystem error that invalidates a stream or the persistency root.
    #[error("fatal i/o error: {0}")]
    FatalIo(#[source] std::io::Error),

    /// A stop was requested during the operation.
    #[error("cancelled")]
    Cancelled,
}

impl EdgeError {
    pub fn invalid_format(msg: impl Into<String>) -> Self {
        EdgeError::InvalidFormat(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        EdgeError::NotFound(what.into())
    }

    /// True when a retry of the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EdgeError::TransientIo(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_detail() {
        let err = EdgeError::invalid_format("missing decoder_manifest_id");
        assert_eq!(
            err.to_string(),
            "invalid format: missing decoder_manifest_id"
        );
    }

    #[test]
    fn test_transient_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted");
        assert!(EdgeError::TransientIo(io).is_transient());
        assert!(!EdgeError::Cancelled.is_transient());
    }
}
