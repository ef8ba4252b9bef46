use thiserror::Error;

/// Typed failures surfaced at call boundaries. Transport and decode problems
/// inside a meter's own worker loop stay `anyhow` and are retried there; this
/// enum is what crosses module boundaries.
#[derive(Debug, Error)]
pub enum Error {
    /// No registry entry matched the requested classifier.
    #[error("no {0} value")]
    MetricNotFound(String),

    /// A matching entry exists but its last write is older than the allowed age.
    #[error("{value_name} value outdated, changed {age:.2}s ago")]
    MetricOutdated { value_name: String, age: f64 },

    /// Frame or payload did not decode cleanly. Never ignored, never a warning.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Misconfiguration or misuse detected at a construction/call boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Freshness conditions are a normal "no data yet" state for callers like
    /// the charge controller; everything else is a real fault.
    pub fn is_freshness(&self) -> bool {
        matches!(self, Error::MetricNotFound(_) | Error::MetricOutdated { .. })
    }
}
