//! Error in topgroup

/// Sendable error, returned by the external collaborators like aggregators
pub type SendableError = Box<dyn std::error::Error + Send + Sync>;
