//! Error types for endpoint registration.

/// Errors that can occur while adding or removing implementors.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// None of the implementor's declared capabilities satisfies the one
    /// the endpoint was created with.
    #[error("implementor does not provide capability {required} required by endpoint {endpoint}")]
    CapabilityMismatch { endpoint: String, required: String },

    /// The implementor being removed was never added to this endpoint.
    #[error("implementor is not registered on endpoint {0}")]
    NotRegistered(String),
}
