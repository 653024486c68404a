use thiserror::Error;

/// Errors related to the core types of the resolver.
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("invalid route key: {0}")]
    InvalidRouteKey(String),
}

/// Errors surfaced by the backing store behind the narrow read/write
/// interface. Both variants feed circuit-breaker failure accounting.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("backing store timed out: {0}")]
    Timeout(String),
    #[error("backing store unavailable: {0}")]
    Backend(String),
}
