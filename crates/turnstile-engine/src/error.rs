use thiserror::Error;
use turnstile_cache::CacheError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Cache(#[from] CacheError),
}
