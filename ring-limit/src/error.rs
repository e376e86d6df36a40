/// Errors raised while constructing a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The ring needs at least one bucket.
    #[error("bucket count can not be zero")]
    ZeroBuckets,
}
