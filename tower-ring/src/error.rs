/// Errors produced by the tower-ring middleware.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RingError {
    /// The request exceeded its deadline while waiting for permits or executing.
    ///
    /// When the `axum` feature is enabled, this converts to `408 Request Timeout`.
    #[error("Request timed out waiting for rate limit permits")]
    Timeout,

    /// The inner service was not ready and the request was shed.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Service is overloaded; request shed")]
    Overloaded,

    /// Not enough permits were available and the service is failing fast.
    ///
    /// Permits granted before the rejection are kept by the service and count
    /// towards the next attempt. When the `axum` feature is enabled, this converts
    /// to `429 Too Many Requests` with a `Retry-After` header.
    #[error("Rate limit exceeded; retry after {retry_after:?}")]
    RateLimited {
        /// The time until the limiter may release capacity.
        retry_after: std::time::Duration,
    },

    /// An unexpected error occurred in the inner service.
    ///
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Internal service error: {0}")]
    Inner(String),
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for RingError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self {
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Inner(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut response = (status, self.to_string()).into_response();
        if let Self::RateLimited { retry_after } = self {
            // Retry-After is whole seconds, never advertise zero
            let secs = retry_after.as_secs().max(1);
            response.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                axum::http::HeaderValue::from(secs),
            );
        }
        response
    }
}
