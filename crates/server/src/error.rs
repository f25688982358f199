use axum::http::StatusCode;

use marketcache_common::{CacheError, UpstreamError};

/// Erros devolvidos pela camada HTTP.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0} query parameter is required")]
    MissingParam(&'static str),
    #[error("invalid {0} parameter")]
    InvalidParam(&'static str),
    #[error(transparent)]
    Market(#[from] CacheError<UpstreamError>),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingParam(_) | ApiError::InvalidParam(_) => StatusCode::BAD_REQUEST,
            ApiError::Market(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type ApiResult = Result<serde_json::Value, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn param_errors_are_bad_request() {
        let err = ApiError::MissingParam("symbol");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "symbol query parameter is required");

        let err = ApiError::InvalidParam("limit");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "invalid limit parameter");
    }

    #[test]
    fn market_errors_are_internal() {
        let err: ApiError = CacheError::<UpstreamError>::Timeout {
            key: "spot_depth:BTCUSDT-10".into(),
            timeout: Duration::from_secs(10),
        }
        .into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("spot_depth:BTCUSDT-10"));
    }
}
