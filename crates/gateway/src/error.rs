use {
    axum::{
        http::StatusCode,
        response::{IntoResponse, Json, Response},
    },
    serde_json::json,
    tracing::{debug, error},
};

use crate::auth::AuthFailure;

/// Errors surfaced to HTTP callers as `{success: false, error}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("API password is not configured on the server")]
    Configuration,

    #[error("{0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("WhatsApp is not connected, wait for the connection to complete")]
    NotConnected,

    #[error("{0}")]
    DispatchFailed(String),

    #[error("internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Configuration | Self::DispatchFailed(_) | Self::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

impl From<AuthFailure> for ApiError {
    fn from(failure: AuthFailure) -> Self {
        debug!(reason = failure.reason(), "request refused");
        match failure {
            AuthFailure::MissingConfig => Self::Configuration,
            AuthFailure::Missing | AuthFailure::Mismatch => Self::Unauthorized,
        }
    }
}

impl From<chatgate_whatsapp::Error> for ApiError {
    fn from(err: chatgate_whatsapp::Error) -> Self {
        match err {
            chatgate_whatsapp::Error::NotConnected => Self::NotConnected,
            chatgate_whatsapp::Error::DispatchFailed(detail) => Self::DispatchFailed(detail),
            other => {
                error!(error = %other, "unexpected core error");
                Self::Internal
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::Configuration.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ApiError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::NotConnected.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ApiError::DispatchFailed("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn auth_failures_reveal_nothing() {
        assert_eq!(
            ApiError::from(AuthFailure::Mismatch).to_string(),
            ApiError::from(AuthFailure::Missing).to_string()
        );
        assert!(matches!(
            ApiError::from(AuthFailure::MissingConfig),
            ApiError::Configuration
        ));
    }

    #[test]
    fn core_errors_map() {
        assert!(matches!(
            ApiError::from(chatgate_whatsapp::Error::NotConnected),
            ApiError::NotConnected
        ));
        match ApiError::from(chatgate_whatsapp::Error::DispatchFailed("boom".into())) {
            ApiError::DispatchFailed(detail) => assert_eq!(detail, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
