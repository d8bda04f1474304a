use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

use crate::core::error::CoreError;

/// A `CoreError` on its way out as `{"err": message}`.
#[derive(Debug)]
pub(crate) struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(CoreError::Validation(format!("Invalid JSON body: {}", rejection.body_text())))
    }
}

/// Body extractor result; a rejection surfaces through `?` as a 400 envelope.
pub(crate) type JsonBody<T> = Result<Json<T>, JsonRejection>;

pub(crate) fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Authentication(_) => StatusCode::UNAUTHORIZED,
        CoreError::Authorization(_) => StatusCode::FORBIDDEN,
        CoreError::Validation(_) | CoreError::ParameterAlignment { .. } | CoreError::Criteria(_) => {
            StatusCode::BAD_REQUEST
        }
        CoreError::Transport(_) => StatusCode::BAD_GATEWAY,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed ({}): {}", self.0.kind(), self.0);
        } else {
            warn!("Request rejected ({}): {}", self.0.kind(), self.0);
        }
        (status, Json(json!({ "err": self.0.to_string() }))).into_response()
    }
}

pub(crate) type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_error_kind() {
        let cases = [
            (CoreError::authentication_failed(), StatusCode::UNAUTHORIZED),
            (CoreError::access_denied(), StatusCode::FORBIDDEN),
            (
                CoreError::ParameterAlignment {
                    expected: 2,
                    actual: 1,
                },
                StatusCode::BAD_REQUEST,
            ),
            (CoreError::Criteria("x".into()), StatusCode::BAD_REQUEST),
            (CoreError::Transport("down".into()), StatusCode::BAD_GATEWAY),
            (CoreError::NotFound("q".into()), StatusCode::NOT_FOUND),
            (CoreError::Schedule("bad".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err), status, "{}", err.kind());
        }
    }
}
