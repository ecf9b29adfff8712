//! Error rendering for the REST surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use stratus_core::Error;

/// Wrapper rendering a [`stratus_core::Error`] as the wire body
/// `{"type": "error", "error": msg, "code": int}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind().http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_body())).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_maps_to_status_and_body() {
        let response = ApiError(Error::conflict("duplicate name")).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn upgrade_required_is_426() {
        let response = ApiError(Error::upgrade_required("old protocol")).into_response();
        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
    }
}
