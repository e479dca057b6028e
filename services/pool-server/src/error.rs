//! HTTP mapping of pool errors

use std::collections::BTreeMap;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

/// Pool error on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub identity_pool::Error);

impl From<identity_pool::Error> for ApiError {
    fn from(e: identity_pool::Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    /// 400 `{field: [message]}`.
    pub fn field(field: &str, message: &str) -> Self {
        Self(identity_pool::Error::Validation {
            field: field.to_string(),
            message: message.to_string(),
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            identity_pool::Error::NotFound(detail) => {
                (StatusCode::NOT_FOUND, Json(json!({ "detail": detail }))).into_response()
            }
            identity_pool::Error::Validation { field, message } => {
                let body: BTreeMap<String, Vec<String>> = BTreeMap::from([(field, vec![message])]);
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            e @ (identity_pool::Error::Storage(_) | identity_pool::Error::Encryption(_)) => {
                let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
                error!(request_id = %request_id, error = %e, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "detail": "internal error", "request_id": request_id })),
                )
                    .into_response()
            }
        }
    }
}

/// 404 with `{"detail": detail}`.
pub fn not_found(detail: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "detail": detail }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn validation_maps_to_field_errors() {
        let response = ApiError::field("url", "proxy with this url already exists").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({ "url": ["proxy with this url already exists"] })
        );
    }

    #[tokio::test]
    async fn not_found_maps_to_404_detail() {
        let response =
            ApiError(identity_pool::Error::NotFound("identity 4".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["detail"], "identity 4");
    }

    #[tokio::test]
    async fn storage_error_hides_cause_and_carries_request_id() {
        let response = ApiError(identity_pool::Error::Storage(
            "renaming temp store file: EACCES".into(),
        ))
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert_eq!(json["detail"], "internal error");
        let request_id = json["request_id"].as_str().unwrap();
        assert!(request_id.starts_with("req_"));
        assert!(!json.to_string().contains("EACCES"));
    }
}
