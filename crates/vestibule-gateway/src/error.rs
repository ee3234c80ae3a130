use axum::extract::{FromRequest, Request};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use tracing::{error, warn};
use vestibule_core::{ErrorClass, VestibuleError};

/// HTTP face of [`VestibuleError`].
///
/// Renders `{"error": code, "message": ..., "retryAfter"?: secs}` and sets
/// `Retry-After` on 429s. Internal errors are logged in full and answered
/// with a generic message.
#[derive(Debug)]
pub struct ApiError(pub VestibuleError);

impl From<VestibuleError> for ApiError {
    fn from(err: VestibuleError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        match err.class() {
            ErrorClass::Internal => error!(error = %err, "Request failed"),
            ErrorClass::Upstream | ErrorClass::Capacity => warn!(error = %err, "Request failed"),
            _ => {}
        }

        let mut body = serde_json::json!({
            "error": err.code(),
            "message": err.public_message(),
        });
        let retry_after = err.retry_after_secs();
        if let Some(secs) = retry_after {
            body["retryAfter"] = secs.into();
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// `Json` extractor whose rejections come back in the gateway's error shape.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(VestibuleError::BadRequest(rejection.body_text()))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn render(err: VestibuleError) -> (StatusCode, Option<String>, serde_json::Value) {
        let response = ApiError(err).into_response();
        let status = response.status();
        let retry = response
            .headers()
            .get(header::RETRY_AFTER)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, retry, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_locked_out_sets_retry_after() {
        let (status, retry, body) = render(VestibuleError::LockedOut {
            retry_after_secs: 840,
        })
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(retry.as_deref(), Some("840"));
        assert_eq!(body["error"], "locked_out");
        assert_eq!(body["retryAfter"], 840);
    }

    #[tokio::test]
    async fn test_internal_detail_is_hidden() {
        let (status, retry, body) =
            render(VestibuleError::Internal("disk on fire at /var/x".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(retry.is_none());
        assert_eq!(body["error"], "internal_error");
        assert!(!body["message"].as_str().unwrap().contains("/var/x"));
        assert!(body.get("retryAfter").is_none());
    }

    #[tokio::test]
    async fn test_config_mismatch_is_503() {
        let (status, _, body) =
            render(VestibuleError::ConfigMismatch("redirect loop".into())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "config_mismatch");
    }
}
