//! JSON body extractor whose rejections use the structured error body.

use crate::error::AppError;
use async_trait::async_trait;
use axum::{
    extract::{FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;

/// Like `axum::Json`, but malformed or mistyped bodies become `AppError::BadRequest`.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
        Ok(JsonBody(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::header::CONTENT_TYPE;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Named {
        name: String,
    }

    fn request(body: &'static str) -> Request {
        Request::builder()
            .method("POST")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn decodes_typed_body() {
        let JsonBody(named) = JsonBody::<Named>::from_request(request(r#"{"name":"orders"}"#), &()).await.unwrap();
        assert_eq!(named.name, "orders");
    }

    #[tokio::test]
    async fn bad_body_is_bad_request() {
        let err = JsonBody::<Named>::from_request(request(r#"{"label":1}"#), &()).await.err().unwrap();
        assert!(matches!(err, AppError::BadRequest(_)));
        let err = JsonBody::<Named>::from_request(request("{not json"), &()).await.err().unwrap();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
