//! Request context from headers: `X-Tenant-ID` (required), `X-User-ID`, `X-User-Role`.

use crate::error::AppError;
use crate::service::RequestContext;
use crate::tenant::validate_tenant_id;
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};

pub const TENANT_ID_HEADER: &str = "X-Tenant-ID";
pub const USER_ID_HEADER: &str = "X-User-ID";
pub const USER_ROLE_HEADER: &str = "X-User-Role";

pub const DEFAULT_USER: &str = "anonymous";
pub const DEFAULT_ROLE: &str = "user";

fn header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = header(parts, TENANT_ID_HEADER)
            .ok_or_else(|| AppError::BadRequest(format!("missing {} header", TENANT_ID_HEADER)))?;
        validate_tenant_id(&tenant_id)?;
        Ok(RequestContext {
            tenant_id,
            user_id: header(parts, USER_ID_HEADER).unwrap_or_else(|| DEFAULT_USER.into()),
            role: header(parts, USER_ROLE_HEADER).unwrap_or_else(|| DEFAULT_ROLE.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(req: Request<()>) -> Result<RequestContext, AppError> {
        let (mut parts, _) = req.into_parts();
        RequestContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn defaults_user_and_role() {
        let ctx = extract(Request::builder().header(TENANT_ID_HEADER, "acme").body(()).unwrap())
            .await
            .unwrap();
        assert_eq!(ctx, RequestContext::new("acme", DEFAULT_USER, DEFAULT_ROLE));
    }

    #[tokio::test]
    async fn tenant_is_required_and_checked() {
        assert!(matches!(
            extract(Request::builder().body(()).unwrap()).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            extract(Request::builder().header(TENANT_ID_HEADER, "Acme Corp").body(()).unwrap()).await,
            Err(AppError::BadRequest(_))
        ));
    }
}
