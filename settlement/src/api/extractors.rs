//! Custom Axum extractors.
//!
//! - `CurrentUser`: the caller, as identified by the upstream auth layer

use super::error::AppError;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use raffle_core::types::UserId;
use uuid::Uuid;

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "X-User-Id";

/// Authenticated caller.
///
/// Authentication happens upstream; this only reads the `X-User-Id` header
/// the auth layer sets. Requests without a valid id are refused.
///
/// # Example
///
/// ```ignore
/// async fn handler(CurrentUser(user_id): CurrentUser) -> String {
///     format!("Hello {user_id}")
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .map(|uuid| Self(UserId::from_uuid(uuid)))
            .ok_or_else(|| AppError::unauthorized("Missing or invalid X-User-Id header"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<CurrentUser, AppError> {
        let mut builder = Request::builder();
        if let Some(value) = header {
            builder = builder.header(USER_ID_HEADER, value);
        }
        let (mut parts, ()) = builder.body(()).unwrap().into_parts();
        CurrentUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_reads_user_id_header() {
        let id = Uuid::new_v4();
        let CurrentUser(user) = extract(Some(&id.to_string())).await.unwrap();
        assert_eq!(user.as_uuid(), &id);
    }

    #[tokio::test]
    async fn test_missing_or_garbled_header_is_unauthorized() {
        assert!(extract(None).await.is_err());
        assert!(extract(Some("not-a-uuid")).await.is_err());
    }
}
