//! Request extractors

use crate::error::IngestError;
use crate::types::UserId;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

/// Header carrying the caller's user id, set by the authenticating gateway.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller.
///
/// Rejects with `InvalidRequest` when the identity header is missing or not
/// an unsigned integer.
#[derive(Debug, Clone, Copy)]
pub struct UserIdentity(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for UserIdentity
where
    S: Send + Sync,
{
    type Rejection = IngestError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| {
                IngestError::InvalidRequest(format!("missing {} header", USER_ID_HEADER))
            })?
            .to_str()
            .map_err(|_| {
                IngestError::InvalidRequest(format!("{} header is not ASCII", USER_ID_HEADER))
            })?;

        let user = raw.parse::<UserId>().map_err(|_| {
            IngestError::InvalidRequest(format!("invalid {} header: {:?}", USER_ID_HEADER, raw))
        })?;
        Ok(UserIdentity(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<UserIdentity, IngestError> {
        let mut builder = Request::builder().uri("/v1/files");
        if let Some(value) = header {
            builder = builder.header(USER_ID_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        UserIdentity::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_valid_identity() {
        let UserIdentity(user) = extract(Some("42")).await.unwrap();
        assert_eq!(user, UserId(42));
    }

    #[tokio::test]
    async fn test_missing_or_bad_identity() {
        assert!(matches!(
            extract(None).await,
            Err(IngestError::InvalidRequest(_))
        ));
        assert!(matches!(
            extract(Some("alice")).await,
            Err(IngestError::InvalidRequest(_))
        ));
        assert!(extract(Some("-3")).await.is_err());
    }
}
