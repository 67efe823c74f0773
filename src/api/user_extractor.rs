use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use std::sync::Arc;

use crate::api::handlers::{api_error, ApiError};
use crate::error::SrmaError;
use crate::model::{Id, UserContext};
use crate::store::traits::Store;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Axum extractor for UserContext from request headers
///
/// The upstream auth layer puts the authenticated user id in `X-User-Id`.
/// The user is loaded from the store so the admin flag is always current.
/// Missing, malformed, unknown or deactivated users are rejected with 401.
#[async_trait]
impl<S> FromRequestParts<Arc<S>> for UserContext
where
    S: Store + 'static,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, store: &Arc<S>) -> Result<Self, Self::Rejection> {
        let user_id = extract_user_id(&parts.headers).ok_or_else(unauthenticated)?;
        let user = store
            .get_user(user_id)
            .await
            .map_err(|e| api_error(e.into()))?
            .filter(|user| user.is_active)
            .ok_or_else(unauthenticated)?;
        Ok(UserContext::from(&user))
    }
}

fn unauthenticated() -> ApiError {
    api_error(SrmaError::Unauthenticated)
}

/// Parse the user id header, ignoring surrounding whitespace
fn extract_user_id(headers: &HeaderMap) -> Option<Id> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|s| s.trim().parse::<Id>().ok())
}
