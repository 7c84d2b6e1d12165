//! Request extractors that reject with the error envelope.
//!
//! axum's own `Json`, `Query` and `Path` answer malformed input with a plain
//! text body; these wrappers report it as a 400 `validation_error`.

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Path, Query, Request},
    http::request::Parts,
    Json,
};
use serde::de::DeserializeOwned;

use super::{ApiError, RequestId};
use crate::StoreError;

pub(super) fn request_id(parts: &Parts) -> RequestId {
    parts.extensions.get::<RequestId>().cloned().unwrap_or_else(|| RequestId(String::new()))
}

fn invalid(rid: &RequestId, message: String) -> ApiError {
    ApiError::from_store(rid, StoreError::Validation(message))
}

/// JSON request body.
pub struct ApiJson<T>(pub T);

/// Query string.
pub struct ApiQuery<T>(pub T);

/// Path parameters.
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let rid = req.extensions().get::<RequestId>().cloned().unwrap_or_else(|| RequestId(String::new()));
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(JsonRejection::MissingJsonContentType(_)) => {
                Err(invalid(&rid, "expected a JSON body with content-type application/json".to_string()))
            }
            Err(rejection) => Err(invalid(&rid, format!("invalid JSON body: {}", rejection.body_text()))),
        }
    }
}

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| Self(value))
            .map_err(|rejection| invalid(&request_id(parts), format!("invalid query string: {}", rejection.body_text())))
    }
}

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Path::<T>::from_request_parts(parts, state)
            .await
            .map(|Path(value)| Self(value))
            .map_err(|rejection| invalid(&request_id(parts), format!("invalid path: {}", rejection.body_text())))
    }
}
