//! Caller identity.
//!
//! The `x-profile-id` header names the acting profile. Its role decides which
//! operations the request may perform.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use super::extract::request_id;
use super::{ApiError, AppState};
use crate::domain::aggregates::{Permission, Profile};
use crate::StoreError;

pub const PROFILE_HEADER: &str = "x-profile-id";

/// An identified, active caller. Rejects with 401 otherwise.
#[derive(Debug, Clone)]
pub struct Actor(pub Profile);

/// Like [`Actor`], but anonymous requests pass through as `None`.
#[derive(Debug, Clone)]
pub struct MaybeActor(pub Option<Profile>);

impl Actor {
    pub fn require(&self, permission: Permission) -> Result<(), StoreError> {
        if self.0.can(permission) {
            return Ok(());
        }
        tracing::warn!(profile_id = %self.0.id, role = %self.0.role, ?permission, "permission denied");
        Err(StoreError::Forbidden(self.0.role))
    }

    pub fn can(&self, permission: Permission) -> bool { self.0.can(permission) }
    pub fn id(&self) -> Uuid { self.0.id }
}

async fn resolve(parts: &Parts, state: &AppState) -> Result<Option<Profile>, StoreError> {
    let Some(raw) = parts.headers.get(PROFILE_HEADER) else { return Ok(None) };
    let id = raw
        .to_str()
        .ok()
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or(StoreError::Unauthorized)?;
    match state.store.get_profile(id).await? {
        Some(profile) if profile.is_active() => Ok(Some(profile)),
        Some(_) => {
            tracing::warn!(profile_id = %id, "inactive profile attempted a request");
            Err(StoreError::Unauthorized)
        }
        None => Err(StoreError::Unauthorized),
    }
}

#[async_trait]
impl FromRequestParts<AppState> for MaybeActor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        resolve(parts, state).await.map(MaybeActor).map_err(|e| ApiError::from_store(&request_id(parts), e))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        match resolve(parts, state).await {
            Ok(Some(profile)) => Ok(Actor(profile)),
            Ok(None) => Err(ApiError::from_store(&request_id(parts), StoreError::Unauthorized)),
            Err(e) => Err(ApiError::from_store(&request_id(parts), e)),
        }
    }
}
