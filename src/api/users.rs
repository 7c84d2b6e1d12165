use axum::{
    extract::State,
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use super::{fail, Actor, ApiError, ApiJson, ApiPath, ApiQuery, ApiResponse, AppState, MaybeActor, RequestId};
use crate::domain::aggregates::{Permission, Profile, ProfileDraft, ProfileStatus, Role};
use crate::store::{Page, Pagination, ProfileFilter};
use crate::StoreError;

#[derive(Debug, Deserialize)]
pub(in crate::api) struct ListUsersParams {
    pub search: Option<String>,
    pub role: Option<Role>,
    pub status: Option<ProfileStatus>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize, Validate)]
pub(in crate::api) struct CreateUserRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
    #[validate(length(max = 50))]
    pub phone: Option<String>,
    #[validate(length(max = 500))]
    pub address: Option<String>,
    #[validate(length(max = 200))]
    pub company: Option<String>,
    #[serde(default)]
    pub role: Role,
}

pub(in crate::api) async fn list_users(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    actor: Actor,
    ApiQuery(params): ApiQuery<ListUsersParams>,
) -> Result<Json<ApiResponse<Page<Profile>>>, ApiError> {
    actor.require(Permission::ManageUsers).map_err(fail(&rid))?;
    let filter = ProfileFilter {
        search: params.search.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
        role: params.role,
        status: params.status,
        pagination: Pagination::new(params.page, params.limit),
    };
    let page = state.store.list_profiles(&filter).await.map_err(fail(&rid))?;
    Ok(ApiResponse::new(&rid, page))
}

pub(in crate::api) async fn get_user(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<ApiResponse<Profile>>, ApiError> {
    if actor.id() != id {
        actor.require(Permission::ManageUsers).map_err(fail(&rid))?;
    }
    let profile = state
        .store
        .get_profile(id)
        .await
        .map_err(fail(&rid))?
        .ok_or_else(|| ApiError::from_store(&rid, StoreError::profile_not_found(id)))?;
    Ok(ApiResponse::new(&rid, profile))
}

/// POST /api/users: anyone may register as a customer; staff roles are
/// granted by user managers only.
pub(in crate::api) async fn create_user(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    MaybeActor(actor): MaybeActor,
    ApiJson(body): ApiJson<CreateUserRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Profile>>), ApiError> {
    body.validate().map_err(|e| ApiError::from_store(&rid, e.into()))?;
    if body.role != Role::Customer {
        match actor {
            Some(profile) => Actor(profile).require(Permission::ManageUsers).map_err(fail(&rid))?,
            None => return Err(ApiError::from_store(&rid, StoreError::Unauthorized)),
        }
    }

    let profile = Profile::register(ProfileDraft {
        email: body.email,
        first_name: body.first_name,
        last_name: body.last_name,
        phone: body.phone,
        address: body.address,
        company: body.company,
        role: body.role,
    })
    .map_err(|e| ApiError::from_store(&rid, e.into()))?;
    state.store.create_profile(&profile).await.map_err(fail(&rid))?;
    tracing::info!(profile_id = %profile.id, role = %profile.role, "profile created");
    Ok((StatusCode::CREATED, ApiResponse::new(&rid, profile)))
}
