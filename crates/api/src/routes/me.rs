//! Identity routes for the authenticated caller

use axum::{extract::State, Extension, Json};
use serde::Serialize;
use stratix_auth::VerifiedIdentity;
use stratix_shared::{
    AreaId, AssuranceLevel, AuthError, TenantId, UserId, UserIdentity, UserProfile, UserRole,
};

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: UserIdentity,
    pub assurance_level: AssuranceLevel,
    /// `None` until the tenant profile has been provisioned
    pub profile: Option<UserProfile>,
}

#[derive(Debug, Serialize)]
pub struct AssuranceResponse {
    pub current: AssuranceLevel,
    pub required_for_sensitive: AssuranceLevel,
    pub step_up_required: bool,
}

#[derive(Debug, Serialize)]
pub struct SecurityOverview {
    pub user_id: UserId,
    pub email: String,
    pub assurance_level: AssuranceLevel,
    pub tenant_id: TenantId,
    pub role: UserRole,
    pub area_id: Option<AreaId>,
    pub is_active: bool,
    pub sees_all_areas: bool,
}

/// Server-verified identity plus the cached tenant profile
pub async fn me(
    State(state): State<AppState>,
    Extension(identity): Extension<VerifiedIdentity>,
) -> ApiResult<Json<MeResponse>> {
    let profile = match state.profiles.resolve(identity.user_id()).await {
        Ok(profile) => Some(profile),
        Err(AuthError::ProfileNotFound) => None,
        Err(e) => return Err(e.into()),
    };

    Ok(Json(MeResponse {
        assurance_level: identity.assurance_level(),
        user: identity.into_identity(),
        profile,
    }))
}

/// Assurance level of the presented session
pub async fn assurance(
    Extension(identity): Extension<VerifiedIdentity>,
) -> Json<AssuranceResponse> {
    let current = identity.assurance_level();
    Json(AssuranceResponse {
        current,
        required_for_sensitive: AssuranceLevel::Aal2,
        step_up_required: !current.satisfies(AssuranceLevel::Aal2),
    })
}

/// Account security summary. Mounted behind the Aal2 gate.
pub async fn security_overview(
    State(state): State<AppState>,
    Extension(identity): Extension<VerifiedIdentity>,
) -> ApiResult<Json<SecurityOverview>> {
    let profile = state.profiles.resolve(identity.user_id()).await?;

    Ok(Json(SecurityOverview {
        user_id: identity.user_id(),
        email: identity.email().to_string(),
        assurance_level: identity.assurance_level(),
        tenant_id: profile.tenant_id,
        role: profile.role,
        area_id: profile.area_id,
        is_active: profile.is_active,
        sees_all_areas: profile.is_active && profile.role.sees_all_areas(),
    }))
}
