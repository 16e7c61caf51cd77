//! Tenant-scoped profile storage
//!
//! Profiles are provisioned outside this subsystem; here they are read and
//! their display fields patched. `PgProfileStore` reads the `user_profiles`
//! table, `MemoryProfileStore` backs development mode and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use stratix_shared::{AreaId, AuthError, ProfilePatch, TenantId, UserId, UserProfile, UserRole};
use uuid::Uuid;

/// Profile persistence consumed by the profile cache and the lifecycle manager
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn fetch_profile(&self, user_id: UserId) -> Result<UserProfile, AuthError>;

    /// Apply `patch` and return the stored result
    async fn update_profile(
        &self,
        user_id: UserId,
        patch: &ProfilePatch,
    ) -> Result<UserProfile, AuthError>;
}

// =============================================================================
// Postgres
// =============================================================================

#[derive(Debug, FromRow)]
struct ProfileRow {
    user_id: Uuid,
    tenant_id: Uuid,
    role: String,
    area_id: Option<Uuid>,
    is_active: bool,
    full_name: String,
    email: String,
    avatar_url: Option<String>,
    phone: Option<String>,
}

impl TryFrom<ProfileRow> for UserProfile {
    type Error = AuthError;

    fn try_from(row: ProfileRow) -> Result<Self, Self::Error> {
        let role: UserRole = row.role.parse().map_err(|e: String| {
            tracing::error!(
                user_id = %row.user_id,
                role = %row.role,
                "Unknown role in user_profiles"
            );
            AuthError::Unexpected(e)
        })?;

        Ok(UserProfile {
            user_id: UserId(row.user_id),
            tenant_id: TenantId(row.tenant_id),
            role,
            area_id: row.area_id.map(AreaId),
            is_active: row.is_active,
            full_name: row.full_name,
            email: row.email,
            avatar_url: row.avatar_url,
            phone: row.phone,
        })
    }
}

fn database_error(user_id: UserId, err: sqlx::Error) -> AuthError {
    tracing::error!(user_id = %user_id, error = %err, "Profile query failed");
    AuthError::Unexpected(format!("profile store: {}", err))
}

/// Profile store over the `user_profiles` table
#[derive(Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn fetch_profile(&self, user_id: UserId) -> Result<UserProfile, AuthError> {
        let row = sqlx::query_as::<_, ProfileRow>(
            r#"
            SELECT user_id, tenant_id, role, area_id, is_active,
                   full_name, email, avatar_url, phone
            FROM user_profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| database_error(user_id, e))?;

        row.ok_or(AuthError::ProfileNotFound)?.try_into()
    }

    async fn update_profile(
        &self,
        user_id: UserId,
        patch: &ProfilePatch,
    ) -> Result<UserProfile, AuthError> {
        let row = sqlx::query_as::<_, ProfileRow>(
            r#"
            UPDATE user_profiles
            SET full_name = COALESCE($2, full_name),
                avatar_url = COALESCE($3, avatar_url),
                phone = COALESCE($4, phone),
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING user_id, tenant_id, role, area_id, is_active,
                      full_name, email, avatar_url, phone
            "#,
        )
        .bind(user_id.0)
        .bind(patch.full_name.as_deref())
        .bind(patch.avatar_url.as_deref())
        .bind(patch.phone.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| database_error(user_id, e))?;

        row.ok_or(AuthError::ProfileNotFound)?.try_into()
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Profile store held in process memory
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<HashMap<UserId, UserProfile>>,
    fetches: AtomicUsize,
    failing: AtomicBool,
    latency: Option<Duration>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated lookup latency, applied after the profile is read
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, UserProfile>> {
        self.profiles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, profile: UserProfile) {
        self.lock().insert(profile.user_id, profile);
    }

    pub fn get(&self, user_id: UserId) -> Option<UserProfile> {
        self.lock().get(&user_id).cloned()
    }

    /// Number of `fetch_profile` calls served
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Make every lookup fail until switched off again
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn fetch_profile(&self, user_id: UserId) -> Result<UserProfile, AuthError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let result = if self.failing.load(Ordering::SeqCst) {
            Err(AuthError::Unexpected("profile store unavailable".to_string()))
        } else {
            self.get(user_id).ok_or(AuthError::ProfileNotFound)
        };

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        result
    }

    async fn update_profile(
        &self,
        user_id: UserId,
        patch: &ProfilePatch,
    ) -> Result<UserProfile, AuthError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuthError::Unexpected("profile store unavailable".to_string()));
        }

        let mut profiles = self.lock();
        let profile = profiles
            .get_mut(&user_id)
            .ok_or(AuthError::ProfileNotFound)?;
        profile.apply(patch);
        Ok(profile.clone())
    }
}
