//! Common types used across Stratix

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Tenant (company) ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Area (department) ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AreaId(pub Uuid);

impl AreaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AreaId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for AreaId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// =============================================================================
// Sessions & Identity
// =============================================================================

/// How long a session may be kept alive through refreshes.
///
/// Replaces the old "remember me" flag that used to ride along in user
/// metadata. `Standard` sessions stop refreshing after
/// [`SessionDuration::max_lifetime`]; `Extended` sessions last as long as the
/// provider keeps issuing tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionDuration {
    #[default]
    Standard,
    Extended,
}

impl SessionDuration {
    pub fn from_remember_me(remember_me: bool) -> Self {
        if remember_me {
            Self::Extended
        } else {
            Self::Standard
        }
    }

    /// Maximum age of a session before refresh is refused
    pub fn max_lifetime(&self) -> time::Duration {
        match self {
            Self::Standard => time::Duration::hours(12),
            Self::Extended => time::Duration::days(30),
        }
    }
}

/// Provider-issued session. Replaced wholesale on refresh, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub issued_at: OffsetDateTime,
    pub user_id: UserId,
    #[serde(default)]
    pub duration: SessionDuration,
}

impl Session {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// Whether the session has outlived its [`SessionDuration`]
    pub fn exceeds_lifetime_at(&self, now: OffsetDateTime) -> bool {
        now - self.issued_at > self.duration.max_lifetime()
    }
}

/// Sign-out scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignOutScope {
    /// This device only
    #[default]
    Local,
    /// Every device except this one
    Others,
    /// Every device, this one included
    Global,
}

impl SignOutScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Others => "others",
            Self::Global => "global",
        }
    }

    /// Whether the local session ends
    pub fn clears_local(&self) -> bool {
        !matches!(self, Self::Others)
    }
}

/// Identity as confirmed by the identity provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: UserId,
    pub email: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// =============================================================================
// Profiles
// =============================================================================

/// User role within a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Owner,
    Admin,
    Manager,
    Analyst,
}

impl UserRole {
    /// Roles that see every area of their tenant
    pub fn sees_all_areas(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::Admin => write!(f, "admin"),
            Self::Manager => write!(f, "manager"),
            Self::Analyst => write!(f, "analyst"),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "owner" => Ok(Self::Owner),
            "admin" => Ok(Self::Admin),
            "manager" => Ok(Self::Manager),
            "analyst" => Ok(Self::Analyst),
            _ => Err(format!("Invalid user role: {}", s)),
        }
    }
}

/// Tenant-scoped profile, provisioned outside this subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub role: UserRole,
    pub area_id: Option<AreaId>,
    pub is_active: bool,
    pub full_name: String,
    pub email: String,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
}

impl UserProfile {
    /// Apply a display-field patch
    pub fn apply(&mut self, patch: &ProfilePatch) {
        if let Some(full_name) = &patch.full_name {
            self.full_name = full_name.clone();
        }
        if let Some(avatar_url) = &patch.avatar_url {
            self.avatar_url = Some(avatar_url.clone());
        }
        if let Some(phone) = &patch.phone {
            self.phone = Some(phone.clone());
        }
    }
}

/// Partial profile update. Only display fields are user-editable; tenant,
/// role and area belong to provisioning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl ProfilePatch {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none() && self.avatar_url.is_none() && self.phone.is_none()
    }
}

// =============================================================================
// Multi-Factor Authentication
// =============================================================================

/// Authentication assurance level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssuranceLevel {
    Aal1,
    Aal2,
}

impl AssuranceLevel {
    /// Whether this level meets `required`
    pub fn satisfies(&self, required: AssuranceLevel) -> bool {
        *self >= required
    }
}

impl std::fmt::Display for AssuranceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aal1 => write!(f, "aal1"),
            Self::Aal2 => write!(f, "aal2"),
        }
    }
}

impl std::str::FromStr for AssuranceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aal1" => Ok(Self::Aal1),
            "aal2" => Ok(Self::Aal2),
            _ => Err(format!("Invalid assurance level: {}", s)),
        }
    }
}

/// Current assurance level and the level reachable by completing enrolled factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssuranceLevels {
    pub current: AssuranceLevel,
    pub next: AssuranceLevel,
}

impl AssuranceLevels {
    pub fn new(current: AssuranceLevel, next: AssuranceLevel) -> Self {
        Self { current, next }
    }

    /// True exactly when a verified factor exists but has not been used this session
    pub fn requires_mfa(&self) -> bool {
        self.current == AssuranceLevel::Aal1 && self.next == AssuranceLevel::Aal2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactorType {
    Totp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactorStatus {
    Unverified,
    Verified,
}

/// Enrolled second factor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaFactor {
    pub id: String,
    pub factor_type: FactorType,
    pub status: FactorStatus,
    pub friendly_name: Option<String>,
}

impl MfaFactor {
    pub fn is_verified(&self) -> bool {
        self.status == FactorStatus::Verified
    }
}

/// Result of enrolling a TOTP factor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorEnrollment {
    pub factor: MfaFactor,
    /// Base32 shared secret for manual entry
    pub secret: String,
    /// otpauth:// URI
    pub uri: String,
    /// Scannable QR code (data URL)
    pub qr_code: String,
}

/// Short-lived challenge against one factor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaChallenge {
    pub id: String,
    pub factor_id: String,
    #[serde(with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
}

impl MfaChallenge {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }
}

// =============================================================================
// Tests
// =============================================================================
