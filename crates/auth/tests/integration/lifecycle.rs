//! Integration tests for the session lifecycle
//!
//! Drives a `SessionManager` against the in-memory identity provider and
//! profile store, observing state through the snapshot channel.
//!
//! ## Running Tests
//! ```bash
//! cargo test -p stratix-auth --test lifecycle
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stratix_auth::{
    AuthEvent, IdentityProvider, MemoryIdentityProvider, MemoryProfileStore, ProfileCache,
    ProfileStore, RateLimiter, RequestContext, SessionManager, SessionSnapshot, SessionStatus,
    SessionValidator, SignInOptions, TrustGateRefusal,
};
use stratix_shared::{
    AreaId, AssuranceLevel, AuthError, ProfilePatch, SignOutScope, TenantId, UserId, UserProfile,
    UserRole,
};

// ============================================================================
// Test Utilities
// ============================================================================

const EMAIL: &str = "ana@acme.io";
const PASSWORD: &str = "correct horse battery staple";

struct Harness {
    provider: Arc<MemoryIdentityProvider>,
    store: Arc<MemoryProfileStore>,
    cache: Arc<ProfileCache>,
    user_id: UserId,
}

fn profile_for(user_id: UserId, role: UserRole) -> UserProfile {
    UserProfile {
        user_id,
        tenant_id: TenantId::new(),
        role,
        area_id: Some(AreaId::new()),
        is_active: true,
        full_name: "Ana Souza".into(),
        email: EMAIL.into(),
        avatar_url: None,
        phone: None,
    }
}

fn harness() -> Harness {
    let provider = Arc::new(MemoryIdentityProvider::new());
    let store = Arc::new(MemoryProfileStore::new());
    let user_id = provider.add_user(EMAIL, PASSWORD);
    store.insert(profile_for(user_id, UserRole::Manager));
    let cache = Arc::new(ProfileCache::new(store.clone() as Arc<dyn ProfileStore>));

    Harness {
        provider,
        store,
        cache,
        user_id,
    }
}

impl Harness {
    fn manager(&self) -> SessionManager {
        SessionManager::new(self.provider.clone(), self.cache.clone())
    }
}

async fn wait_until(
    manager: &SessionManager,
    condition: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut rx = manager.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(condition))
        .await
        .expect("timed out waiting for session state")
        .expect("session state channel closed")
        .clone();
    snapshot
}

async fn signed_in(h: &Harness) -> SessionManager {
    let manager = h.manager();
    manager.initialize().await.unwrap();
    manager
        .sign_in(EMAIL, PASSWORD, SignInOptions::default())
        .await
        .unwrap();
    wait_until(&manager, |s| s.profile.is_some()).await;
    manager
}

// ============================================================================
// Initialization
// ============================================================================

#[tokio::test]
async fn initialize_runs_once() {
    let h = harness();
    let manager = h.manager();

    let (first, second) = tokio::join!(manager.initialize(), manager.initialize());
    first.unwrap();
    second.unwrap();
    manager.initialize().await.unwrap();

    assert_eq!(h.provider.subscriber_count(), 1);
    assert_eq!(manager.status(), SessionStatus::Unauthenticated);
}

#[tokio::test]
async fn initialize_adopts_existing_session() {
    let h = harness();
    let session = h
        .provider
        .sign_in_with_password(EMAIL, PASSWORD, Default::default())
        .await
        .unwrap();

    let manager = h.manager();
    manager.initialize().await.unwrap();

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Authenticated);
    assert_eq!(snapshot.session, Some(session));
    assert_eq!(snapshot.user.unwrap().id, h.user_id);
    assert_eq!(snapshot.profile.unwrap().role, UserRole::Manager);
    assert!(!snapshot.stale);
}

#[tokio::test]
async fn unavailable_provider_keeps_stale_session() {
    let h = harness();
    let session = h
        .provider
        .sign_in_with_password(EMAIL, PASSWORD, Default::default())
        .await
        .unwrap();
    h.provider.set_unavailable(true);

    let manager = h.manager();
    assert_eq!(
        manager.initialize().await.unwrap_err(),
        AuthError::ProviderUnavailable
    );

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.session, Some(session));
    assert!(snapshot.stale);
    assert_eq!(snapshot.last_error, Some(AuthError::ProviderUnavailable));
}

// ============================================================================
// Sign-in / Sign-out
// ============================================================================

#[tokio::test]
async fn sign_in_transitions_through_event() {
    let h = harness();
    let manager = signed_in(&h).await;

    let snapshot = manager.snapshot();
    assert!(snapshot.is_authenticated());
    assert_eq!(snapshot.user.unwrap().email, EMAIL);
    assert!(manager.has_role(UserRole::Manager));
}

#[tokio::test]
async fn failed_sign_in_leaves_state_untouched() {
    let h = harness();
    let manager = h.manager();
    manager.initialize().await.unwrap();
    let before = manager.snapshot();

    let err = manager
        .sign_in(EMAIL, "wrong", SignInOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err, AuthError::InvalidCredentials);
    assert_eq!(manager.snapshot(), before);
}

#[tokio::test]
async fn unconfirmed_and_unknown_identities() {
    let h = harness();
    h.provider.add_unconfirmed_user("bia@acme.io", "pw");
    let manager = h.manager();

    assert_eq!(
        manager
            .sign_in("bia@acme.io", "pw", SignInOptions::default())
            .await
            .unwrap_err(),
        AuthError::UnverifiedContact
    );
    assert_eq!(
        manager
            .sign_in_with_one_time_code("nobody@acme.io")
            .await
            .unwrap_err(),
        AuthError::IdentityNotFound
    );
    manager.sign_in_with_one_time_code(EMAIL).await.unwrap();
    assert_eq!(h.provider.otp_requests(), vec![EMAIL.to_string()]);
}

#[tokio::test]
async fn repeated_failures_are_throttled() {
    let h = harness();
    let manager = SessionManager::builder(h.provider.clone(), h.cache.clone())
        .failure_limiter(RateLimiter::new())
        .build();

    for _ in 0..3 {
        assert_eq!(
            manager
                .sign_in(EMAIL, "wrong", SignInOptions::default())
                .await
                .unwrap_err(),
            AuthError::InvalidCredentials
        );
    }

    // even the right password is refused until the window passes
    match manager
        .sign_in(EMAIL, PASSWORD, SignInOptions::default())
        .await
        .unwrap_err()
    {
        AuthError::RateLimited { retry_after } => assert!(retry_after > 0 && retry_after <= 3600),
        other => panic!("expected RateLimited, got {:?}", other),
    }
}

#[tokio::test]
async fn sign_out_purges_the_whole_cache() {
    let h = harness();
    let manager = signed_in(&h).await;

    let colleague = UserId::new();
    h.store.insert(profile_for(colleague, UserRole::Analyst));
    h.cache.resolve(colleague).await.unwrap();
    assert_eq!(h.cache.len(), 2);

    manager.sign_out(SignOutScope::Local).await.unwrap();

    assert!(h.cache.is_empty());
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Unauthenticated);
    assert!(snapshot.session.is_none());
    assert!(snapshot.user.is_none());
    assert!(snapshot.profile.is_none());
    assert!(!manager.has_any_role(&[UserRole::Manager]));
}

#[tokio::test]
async fn sign_out_of_other_devices_keeps_local_session() {
    let h = harness();
    let manager = signed_in(&h).await;

    manager.sign_out(SignOutScope::Others).await.unwrap();

    assert!(h.cache.is_empty());
    assert!(manager.snapshot().is_authenticated());
    assert!(manager.session().is_some());
}

#[tokio::test]
async fn sign_out_with_provider_down_still_clears_local_state() {
    let h = harness();
    let manager = signed_in(&h).await;

    h.provider.set_unavailable(true);
    assert_eq!(
        manager.sign_out(SignOutScope::Local).await.unwrap_err(),
        AuthError::ProviderUnavailable
    );

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Unauthenticated);
    assert!(snapshot.session.is_none());
    assert!(snapshot.profile.is_none());
    assert_eq!(snapshot.last_error, Some(AuthError::ProviderUnavailable));
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn global_sign_out_ends_every_session() {
    let h = harness();
    let manager = signed_in(&h).await;
    let ours = manager.session().unwrap();
    let other_device = h
        .provider
        .sign_in_with_password(EMAIL, PASSWORD, Default::default())
        .await
        .unwrap();
    wait_until(&manager, |s| s.session.as_ref() == Some(&other_device)).await;

    manager.sign_out(SignOutScope::Global).await.unwrap();

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Unauthenticated);
    assert!(snapshot.session.is_none());
    assert!(h.cache.is_empty());
    for token in [&ours.access_token, &other_device.access_token] {
        assert!(h.provider.get_user(token).await.is_err());
    }
}

#[tokio::test]
async fn global_sign_out_with_provider_down_clears_local_state() {
    let h = harness();
    let manager = signed_in(&h).await;

    h.provider.set_unavailable(true);
    assert!(manager.sign_out(SignOutScope::Global).await.is_err());
    assert_eq!(manager.snapshot().status, SessionStatus::Unauthenticated);
    assert!(manager.session().is_none());
}

#[tokio::test]
async fn sign_out_forgets_request_history() {
    let h = harness();
    let validator = Arc::new(SessionValidator::new(h.provider.clone()));
    let manager = SessionManager::builder(h.provider.clone(), h.cache.clone())
        .validator(validator.clone())
        .build();
    manager.initialize().await.unwrap();
    manager
        .sign_in(EMAIL, PASSWORD, SignInOptions::default())
        .await
        .unwrap();
    wait_until(&manager, |s| s.profile.is_some()).await;

    let session = manager.session().unwrap();
    let ctx = RequestContext::new(Some("Firefox/128"), Some("203.0.113.7"));
    validator
        .verify_server(Some(&session.access_token), &ctx)
        .await
        .unwrap();
    assert_eq!(validator.anomalies().tracked(), 1);

    manager.sign_out(SignOutScope::Local).await.unwrap();
    assert_eq!(validator.anomalies().tracked(), 0);
}

#[tokio::test]
async fn denied_identity_never_authenticates() {
    let h = harness();
    let validator = SessionValidator::new(h.provider.clone())
        .with_deny_list(&[r"@acme\.io$"])
        .unwrap();
    let manager = SessionManager::builder(h.provider.clone(), h.cache.clone())
        .validator(Arc::new(validator))
        .build();
    manager.initialize().await.unwrap();

    manager
        .sign_in(EMAIL, PASSWORD, SignInOptions::default())
        .await
        .unwrap();
    let snapshot = wait_until(&manager, |s| s.last_error.is_some()).await;

    assert_eq!(snapshot.status, SessionStatus::Unauthenticated);
    assert_eq!(snapshot.last_error, Some(AuthError::NotAuthenticated));
    assert!(snapshot.profile.is_none());
}

// ============================================================================
// Refresh & Updates
// ============================================================================

#[tokio::test]
async fn refresh_replaces_tokens_not_identity() {
    let h = harness();
    let manager = signed_in(&h).await;
    let before = manager.session().unwrap();
    let fetches = h.store.fetch_count();

    manager.refresh_session().await.unwrap();
    let snapshot = wait_until(&manager, |s| {
        s.session
            .as_ref()
            .is_some_and(|session| session.access_token != before.access_token)
    })
    .await;

    assert_eq!(snapshot.user.unwrap().id, h.user_id);
    assert_eq!(snapshot.session.unwrap().issued_at, before.issued_at);
    assert_eq!(h.store.fetch_count(), fetches);
}

#[tokio::test]
async fn refresh_of_revoked_session_signs_out() {
    let h = harness();
    let manager = signed_in(&h).await;
    let session = manager.session().unwrap();

    h.provider.revoke_token(&session.access_token);
    assert_eq!(
        manager.refresh_session().await.unwrap_err(),
        AuthError::SessionExpired
    );

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Unauthenticated);
    assert!(snapshot.session.is_none());
    assert!(snapshot.profile.is_none());
    assert!(!snapshot.stale);
    assert_eq!(snapshot.last_error, Some(AuthError::SessionExpired));
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn refresh_recovers_from_outage() {
    let h = harness();
    let manager = signed_in(&h).await;
    let before = manager.session().unwrap();

    h.provider.set_unavailable(true);
    assert_eq!(
        manager.refresh_session().await.unwrap_err(),
        AuthError::ProviderUnavailable
    );
    let snapshot = manager.snapshot();
    assert!(snapshot.is_authenticated());
    assert!(snapshot.stale);
    assert_eq!(snapshot.last_error, Some(AuthError::ProviderUnavailable));

    h.provider.set_unavailable(false);
    manager.refresh_session().await.unwrap();
    let snapshot = wait_until(&manager, |s| {
        s.session
            .as_ref()
            .is_some_and(|session| session.access_token != before.access_token)
    })
    .await;
    assert!(!snapshot.stale);
    assert!(snapshot.last_error.is_none());
    assert_eq!(snapshot.user.unwrap().id, h.user_id);
}

#[tokio::test]
async fn update_profile_then_resolve_sees_patch() {
    let h = harness();
    let manager = signed_in(&h).await;

    let patch = ProfilePatch {
        full_name: Some("Ana Souza Lima".into()),
        phone: Some("+55 11 91234 5678".into()),
        ..Default::default()
    };
    let updated = manager.update_profile(patch).await.unwrap();

    let resolved = h.cache.resolve(h.user_id).await.unwrap();
    assert_eq!(resolved, updated);
    assert_eq!(resolved.full_name, "Ana Souza Lima");
    assert_eq!(manager.profile().unwrap().full_name, "Ana Souza Lima");
}

#[tokio::test]
async fn user_update_refetches_profile() {
    let h = harness();
    let manager = signed_in(&h).await;
    let fetches = h.store.fetch_count();

    manager
        .update_user_metadata(serde_json::json!({ "locale": "pt-BR" }))
        .await
        .unwrap();
    let snapshot = wait_until(&manager, |s| {
        s.user
            .as_ref()
            .is_some_and(|u| u.metadata["locale"] == "pt-BR")
    })
    .await;

    assert!(snapshot.profile.is_some());
    assert_eq!(h.store.fetch_count(), fetches + 1);
}

// ============================================================================
// MFA
// ============================================================================

#[tokio::test]
async fn mfa_step_up_raises_assurance() {
    let h = harness();
    let manager = signed_in(&h).await;
    let mfa = manager.mfa();

    assert!(mfa.has_required_aal(AssuranceLevel::Aal1).await.unwrap());
    assert!(!mfa.has_required_aal(AssuranceLevel::Aal2).await.unwrap());

    let factor_id = mfa.enroll("Work phone").await.unwrap().factor.id;
    let challenge = mfa.challenge(&factor_id).await.unwrap();
    let code = h.provider.current_code(&factor_id).unwrap();
    let upgraded = mfa.verify(&factor_id, &challenge.id, &code).await.unwrap();

    wait_until(&manager, |s| s.session.as_ref() == Some(&upgraded)).await;
    assert!(!mfa.requires_mfa().await.unwrap());
    assert!(mfa.has_required_aal(AssuranceLevel::Aal2).await.unwrap());
    assert!(mfa.list_factors().await.unwrap()[0].is_verified());

    let exported = mfa
        .with_trust_gate(AssuranceLevel::Aal2, || async { "export.csv" })
        .await;
    assert_eq!(exported, Ok("export.csv"));
}

#[tokio::test]
async fn malformed_code_is_rejected_locally() {
    let h = harness();
    let manager = signed_in(&h).await;
    let mfa = manager.mfa();
    let factor_id = mfa.enroll("phone").await.unwrap().factor.id;
    let challenge = mfa.challenge(&factor_id).await.unwrap();

    assert_eq!(
        mfa.verify(&factor_id, &challenge.id, "12 456").await.unwrap_err(),
        AuthError::MalformedChallengeCode
    );
    assert_eq!(h.provider.verify_calls(), 0);
}

#[tokio::test]
async fn expired_challenge_is_classified() {
    let provider = Arc::new(
        MemoryIdentityProvider::new().with_challenge_ttl(time::Duration::seconds(-1)),
    );
    let store = Arc::new(MemoryProfileStore::new());
    let user_id = provider.add_user(EMAIL, PASSWORD);
    store.insert(profile_for(user_id, UserRole::Analyst));
    let cache = Arc::new(ProfileCache::new(store as Arc<dyn ProfileStore>));
    let manager = SessionManager::new(provider.clone(), cache);
    manager.initialize().await.unwrap();
    manager
        .sign_in(EMAIL, PASSWORD, SignInOptions::default())
        .await
        .unwrap();

    let mfa = manager.mfa();
    let factor_id = mfa.enroll("phone").await.unwrap().factor.id;
    let challenge = mfa.challenge(&factor_id).await.unwrap();
    let code = provider.current_code(&factor_id).unwrap();

    assert_eq!(
        mfa.verify(&factor_id, &challenge.id, &code).await.unwrap_err(),
        AuthError::ChallengeExpired
    );
    assert!(!mfa.list_factors().await.unwrap()[0].is_verified());
}

#[tokio::test]
async fn trust_gate_routes_to_step_up() {
    let h = harness();
    let manager = signed_in(&h).await;
    let mfa = manager.mfa();

    let factor_id = mfa.enroll("phone").await.unwrap().factor.id;
    let challenge = mfa.challenge(&factor_id).await.unwrap();
    let code = h.provider.current_code(&factor_id).unwrap();
    mfa.verify(&factor_id, &challenge.id, &code).await.unwrap();

    // new sign-in: verified factor on record, session back at aal1
    manager.sign_out(SignOutScope::Local).await.unwrap();
    manager
        .sign_in(EMAIL, PASSWORD, SignInOptions::default())
        .await
        .unwrap();
    wait_until(&manager, |s| s.is_authenticated()).await;

    let invoked = AtomicBool::new(false);
    let refusal = mfa
        .with_trust_gate(AssuranceLevel::Aal2, || async {
            invoked.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap_err();

    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(
        refusal,
        TrustGateRefusal::InsufficientAssurance {
            required: AssuranceLevel::Aal2,
            current: AssuranceLevel::Aal1,
            mfa_would_resolve: true,
        }
    );
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn shutdown_stops_applying_events() {
    let h = harness();
    let manager = signed_in(&h).await;
    let before = manager.snapshot();

    manager.shutdown();
    h.provider.emit(AuthEvent::SignedOut);

    for _ in 0..10 {
        if h.provider.subscriber_count() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.provider.subscriber_count(), 0);
    assert_eq!(manager.snapshot(), before);
}

#[tokio::test]
async fn dropping_the_manager_unsubscribes() {
    let h = harness();
    let manager = signed_in(&h).await;
    assert_eq!(h.provider.subscriber_count(), 1);

    drop(manager);
    for _ in 0..10 {
        if h.provider.subscriber_count() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.provider.subscriber_count(), 0);
}
