//! Deduplicated profile cache
//!
//! Resolves tenant profiles through a [`ProfileStore`], keeping at most one
//! fetch in flight per user. Concurrent callers await the same shared future.
//! Successful results are memoized until invalidated; failures never are.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use stratix_shared::{AuthError, UserId, UserProfile};

use crate::profile_store::ProfileStore;

type SharedFetch = Shared<BoxFuture<'static, Result<UserProfile, AuthError>>>;

enum Slot {
    Ready(UserProfile),
    /// Tagged so a fetch superseded by `invalidate` never installs its result
    Pending { generation: u64, fetch: SharedFetch },
}

/// Process-wide profile cache
pub struct ProfileCache {
    store: Arc<dyn ProfileStore>,
    slots: Mutex<HashMap<UserId, Slot>>,
    generation: AtomicU64,
}

impl ProfileCache {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Backing store, for write-through updates
    pub fn store(&self) -> &Arc<dyn ProfileStore> {
        &self.store
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached profile, joining or starting a fetch when absent
    pub async fn resolve(&self, user_id: UserId) -> Result<UserProfile, AuthError> {
        let (generation, fetch) = {
            let mut slots = self.lock();
            match slots.get(&user_id) {
                Some(Slot::Ready(profile)) => {
                    tracing::debug!(user_id = %user_id, "Profile cache hit");
                    return Ok(profile.clone());
                }
                Some(Slot::Pending { generation, fetch }) => {
                    tracing::debug!(user_id = %user_id, "Joining in-flight profile fetch");
                    (*generation, fetch.clone())
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst);
                    let store = Arc::clone(&self.store);
                    let fetch = async move { store.fetch_profile(user_id).await }
                        .boxed()
                        .shared();
                    slots.insert(
                        user_id,
                        Slot::Pending {
                            generation,
                            fetch: fetch.clone(),
                        },
                    );
                    (generation, fetch)
                }
            }
        };

        let result = fetch.await;

        let mut slots = self.lock();
        let still_current = matches!(
            slots.get(&user_id),
            Some(Slot::Pending { generation: g, .. }) if *g == generation
        );
        if still_current {
            match &result {
                Ok(profile) => {
                    slots.insert(user_id, Slot::Ready(profile.clone()));
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Profile fetch failed");
                    slots.remove(&user_id);
                }
            }
        }
        result
    }

    /// Drop the resolved or in-flight entry for `user_id`
    pub fn invalidate(&self, user_id: UserId) {
        if self.lock().remove(&user_id).is_some() {
            tracing::debug!(user_id = %user_id, "Profile cache entry invalidated");
        }
    }

    /// Drop every entry
    pub fn purge_all(&self) {
        let mut slots = self.lock();
        let purged = slots.len();
        slots.clear();
        tracing::debug!(purged, "Profile cache purged");
    }

    /// Number of resolved and in-flight entries
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
