//! Identity routing: inbound credential → tenant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use warden_types::{RejectReason, TenantRegistration, TenantStatus, TenantStore};

use crate::stores::credential_hash;

/// Result of resolving an ingress credential.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The credential maps to an active tenant.
    Resolved(TenantRegistration),
    /// The credential is unknown or the tenant is suspended. Terminal: the
    /// event is dropped before the pipeline, but the ingress still acks.
    Rejected(RejectReason),
}

/// Cache-first tenant resolver.
///
/// Hot lookups hit an in-process map keyed by credential hash; misses fall
/// through to the tenant store (one indexed read). The cache is dropped
/// wholesale by the maintenance task so out-of-band registration changes
/// (new tenants, suspensions) converge within one sweep interval.
pub struct TenantRouter {
    store: Arc<dyn TenantStore>,
    cache: Mutex<HashMap<String, TenantRegistration>>,
}

impl TenantRouter {
    pub fn new(store: Arc<dyn TenantStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a credential to its owning tenant.
    ///
    /// Deterministic for unchanged tenant state: the same credential always
    /// yields the same resolution. Store failures resolve as
    /// `UnknownTenant` — the event is dropped and acked, which the platform
    /// treats as delivered; dropping is preferable to an error response
    /// that would trigger a retry storm against a struggling backend.
    pub async fn resolve(&self, credential: &str) -> Resolution {
        let hash = credential_hash(credential);

        if let Some(registration) = self.cache_get(&hash) {
            return Self::check_status(registration);
        }

        match self.store.resolve(credential).await {
            Ok(Some(registration)) => {
                self.cache_put(hash, registration.clone());
                Self::check_status(registration)
            }
            Ok(None) => Resolution::Rejected(RejectReason::UnknownTenant),
            Err(err) => {
                tracing::error!("tenant store lookup failed: {}", err);
                Resolution::Rejected(RejectReason::UnknownTenant)
            }
        }
    }

    /// Drops all cached registrations. Called periodically so suspensions
    /// applied by the registration collaborator take effect.
    pub fn invalidate(&self) {
        self.lock_cache().clear();
    }

    fn check_status(registration: TenantRegistration) -> Resolution {
        match registration.status {
            TenantStatus::Active => Resolution::Resolved(registration),
            TenantStatus::Suspended => Resolution::Rejected(RejectReason::SuspendedTenant),
        }
    }

    fn cache_get(&self, hash: &str) -> Option<TenantRegistration> {
        self.lock_cache().get(hash).cloned()
    }

    fn cache_put(&self, hash: String, registration: TenantRegistration) {
        self.lock_cache().insert(hash, registration);
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, TenantRegistration>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("tenant cache lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        }
    }
}
