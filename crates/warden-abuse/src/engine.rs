//! The abuse detection engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use warden_audit::{AuditPayload, AuditSink};
use warden_counters::{CounterStore, WindowSpec};
use warden_types::policy::RetryConfig;
use warden_types::{
    AbuseCategory, ActionRequest, ActionSink, EventKind, GroupConfig, InboundEvent,
    MitigationAction,
};

use crate::error::AbuseError;
use crate::executor::execute_with_retry;
use crate::store::{MitigationRecord, MitigationStatus, MitigationStore, NewMitigation};

/// Sub-windows used by the fixed-bucket approximation for flood counting.
const FLOOD_BUCKETS: u32 = 6;

/// Outcome of running one event through the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// No category crossed its limit.
    Clean,
    /// A category crossed its limit and a mitigation was applied.
    Mitigated {
        category: AbuseCategory,
        action: MitigationAction,
        record_id: i64,
    },
    /// A category is above its limit but a mitigation for the same
    /// action+target is already active; the event was counted, nothing new
    /// was applied.
    Suppressed { category: AbuseCategory },
}

/// Returns the abuse categories an event counts toward.
///
/// Edits and callbacks count toward nothing: the original message already
/// counted, and callbacks cannot flood a conversation visible to members.
pub fn qualifying_categories(event: &InboundEvent) -> Vec<AbuseCategory> {
    match event.kind {
        EventKind::Message => {
            let mut categories = vec![AbuseCategory::MessageFlood];
            if event.has_media() {
                categories.push(AbuseCategory::MediaFlood);
            }
            categories
        }
        EventKind::MemberJoined => vec![AbuseCategory::Raid],
        EventKind::EditedMessage | EventKind::MemberLeft | EventKind::Callback => Vec::new(),
    }
}

/// Sliding-window counters plus the mitigation state machine.
///
/// One instance is shared by all pipeline workers. All mutable state lives
/// in the counter store and the mitigation store; the engine itself only
/// holds the expiry timers and a short-lived suppression cache.
pub struct AbuseEngine {
    counters: Arc<dyn CounterStore>,
    store: Arc<dyn MitigationStore>,
    actions: Arc<dyn ActionSink>,
    audit: Arc<dyn AuditSink>,
    retry: RetryConfig,
    /// Pending expiry timers keyed by mitigation record id.
    timers: Arc<Mutex<HashMap<i64, JoinHandle<()>>>>,
    /// Counter keys known to be in Cooldown, with the instant the
    /// suppression lapses. Purely an optimisation: correctness comes from
    /// the store's active-record uniqueness.
    suppressed: Mutex<HashMap<String, Instant>>,
}

impl AbuseEngine {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        store: Arc<dyn MitigationStore>,
        actions: Arc<dyn ActionSink>,
        audit: Arc<dyn AuditSink>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            counters,
            store,
            actions,
            audit,
            retry,
            timers: Arc::new(Mutex::new(HashMap::new())),
            suppressed: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one qualifying event through every category it counts toward.
    ///
    /// Counting is unconditional — events during Cooldown still extend the
    /// window — but the transition into Triggered is edge-triggered: at most
    /// one mitigation per action+target is ever active.
    pub async fn observe(
        &self,
        event: &InboundEvent,
        config: &GroupConfig,
    ) -> Result<Verdict, AbuseError> {
        for category in qualifying_categories(event) {
            let rule = config.rule(category);
            if rule.limit == 0 {
                // limit 0 disables the category for this subject.
                continue;
            }

            let key = self.counter_key(category, event);
            let count = self
                .counters
                .incr_and_get(&key, window_spec(category, rule.window_secs))
                .await?;

            if !crossed(category, count, rule.limit) {
                continue;
            }

            if self.is_suppressed(&key) {
                return Ok(Verdict::Suppressed { category });
            }

            let action = rule.effective_action(category);
            let duration = action
                .is_time_bounded()
                .then(|| Duration::from_secs(rule.mitigation_secs));

            let new = NewMitigation {
                tenant_id: event.tenant_id.clone(),
                subject_id: event.subject_id.clone(),
                actor_id: mitigation_target(action, &event.actor_id),
                action,
                cause: category,
                duration,
            };

            self.audit.record(
                &event.tenant_id,
                AuditPayload::ThresholdCrossed {
                    category,
                    count,
                    limit: rule.limit,
                },
                Some(&event.subject_id),
                Some(&event.actor_id),
            );

            let suppress_for = duration.unwrap_or(Duration::from_secs(rule.window_secs));
            match self.store.insert_active(new).await? {
                Some(record) => {
                    self.suppress(&key, suppress_for);
                    self.apply(&record, duration);
                    return Ok(Verdict::Mitigated {
                        category,
                        action,
                        record_id: record.id,
                    });
                }
                None => {
                    // Another worker or instance got there first.
                    self.suppress(&key, suppress_for);
                    return Ok(Verdict::Suppressed { category });
                }
            }
        }

        Ok(Verdict::Clean)
    }

    /// Manually reverses an active mitigation on behalf of an operator.
    ///
    /// Cancels the pending expiry timer (if any) rather than letting it
    /// fire redundantly. Reversing a record that already expired or was
    /// already reversed is a no-op.
    pub async fn reverse(&self, record_id: i64, operator: &str) -> Result<bool, AbuseError> {
        let Some(record) = self.store.lookup(record_id).await? else {
            return Ok(false);
        };

        if !self
            .store
            .resolve(record_id, MitigationStatus::Reversed)
            .await?
        {
            return Ok(false);
        }

        if let Some(handle) = lock_recovering(&self.timers).remove(&record_id) {
            handle.abort();
        }

        self.execute_reversal(&record).await;
        self.audit.record(
            &record.tenant_id,
            AuditPayload::MitigationReversed {
                action: record.action,
                operator: operator.to_string(),
            },
            Some(&record.subject_id),
            record.actor_id.as_deref(),
        );

        Ok(true)
    }

    /// Rebuilds expiry timers for mitigations that were active when the
    /// process last stopped. Overdue records are expired immediately.
    pub async fn resume_pending(&self) -> Result<usize, AbuseError> {
        let records = self.store.list_active(None).await?;
        let mut resumed = 0;

        for record in records {
            let Some(remaining) = record.remaining_secs else {
                continue;
            };
            let delay = Duration::from_secs(remaining.max(0) as u64);
            tracing::info!(
                record_id = record.id,
                tenant_id = %record.tenant_id,
                remaining_secs = remaining,
                "resuming mitigation expiry timer"
            );
            self.schedule_expiry(&record, delay);
            resumed += 1;
        }

        Ok(resumed)
    }

    /// Aborts all pending expiry timers. Called on graceful shutdown; the
    /// records stay active and timers are rebuilt on the next start.
    pub fn shutdown(&self) {
        let mut timers = lock_recovering(&self.timers);
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// Applies a freshly inserted mitigation: executes the action on a
    /// detached task (retries must not stall the pipeline worker) and
    /// schedules the expiry timer for time-bounded actions.
    fn apply(&self, record: &MitigationRecord, duration: Option<Duration>) {
        self.audit.record(
            &record.tenant_id,
            AuditPayload::MitigationApplied {
                action: record.action,
                cause: record.cause,
                duration_secs: duration.map(|d| d.as_secs()),
            },
            Some(&record.subject_id),
            record.actor_id.as_deref(),
        );

        let request = ActionRequest {
            tenant_id: record.tenant_id.clone(),
            subject_id: record.subject_id.clone(),
            actor_id: record.actor_id.clone(),
            action: record.action,
            duration,
            reverse: false,
        };
        let actions = self.actions.clone();
        let audit = self.audit.clone();
        let retry = self.retry.clone();
        tokio::spawn(async move {
            if let Err(err) = execute_with_retry(&*actions, &request, &retry).await {
                tracing::error!(
                    action = request.action.as_str(),
                    tenant_id = %request.tenant_id,
                    "mitigation execution exhausted retries: {}",
                    err
                );
                audit.record(
                    &request.tenant_id,
                    AuditPayload::MitigationEscalated {
                        action: request.action,
                        attempts: retry.max_attempts,
                        detail: err.to_string(),
                    },
                    Some(&request.subject_id),
                    request.actor_id.as_deref(),
                );
            }
        });

        if let Some(delay) = duration {
            self.schedule_expiry(record, delay);
        }
    }

    /// Spawns the cancellable Cooldown→Normal timer for one record.
    fn schedule_expiry(&self, record: &MitigationRecord, delay: Duration) {
        let store = self.store.clone();
        let actions = self.actions.clone();
        let audit = self.audit.clone();
        let retry = self.retry.clone();
        let timers = self.timers.clone();
        let record = record.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // The resolve gate decides the race against manual reversal:
            // whoever flips the record off 'active' performs the reversal.
            match store.resolve(record.id, MitigationStatus::Expired).await {
                Ok(true) => {
                    let request = ActionRequest {
                        tenant_id: record.tenant_id.clone(),
                        subject_id: record.subject_id.clone(),
                        actor_id: record.actor_id.clone(),
                        action: record.action,
                        duration: None,
                        reverse: true,
                    };
                    if let Err(err) = execute_with_retry(&*actions, &request, &retry).await {
                        tracing::error!(
                            record_id = record.id,
                            "mitigation reversal exhausted retries: {}",
                            err
                        );
                        audit.record(
                            &record.tenant_id,
                            AuditPayload::MitigationEscalated {
                                action: record.action,
                                attempts: retry.max_attempts,
                                detail: err.to_string(),
                            },
                            Some(&record.subject_id),
                            record.actor_id.as_deref(),
                        );
                    }
                    audit.record(
                        &record.tenant_id,
                        AuditPayload::MitigationExpired {
                            action: record.action,
                        },
                        Some(&record.subject_id),
                        record.actor_id.as_deref(),
                    );
                }
                Ok(false) => {
                    // Already reversed out-of-band; the reversal was theirs.
                }
                Err(err) => {
                    tracing::error!(
                        record_id = record.id,
                        "failed to expire mitigation record: {}",
                        err
                    );
                }
            }

            lock_recovering(&timers).remove(&record.id);
        });

        lock_recovering(&self.timers).insert(record.id, handle);
    }

    async fn execute_reversal(&self, record: &MitigationRecord) {
        let request = ActionRequest {
            tenant_id: record.tenant_id.clone(),
            subject_id: record.subject_id.clone(),
            actor_id: record.actor_id.clone(),
            action: record.action,
            duration: None,
            reverse: true,
        };
        if let Err(err) = execute_with_retry(&*self.actions, &request, &self.retry).await {
            tracing::error!(
                record_id = record.id,
                "manual reversal exhausted retries: {}",
                err
            );
            self.audit.record(
                &record.tenant_id,
                AuditPayload::MitigationEscalated {
                    action: record.action,
                    attempts: self.retry.max_attempts,
                    detail: err.to_string(),
                },
                Some(&record.subject_id),
                record.actor_id.as_deref(),
            );
        }
    }

    fn counter_key(&self, category: AbuseCategory, event: &InboundEvent) -> String {
        match category {
            // Raid counts joins per subject regardless of who joins.
            AbuseCategory::Raid => format!(
                "ab:{}:{}:{}",
                category.as_str(),
                event.tenant_id,
                event.subject_id
            ),
            // Flood categories count per actor within the subject.
            AbuseCategory::MessageFlood | AbuseCategory::MediaFlood => format!(
                "ab:{}:{}:{}:{}",
                category.as_str(),
                event.tenant_id,
                event.subject_id,
                event.actor_id
            ),
        }
    }

    fn is_suppressed(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut suppressed = lock_recovering(&self.suppressed);
        match suppressed.get(key).copied() {
            Some(until) if until > now => true,
            Some(_) => {
                suppressed.remove(key);
                false
            }
            None => false,
        }
    }

    fn suppress(&self, key: &str, duration: Duration) {
        let until = Instant::now() + duration;
        lock_recovering(&self.suppressed).insert(key.to_string(), until);
    }
}

/// The window strategy per category: exact timestamps for the low-volume
/// raid category, fixed buckets for the high-volume flood categories.
fn window_spec(category: AbuseCategory, window_secs: u64) -> WindowSpec {
    let window = Duration::from_secs(window_secs);
    match category {
        AbuseCategory::Raid => WindowSpec::Sliding { window },
        AbuseCategory::MessageFlood | AbuseCategory::MediaFlood => WindowSpec::FixedBuckets {
            window,
            buckets: FLOOD_BUCKETS,
        },
    }
}

/// Trigger comparison per category.
///
/// Flood limits are budgets: `limit` qualifying events inside the window
/// are tolerated and the one after crosses. The raid limit is a trigger
/// threshold: the join that reaches it crosses.
fn crossed(category: AbuseCategory, count: u64, limit: u32) -> bool {
    match category {
        AbuseCategory::MessageFlood | AbuseCategory::MediaFlood => count > u64::from(limit),
        AbuseCategory::Raid => count >= u64::from(limit),
    }
}

/// Subject-wide actions carry no actor; actor-targeted actions hit the
/// actor whose event crossed the threshold.
fn mitigation_target(action: MitigationAction, actor_id: &str) -> Option<String> {
    match action {
        MitigationAction::Lock | MitigationAction::Unlock => None,
        _ => Some(actor_id.to_string()),
    }
}

/// Locks a state map, recovering from poisoning. Refusing to operate over
/// a stale map would stall mitigation expiry entirely.
fn lock_recovering<K, V>(
    mutex: &Mutex<HashMap<K, V>>,
) -> std::sync::MutexGuard<'_, HashMap<K, V>> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("abuse engine lock poisoned, recovering with stale state");
            poisoned.into_inner()
        }
    }
}
