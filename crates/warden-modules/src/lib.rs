//! Module capability interface and dispatch for the Warden gateway.
//!
//! Implements the typed binding table: `(tenant, match) -> module`, where a
//! match is either a command name or an event kind. Registration detects
//! conflicts eagerly — a second enabled binding for the same match is a
//! configuration error at registration time, never a surprise at dispatch
//! time. Resolution is a table lookup; there is no reflection and no
//! auto-discovery.
//!
//! Dispatch isolates handlers: each invocation runs on its own task with a
//! time box, so a handler that fails, hangs, or panics is reported as a
//! module-level error and never affects other bindings or later events.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use warden_types::{ActionSink, EventKind, GroupConfig, InboundEvent};

/// What a binding matches on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindingKey {
    /// A bot command, lowercased, without the leading slash.
    Command(String),
    /// All events of one kind.
    Kind(EventKind),
}

impl BindingKey {
    /// Canonical string form, as stored in the `module_bindings` table.
    pub fn as_match_key(&self) -> String {
        match self {
            Self::Command(name) => format!("command:{name}"),
            Self::Kind(kind) => format!("kind:{}", kind.as_str()),
        }
    }

    /// Parses the canonical string form.
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(name) = s.strip_prefix("command:") {
            if name.is_empty() {
                return None;
            }
            return Some(Self::Command(name.to_string()));
        }
        let kind = s.strip_prefix("kind:")?;
        let kind = match kind {
            "message" => EventKind::Message,
            "edited_message" => EventKind::EditedMessage,
            "member_joined" => EventKind::MemberJoined,
            "member_left" => EventKind::MemberLeft,
            "callback" => EventKind::Callback,
            _ => return None,
        };
        Some(Self::Kind(kind))
    }

    /// The key an event dispatches under: its command if it carries one,
    /// otherwise its kind.
    pub fn for_event(event: &InboundEvent) -> Self {
        match event.command() {
            Some(command) => Self::Command(command),
            None => Self::Kind(event.kind),
        }
    }
}

impl std::fmt::Display for BindingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_match_key())
    }
}

/// Read-only view and capabilities handed to a module invocation.
///
/// Modules see the subject's configuration and may request platform-level
/// effects through the action sink; they get nothing else.
#[derive(Clone)]
pub struct ModuleContext {
    /// The subject's group configuration.
    pub config: Arc<GroupConfig>,
    /// Capability-scoped sink for platform effects (delete/mute/…).
    pub actions: Arc<dyn ActionSink>,
}

/// What a module did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOutcome {
    /// The module acted on the event.
    Handled,
    /// The module inspected the event and chose to do nothing.
    Ignored,
}

/// Error raised by a module's own logic.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ModuleError(pub String);

/// A handler bound to `(tenant, match)` keys.
#[async_trait::async_trait]
pub trait Module: Send + Sync {
    /// Stable module identifier, matched against a subject's enabled set.
    fn id(&self) -> &str;

    /// Handles one event.
    async fn invoke(
        &self,
        event: &InboundEvent,
        ctx: ModuleContext,
    ) -> Result<ModuleOutcome, ModuleError>;
}

/// Module dispatch failure, isolated per handler.
#[derive(Debug, thiserror::Error)]
pub enum ModuleDispatchError {
    /// The handler exceeded its time box and was cancelled.
    #[error("module '{module_id}' timed out after {timeout_ms} ms")]
    Timeout { module_id: String, timeout_ms: u64 },

    /// The handler panicked; the panic was contained to its task.
    #[error("module '{module_id}' panicked")]
    Panicked { module_id: String },

    /// The handler returned an error.
    #[error("module '{module_id}' failed: {detail}")]
    Failed { module_id: String, detail: String },
}

impl ModuleDispatchError {
    /// The module the failure belongs to.
    pub fn module_id(&self) -> &str {
        match self {
            Self::Timeout { module_id, .. }
            | Self::Panicked { module_id }
            | Self::Failed { module_id, .. } => module_id,
        }
    }
}

/// Outcome of dispatching one event.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// No enabled binding matched; the event passes through. Not an error —
    /// most plain chat messages have no bound handler.
    NoBinding,
    /// The bound module ran to completion.
    Completed(ModuleOutcome),
    /// The bound module failed; the failure is contained here.
    Failed(ModuleDispatchError),
}

/// Error returned when registration would violate the binding invariant.
#[derive(Debug, thiserror::Error)]
#[error("conflicting binding for ({tenant_id}, {match_key}): module '{existing}' already bound")]
pub struct ConflictError {
    pub tenant_id: String,
    pub match_key: String,
    /// The module currently holding the binding.
    pub existing: String,
}

/// The typed binding table.
///
/// Holds only enabled bindings; disabling removes the entry. Lookup is a
/// `HashMap` read under a short `RwLock` — registration is rare,
/// dispatch is constant.
pub struct ModuleRegistry {
    bindings: RwLock<HashMap<(String, String), Arc<dyn Module>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an enabled binding.
    ///
    /// Fails with [`ConflictError`] if the `(tenant, match)` slot already
    /// holds an enabled binding — even for the same module, so a double
    /// registration is caught as the configuration mistake it is.
    pub fn register(
        &self,
        tenant_id: &str,
        key: BindingKey,
        module: Arc<dyn Module>,
    ) -> Result<(), ConflictError> {
        let match_key = key.as_match_key();
        let slot = (tenant_id.to_string(), match_key.clone());

        let mut bindings = self.write_lock();
        if let Some(existing) = bindings.get(&slot) {
            return Err(ConflictError {
                tenant_id: tenant_id.to_string(),
                match_key,
                existing: existing.id().to_string(),
            });
        }
        bindings.insert(slot, module);
        Ok(())
    }

    /// Removes a binding. Returns `false` if none existed.
    pub fn disable(&self, tenant_id: &str, key: &BindingKey) -> bool {
        self.write_lock()
            .remove(&(tenant_id.to_string(), key.as_match_key()))
            .is_some()
    }

    /// Looks up the enabled binding for `(tenant, match)`.
    pub fn lookup(&self, tenant_id: &str, key: &BindingKey) -> Option<Arc<dyn Module>> {
        self.read_lock()
            .get(&(tenant_id.to_string(), key.as_match_key()))
            .cloned()
    }

    /// Lists `(match_key, module_id)` pairs bound for a tenant.
    pub fn bindings_for(&self, tenant_id: &str) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .read_lock()
            .iter()
            .filter(|((tenant, _), _)| tenant == tenant_id)
            .map(|((_, match_key), module)| (match_key.clone(), module.id().to_string()))
            .collect();
        out.sort();
        out
    }

    /// Dispatches one event to its bound module, if any.
    ///
    /// A command event dispatches under its command; anything else under
    /// its kind. A command with no command binding falls back to the
    /// `kind:message` binding so message filters still see it. Modules not
    /// in the subject's enabled set are skipped as if unbound.
    ///
    /// The invocation runs on its own task under `timeout`; errors, panics,
    /// and timeouts all come back as [`DispatchOutcome::Failed`] and never
    /// propagate.
    pub async fn dispatch(
        &self,
        event: &InboundEvent,
        ctx: ModuleContext,
        timeout: Duration,
    ) -> DispatchOutcome {
        let primary = BindingKey::for_event(event);
        let module = self.lookup(&event.tenant_id, &primary).or_else(|| {
            match primary {
                // Fall back from an unbound command to the message binding.
                BindingKey::Command(_) => {
                    self.lookup(&event.tenant_id, &BindingKey::Kind(EventKind::Message))
                }
                BindingKey::Kind(_) => None,
            }
        });

        let Some(module) = module else {
            return DispatchOutcome::NoBinding;
        };

        if !ctx.config.enabled_modules.iter().any(|m| m == module.id()) {
            return DispatchOutcome::NoBinding;
        }

        let module_id = module.id().to_string();
        let event = event.clone();
        let mut handle = tokio::spawn(async move { module.invoke(&event, ctx).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Err(_) => {
                handle.abort();
                DispatchOutcome::Failed(ModuleDispatchError::Timeout {
                    module_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(join_err)) if join_err.is_panic() => {
                DispatchOutcome::Failed(ModuleDispatchError::Panicked { module_id })
            }
            Ok(Err(join_err)) => DispatchOutcome::Failed(ModuleDispatchError::Failed {
                module_id,
                detail: join_err.to_string(),
            }),
            Ok(Ok(Err(err))) => DispatchOutcome::Failed(ModuleDispatchError::Failed {
                module_id,
                detail: err.to_string(),
            }),
            Ok(Ok(Ok(outcome))) => DispatchOutcome::Completed(outcome),
        }
    }

    fn read_lock(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<(String, String), Arc<dyn Module>>> {
        match self.bindings.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("module registry lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        }
    }

    fn write_lock(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<(String, String), Arc<dyn Module>>> {
        match self.bindings.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("module registry lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use warden_types::{ActionError, ActionRequest};

    struct NoopSink;

    #[async_trait::async_trait]
    impl ActionSink for NoopSink {
        async fn execute(&self, _request: &ActionRequest) -> Result<(), ActionError> {
            Ok(())
        }
    }

    /// Module double with configurable behavior.
    struct TestModule {
        id: &'static str,
        invocations: AtomicU32,
        behavior: Behavior,
    }

    enum Behavior {
        Succeed,
        Fail,
        Panic,
        Hang,
    }

    impl TestModule {
        fn new(id: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                id,
                invocations: AtomicU32::new(0),
                behavior,
            })
        }
    }

    #[async_trait::async_trait]
    impl Module for TestModule {
        fn id(&self) -> &str {
            self.id
        }

        async fn invoke(
            &self,
            _event: &InboundEvent,
            _ctx: ModuleContext,
        ) -> Result<ModuleOutcome, ModuleError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(ModuleOutcome::Handled),
                Behavior::Fail => Err(ModuleError("boom".into())),
                Behavior::Panic => panic!("module panic"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ModuleOutcome::Handled)
                }
            }
        }
    }

    fn ctx_with(modules: &[&str]) -> ModuleContext {
        let mut config = GroupConfig::default();
        config.enabled_modules = modules.iter().map(|m| m.to_string()).collect();
        ModuleContext {
            config: Arc::new(config),
            actions: Arc::new(NoopSink),
        }
    }

    fn command_event(text: &str) -> InboundEvent {
        InboundEvent {
            tenant_id: "t1".into(),
            subject_id: "-100".into(),
            actor_id: "u1".into(),
            kind: EventKind::Message,
            payload: json!({ "text": text }),
            received_at: 0,
            dedup_key: "d1".into(),
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[test]
    fn second_enabled_binding_conflicts_at_registration() {
        let registry = ModuleRegistry::new();
        let key = BindingKey::Command("ban".into());

        registry
            .register("t1", key.clone(), TestModule::new("moderation", Behavior::Succeed))
            .expect("first registration succeeds");

        let err = registry
            .register("t1", key.clone(), TestModule::new("other", Behavior::Succeed))
            .expect_err("second registration must conflict");
        assert_eq!(err.existing, "moderation");

        // A different tenant may bind the same match freely.
        registry
            .register("t2", key, TestModule::new("other", Behavior::Succeed))
            .expect("other tenant is independent");
    }

    #[test]
    fn disable_frees_the_slot() {
        let registry = ModuleRegistry::new();
        let key = BindingKey::Command("ban".into());

        registry
            .register("t1", key.clone(), TestModule::new("moderation", Behavior::Succeed))
            .expect("register");
        assert!(registry.disable("t1", &key));
        assert!(!registry.disable("t1", &key), "already removed");

        registry
            .register("t1", key, TestModule::new("other", Behavior::Succeed))
            .expect("slot is free after disable");
    }

    #[tokio::test]
    async fn unbound_event_passes_through() {
        let registry = ModuleRegistry::new();
        let outcome = registry
            .dispatch(&command_event("just chatting"), ctx_with(&[]), TIMEOUT)
            .await;
        assert!(matches!(outcome, DispatchOutcome::NoBinding));
    }

    #[tokio::test]
    async fn command_dispatches_to_command_binding() {
        let registry = ModuleRegistry::new();
        let module = TestModule::new("moderation", Behavior::Succeed);
        registry
            .register("t1", BindingKey::Command("ban".into()), module.clone())
            .expect("register");

        let outcome = registry
            .dispatch(
                &command_event("/ban @spammer"),
                ctx_with(&["moderation"]),
                TIMEOUT,
            )
            .await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Completed(ModuleOutcome::Handled)
        ));
        assert_eq!(module.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unbound_command_falls_back_to_message_binding() {
        let registry = ModuleRegistry::new();
        let filter = TestModule::new("filter", Behavior::Succeed);
        registry
            .register("t1", BindingKey::Kind(EventKind::Message), filter.clone())
            .expect("register");

        let outcome = registry
            .dispatch(&command_event("/unknown"), ctx_with(&["filter"]), TIMEOUT)
            .await;
        assert!(matches!(outcome, DispatchOutcome::Completed(_)));
        assert_eq!(filter.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_module_is_skipped() {
        let registry = ModuleRegistry::new();
        let module = TestModule::new("moderation", Behavior::Succeed);
        registry
            .register("t1", BindingKey::Command("ban".into()), module.clone())
            .expect("register");

        // Bound, but not in this subject's enabled set.
        let outcome = registry
            .dispatch(&command_event("/ban x"), ctx_with(&["economy"]), TIMEOUT)
            .await;
        assert!(matches!(outcome, DispatchOutcome::NoBinding));
        assert_eq!(module.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_failure_is_isolated() {
        let registry = ModuleRegistry::new();
        registry
            .register(
                "t1",
                BindingKey::Command("bad".into()),
                TestModule::new("broken", Behavior::Fail),
            )
            .expect("register");
        let good = TestModule::new("good", Behavior::Succeed);
        registry
            .register("t1", BindingKey::Command("good".into()), good.clone())
            .expect("register");

        let outcome = registry
            .dispatch(&command_event("/bad"), ctx_with(&["broken", "good"]), TIMEOUT)
            .await;
        match outcome {
            DispatchOutcome::Failed(ModuleDispatchError::Failed { module_id, detail }) => {
                assert_eq!(module_id, "broken");
                assert_eq!(detail, "boom");
            }
            other => panic!("expected contained failure, got {other:?}"),
        }

        // Subsequent events dispatch normally.
        let outcome = registry
            .dispatch(&command_event("/good"), ctx_with(&["broken", "good"]), TIMEOUT)
            .await;
        assert!(matches!(outcome, DispatchOutcome::Completed(_)));
        assert_eq!(good.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let registry = ModuleRegistry::new();
        registry
            .register(
                "t1",
                BindingKey::Command("crash".into()),
                TestModule::new("crashy", Behavior::Panic),
            )
            .expect("register");

        let outcome = registry
            .dispatch(&command_event("/crash"), ctx_with(&["crashy"]), TIMEOUT)
            .await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed(ModuleDispatchError::Panicked { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_handler_is_cancelled_at_the_time_box() {
        let registry = ModuleRegistry::new();
        registry
            .register(
                "t1",
                BindingKey::Command("slow".into()),
                TestModule::new("slow", Behavior::Hang),
            )
            .expect("register");

        let outcome = registry
            .dispatch(&command_event("/slow"), ctx_with(&["slow"]), TIMEOUT)
            .await;
        match outcome {
            DispatchOutcome::Failed(ModuleDispatchError::Timeout { module_id, timeout_ms }) => {
                assert_eq!(module_id, "slow");
                assert_eq!(timeout_ms, 200);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_event_dispatches_by_kind() {
        let registry = ModuleRegistry::new();
        let greeter = TestModule::new("greeter", Behavior::Succeed);
        registry
            .register("t1", BindingKey::Kind(EventKind::MemberJoined), greeter.clone())
            .expect("register");

        let mut event = command_event("ignored");
        event.kind = EventKind::MemberJoined;
        event.payload = json!({});

        let outcome = registry
            .dispatch(&event, ctx_with(&["greeter"]), TIMEOUT)
            .await;
        assert!(matches!(outcome, DispatchOutcome::Completed(_)));
        assert_eq!(greeter.invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn binding_key_round_trips() {
        for key in [
            BindingKey::Command("warn".into()),
            BindingKey::Kind(EventKind::MemberJoined),
            BindingKey::Kind(EventKind::Callback),
        ] {
            assert_eq!(
                BindingKey::parse(&key.as_match_key()).expect("should parse"),
                key
            );
        }
        assert!(BindingKey::parse("command:").is_none());
        assert!(BindingKey::parse("kind:bogus").is_none());
        assert!(BindingKey::parse("nonsense").is_none());
    }
}
