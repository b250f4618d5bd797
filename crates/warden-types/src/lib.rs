//! Shared types, error definitions, and constants for the Warden gateway.
//!
//! This crate provides the foundational types used across all Warden crates,
//! including the inbound event model, tenant registrations, abuse categories,
//! mitigation actions, and the collaborator port traits the pipeline is
//! wired against.
//!
//! No crate in the workspace depends on anything *except* `warden-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

pub mod policy;
pub mod ports;

pub use policy::{AbuseThresholds, GatewayPolicy, GroupConfig, RateLimitConfig, WindowRule};
pub use ports::{ActionError, ActionRequest, ActionSink, ConfigStore, StoreError, TenantStore};

use serde::{Deserialize, Serialize};

/// Lifecycle status of a tenant registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    /// The tenant may receive and process events.
    Active,
    /// The tenant is suspended; its events are dropped at the ingress.
    Suspended,
}

impl TenantStatus {
    /// Returns the canonical string label for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }

    /// Attempts to parse a status from its string label.
    ///
    /// Returns `None` for unknown labels.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }
}

/// One bot identity sharing the gateway's network ingress.
///
/// Created by the out-of-band registration collaborator; read-only to the
/// gateway. The ingress credential is never stored in the clear — only its
/// SHA-256 hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantRegistration {
    /// Opaque tenant identifier.
    pub tenant_id: String,
    /// Hex-encoded SHA-256 of the platform-issued ingress credential.
    pub secret_hash: String,
    /// Current lifecycle status.
    pub status: TenantStatus,
    /// Creation timestamp (ISO 8601).
    pub created_at: String,
}

/// The kind of platform event carried by an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new chat message.
    Message,
    /// An edit to a previously sent message.
    EditedMessage,
    /// A user joined the subject conversation.
    MemberJoined,
    /// A user left the subject conversation.
    MemberLeft,
    /// An inline-keyboard or button callback.
    Callback,
}

impl EventKind {
    /// Returns the canonical string label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::EditedMessage => "edited_message",
            Self::MemberJoined => "member_joined",
            Self::MemberLeft => "member_left",
            Self::Callback => "callback",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound platform event, resolved to its owning tenant.
///
/// Created per inbound request, immutable, and discarded after the pipeline
/// run completes. The payload is treated as an opaque JSON envelope; the
/// gateway only inspects it for command extraction and media classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// The tenant that owns this event.
    pub tenant_id: String,
    /// The conversation/group the event occurred in.
    pub subject_id: String,
    /// The user who produced the event.
    pub actor_id: String,
    /// What happened.
    pub kind: EventKind,
    /// Opaque platform payload.
    pub payload: serde_json::Value,
    /// When the gateway received the event (unix seconds).
    pub received_at: i64,
    /// Platform-assigned delivery id, used to discard duplicate deliveries.
    pub dedup_key: String,
}

impl InboundEvent {
    /// Extracts the bot command from a message payload, if any.
    ///
    /// A command is a message whose text starts with `/`; the command name is
    /// the first token without the leading slash, lowercased, with an
    /// optional `@botname` suffix stripped (the platform appends it in group
    /// chats).
    pub fn command(&self) -> Option<String> {
        if self.kind != EventKind::Message {
            return None;
        }
        let text = self.payload.get("text")?.as_str()?;
        let first = text.strip_prefix('/')?.split_whitespace().next()?;
        let name = first.split('@').next().unwrap_or(first);
        if name.is_empty() {
            return None;
        }
        Some(name.to_ascii_lowercase())
    }

    /// Returns `true` if the payload carries a media attachment.
    ///
    /// The envelope is opaque; media presence is detected by well-known keys.
    pub fn has_media(&self) -> bool {
        const MEDIA_KEYS: &[&str] = &["photo", "video", "document", "sticker", "animation"];
        MEDIA_KEYS
            .iter()
            .any(|key| self.payload.get(key).is_some())
    }
}

/// Categories of abuse tracked by the detection engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbuseCategory {
    /// Sustained message volume from one actor in one subject.
    MessageFlood,
    /// Sustained media volume from one actor in one subject.
    MediaFlood,
    /// A burst of joins into one subject.
    Raid,
}

impl AbuseCategory {
    /// Returns the canonical string label for this category.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageFlood => "message_flood",
            Self::MediaFlood => "media_flood",
            Self::Raid => "raid",
        }
    }

    /// Attempts to parse a category from its string label.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "message_flood" => Some(Self::MessageFlood),
            "media_flood" => Some(Self::MediaFlood),
            "raid" => Some(Self::Raid),
            _ => None,
        }
    }
}

impl std::fmt::Display for AbuseCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protective actions the gateway can apply or reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationAction {
    /// Post a warning addressed at the actor.
    Warn,
    /// Restrict the actor from sending messages.
    Mute,
    /// Remove the actor from the subject.
    Kick,
    /// Remove and permanently bar the actor.
    Ban,
    /// Restrict the whole subject to administrators.
    Lock,
    /// Lift a subject lock.
    Unlock,
}

impl MitigationAction {
    /// Returns the canonical string label for this action.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Mute => "mute",
            Self::Kick => "kick",
            Self::Ban => "ban",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
        }
    }

    /// Attempts to parse an action from its string label.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "warn" => Some(Self::Warn),
            "mute" => Some(Self::Mute),
            "kick" => Some(Self::Kick),
            "ban" => Some(Self::Ban),
            "lock" => Some(Self::Lock),
            "unlock" => Some(Self::Unlock),
            _ => None,
        }
    }

    /// Returns `true` for actions that are applied for a bounded duration
    /// and reversed when it elapses (`mute` and `lock`).
    pub fn is_time_bounded(self) -> bool {
        matches!(self, Self::Mute | Self::Lock)
    }
}

impl std::fmt::Display for MitigationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons the identity router rejects an inbound credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The credential maps to no registered tenant.
    UnknownTenant,
    /// The credential maps to a suspended tenant.
    SuspendedTenant,
}

impl RejectReason {
    /// Returns the canonical string label for this reason.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTenant => "unknown_tenant",
            Self::SuspendedTenant => "suspended_tenant",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventKind, payload: serde_json::Value) -> InboundEvent {
        InboundEvent {
            tenant_id: "t1".into(),
            subject_id: "-100".into(),
            actor_id: "u1".into(),
            kind,
            payload,
            received_at: 0,
            dedup_key: "d1".into(),
        }
    }

    #[test]
    fn command_extraction() {
        let ev = event(EventKind::Message, json!({"text": "/Ban @spammer now"}));
        assert_eq!(ev.command().as_deref(), Some("ban"));

        let ev = event(EventKind::Message, json!({"text": "/stats@my_bot"}));
        assert_eq!(ev.command().as_deref(), Some("stats"));

        let ev = event(EventKind::Message, json!({"text": "hello"}));
        assert_eq!(ev.command(), None);

        let ev = event(EventKind::Message, json!({"text": "/"}));
        assert_eq!(ev.command(), None);

        let ev = event(EventKind::Callback, json!({"text": "/ban"}));
        assert_eq!(ev.command(), None);
    }

    #[test]
    fn media_detection() {
        let ev = event(EventKind::Message, json!({"photo": [{"file_id": "x"}]}));
        assert!(ev.has_media());

        let ev = event(EventKind::Message, json!({"text": "plain"}));
        assert!(!ev.has_media());
    }

    #[test]
    fn labels_round_trip() {
        for kind in [
            EventKind::Message,
            EventKind::EditedMessage,
            EventKind::MemberJoined,
            EventKind::MemberLeft,
            EventKind::Callback,
        ] {
            let json = serde_json::to_string(&kind).expect("should serialize");
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }

        assert_eq!(
            MitigationAction::from_str_opt("mute"),
            Some(MitigationAction::Mute)
        );
        assert_eq!(MitigationAction::from_str_opt("nope"), None);
        assert_eq!(TenantStatus::from_str_opt("active"), Some(TenantStatus::Active));
    }
}
