//! Core types and error definitions for the Conversa session service.
//!
//! This crate provides the foundational types shared across all Conversa
//! crates: the unified error enum, the turn/attachment records that both
//! storage tiers marshal to and from, and the session-id and title helpers.
//!
//! # Main types
//!
//! - [`ConversaError`] — Unified error enum for all Conversa subsystems.
//! - [`ConversaResult`] — Convenience alias for `Result<T, ConversaError>`.
//! - [`Role`] — Turn author (user or assistant).
//! - [`Turn`] — A single message within a session.
//! - [`Attachment`] — Versioned side-channel metadata carried by a turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Conversa service.
///
/// The first four variants are the service's error taxonomy; the rest are
/// passthrough conversions from the libraries underneath.
#[derive(Debug, thiserror::Error)]
pub enum ConversaError {
    /// A session or transcript does not exist where one was required.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A storage tier is unreachable. For the cache tier this selects the
    /// in-process fallback at startup; mid-flight it is logged and absorbed.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// A caller-supplied value failed validation (e.g. empty message text).
    #[error("Validation error: {0}")]
    Validation(String),

    /// The durable tier rejected a write or read. Never absorbed: losing the
    /// permanent record risks losing the session on its next restore.
    #[error("Durability error: {0}")]
    Durability(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ConversaError`].
pub type ConversaResult<T> = Result<T, ConversaError>;

// --- Turn types ---

/// The author of a [`Turn`]. Closed two-variant set: the session subsystem
/// never stores system or tool traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A human end-user.
    User,
    /// The AI assistant.
    Assistant,
}

/// Versioned side-channel metadata attached to a turn, typically retrieval
/// sources cited by an assistant answer. Stored as a structured sidecar in
/// both tiers so the shape can evolve explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Schema version of the payload. Currently always 1.
    pub version: u32,
    /// Discriminator for the payload shape (e.g. `"source"`, `"chart"`).
    pub kind: String,
    /// The payload itself, opaque to the session subsystem.
    pub payload: serde_json::Value,
}

impl Attachment {
    /// Creates a version-1 attachment of the given kind.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            version: 1,
            kind: kind.into(),
            payload,
        }
    }
}

/// A single message within a session. Immutable once written: both storage
/// tiers marshal to and from this record, never loosely-typed maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Unique identifier for this turn.
    pub id: Uuid,
    /// The session this turn belongs to.
    pub session_id: Uuid,
    /// Who authored the turn.
    pub role: Role,
    /// The textual content of the turn.
    pub text: String,
    /// UTC timestamp assigned by the writer at creation.
    pub timestamp: DateTime<Utc>,
    /// Side-channel metadata, usually empty for user turns.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Turn {
    /// Creates a new turn with a fresh id and the current timestamp.
    pub fn new(role: Role, text: impl Into<String>, session_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            role,
            text: text.into(),
            timestamp: Utc::now(),
            attachments: Vec::new(),
        }
    }

    /// Creates a new turn with [`Role::User`].
    pub fn user(text: impl Into<String>, session_id: Uuid) -> Self {
        Self::new(Role::User, text, session_id)
    }

    /// Creates a new turn with [`Role::Assistant`].
    pub fn assistant(text: impl Into<String>, session_id: Uuid) -> Self {
        Self::new(Role::Assistant, text, session_id)
    }

    /// Attaches side-channel metadata, builder-style.
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

// --- Identifiers and titles ---

/// Issues a new globally-unique session identifier (128-bit random).
pub fn new_session_id() -> Uuid {
    Uuid::new_v4()
}

/// Maximum length of a derived session title, in characters.
pub const TITLE_MAX_CHARS: usize = 50;

/// Derives a session title from message text: trimmed, punctuation stripped,
/// truncated to [`TITLE_MAX_CHARS`] characters, first letter capitalized.
pub fn derive_title(text: &str) -> String {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .take(TITLE_MAX_CHARS)
        .collect();
    let cleaned = cleaned.trim();
    let mut chars = cleaned.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Deterministic fallback title for a session that never got one.
pub fn default_title(session_id: Uuid) -> String {
    let id = session_id.simple().to_string();
    format!("Session {}", &id[..8])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_creation() {
        let session_id = new_session_id();
        let turn = Turn::user("Hello", session_id);
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.text, "Hello");
        assert_eq!(turn.session_id, session_id);
        assert!(turn.attachments.is_empty());
    }

    #[test]
    fn test_turn_serialization_round_trip() {
        let turn = Turn::assistant("An answer", new_session_id()).with_attachments(vec![
            Attachment::new("source", serde_json::json!({"doc": "guide.pdf", "page": 3})),
        ]);
        let json = serde_json::to_string(&turn).unwrap();
        let back: Turn = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Role::Assistant);
        assert_eq!(back.attachments.len(), 1);
        assert_eq!(back.attachments[0].version, 1);
        assert_eq!(back.attachments[0].kind, "source");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
    }

    #[test]
    fn test_derive_title_simple() {
        assert_eq!(derive_title("Hello"), "Hello");
    }

    #[test]
    fn test_derive_title_strips_punctuation_and_capitalizes() {
        assert_eq!(derive_title("  what's the ETA?  "), "Whats the ETA");
    }

    #[test]
    fn test_derive_title_truncates() {
        let long = "a".repeat(120);
        assert_eq!(derive_title(&long).len(), TITLE_MAX_CHARS);
    }

    #[test]
    fn test_derive_title_empty() {
        assert_eq!(derive_title("   "), "");
        assert_eq!(derive_title("?!."), "");
    }

    #[test]
    fn test_default_title_is_deterministic() {
        let id = new_session_id();
        assert_eq!(default_title(id), default_title(id));
        assert!(default_title(id).starts_with("Session "));
    }
}
