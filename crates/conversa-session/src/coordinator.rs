//! The coordinator: single point of truth over the two storage tiers.
//!
//! Callers never talk to the cache or durable stores directly. The
//! coordinator implements the write-through policy (cache first for latency,
//! durable unconditionally), the explicit restore path for sessions whose
//! cache entry lapsed, and title derivation on the first user turn.
//!
//! Error policy: cache-tier failures are logged and absorbed so a flaky
//! cache never fails a chat request; durable-tier failures always propagate
//! because losing the permanent record risks losing the session on its next
//! restore. The one exception is [`SessionCoordinator::restore_from_durable`],
//! whose entire job is rebuilding the cache entry, so its cache writes
//! surface their errors instead of pretending the restore happened.

use std::sync::Arc;

use conversa_core::{
    derive_title, new_session_id, Attachment, ConversaError, ConversaResult, Role, Turn,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::cache::{CacheMode, CacheStore, SessionSummary};
use crate::durable::{SqliteDurableStore, StoreStats, Transcript, TranscriptSummary};

/// Upper bound on turns pulled when snapshotting or restoring a session.
pub const SNAPSHOT_LIMIT: usize = 1000;

/// Result of [`SessionCoordinator::restore_from_durable`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    /// Whether durable history existed and was replayed into the cache.
    pub restored: bool,
    /// The replayed turns, chronological. Empty when `restored` is false.
    pub turns: Vec<Turn>,
}

/// Orchestrates the cache and durable tiers behind one consistent API.
pub struct SessionCoordinator {
    cache: Arc<dyn CacheStore>,
    durable: Arc<SqliteDurableStore>,
}

impl SessionCoordinator {
    /// Creates a coordinator over the given tiers.
    pub fn new(cache: Arc<dyn CacheStore>, durable: Arc<SqliteDurableStore>) -> Self {
        Self { cache, durable }
    }

    /// Which cache backing was selected at startup.
    pub fn cache_mode(&self) -> CacheMode {
        self.cache.mode()
    }

    /// Records one turn, allocating a session id when none is supplied.
    ///
    /// Writes to the cache first (refreshing its TTL), then unconditionally
    /// to the durable store. On the first user turn of a session a title is
    /// derived from the message text and stored alongside; later turns never
    /// touch the title.
    pub async fn record_turn(
        &self,
        session_id: Option<Uuid>,
        role: Role,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> ConversaResult<Turn> {
        if text.trim().is_empty() {
            return Err(ConversaError::Validation(
                "message text must not be empty".into(),
            ));
        }
        let session_id = session_id.unwrap_or_else(new_session_id);
        let turn = Turn::new(role, text, session_id).with_attachments(attachments);

        let is_first_user_turn = role == Role::User
            && !self.cache.exists(session_id).await.unwrap_or_else(|e| {
                warn!(session_id = %session_id, error = %e, "cache exists check failed");
                true
            });

        if let Err(e) = self.cache.append(session_id, &turn).await {
            warn!(session_id = %session_id, error = %e, "cache append failed, continuing");
        }
        if is_first_user_turn {
            let title = derive_title(text);
            if !title.is_empty() {
                if let Err(e) = self.cache.set_title(session_id, &title).await {
                    warn!(session_id = %session_id, error = %e, "cache title write failed");
                }
            }
        }

        self.durable.append_turn(&turn).await?;
        Ok(turn)
    }

    /// Returns the session's cached history, chronological.
    ///
    /// Served from the cache only. A missing or expired cache entry is
    /// reported as [`ConversaError::NotFound`] so callers can distinguish a
    /// fresh empty session from an expired one whose history is still
    /// restorable; no implicit restore happens on reads.
    pub async fn get_history(&self, session_id: Uuid, limit: usize) -> ConversaResult<Vec<Turn>> {
        let live = self.cache.exists(session_id).await.unwrap_or_else(|e| {
            warn!(session_id = %session_id, error = %e, "cache exists check failed");
            false
        });
        if !live {
            return Err(ConversaError::NotFound(format!(
                "session {session_id} has no live cache entry"
            )));
        }
        self.cache.read(session_id, limit).await
    }

    /// Whether the session currently has a live cache entry.
    pub async fn session_exists(&self, session_id: Uuid) -> ConversaResult<bool> {
        self.cache.exists(session_id).await
    }

    /// Rebuilds the cache entry for a session from its durable history.
    ///
    /// Clears any stale cache state, replays up to `limit` durable turns in
    /// chronological order, recomputes the title from the earliest restored
    /// user turn, and resets the TTL. Idempotent: a second invocation replays
    /// identical data. Not serialized against concurrent `record_turn` calls
    /// for the same session; a turn recorded mid-restore can be lost from the
    /// cache copy (the durable record keeps it).
    pub async fn restore_from_durable(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> ConversaResult<RestoreOutcome> {
        let turns = self.durable.read_turns(session_id, limit).await?;
        if turns.is_empty() {
            return Ok(RestoreOutcome {
                restored: false,
                turns: Vec::new(),
            });
        }

        self.cache.clear(session_id).await?;
        for turn in &turns {
            self.cache.append(session_id, turn).await?;
        }
        if let Some(first_user) = turns.iter().find(|t| t.role == Role::User) {
            let title = derive_title(&first_user.text);
            if !title.is_empty() {
                self.cache.set_title(session_id, &title).await?;
            }
        }

        Ok(RestoreOutcome {
            restored: true,
            turns,
        })
    }

    /// Evicts the session from the cache. Durable history is retained, so a
    /// later restore still succeeds.
    pub async fn clear_session(&self, session_id: Uuid) -> ConversaResult<()> {
        self.cache.clear(session_id).await
    }

    /// Summaries of every live cached session.
    pub async fn list_active_sessions(&self) -> ConversaResult<Vec<SessionSummary>> {
        self.cache.list_active().await
    }

    /// Snapshots the session's turns into the transcript table.
    ///
    /// Uses the live cache copy when present, otherwise the durable record.
    /// When no explicit title is supplied the session's cached title (or its
    /// deterministic fallback) is used.
    pub async fn save_transcript(
        &self,
        session_id: Uuid,
        title: Option<&str>,
    ) -> ConversaResult<Uuid> {
        let live = self.cache.exists(session_id).await.unwrap_or_else(|e| {
            warn!(session_id = %session_id, error = %e, "cache exists check failed");
            false
        });
        let turns = if live {
            self.cache.read(session_id, SNAPSHOT_LIMIT).await?
        } else {
            self.durable.read_turns(session_id, SNAPSHOT_LIMIT).await?
        };
        if turns.is_empty() {
            return Err(ConversaError::NotFound(format!(
                "no turns recorded for session {session_id}"
            )));
        }

        let title = match title {
            Some(t) => t.to_owned(),
            None => self.cache.get_title(session_id).await?,
        };
        self.durable.save_transcript(session_id, &turns, Some(&title)).await
    }

    /// Fetches a transcript with its turns.
    pub async fn get_transcript(&self, id: Uuid) -> ConversaResult<Option<Transcript>> {
        self.durable.get_transcript(id).await
    }

    /// Lists transcripts saved from one session, most recent first.
    pub async fn list_transcripts_for_session(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> ConversaResult<Vec<TranscriptSummary>> {
        self.durable.list_transcripts_for_session(session_id, limit).await
    }

    /// Lists all transcripts, most recent first, paginated.
    pub async fn list_all_transcripts(
        &self,
        limit: usize,
        offset: usize,
    ) -> ConversaResult<Vec<TranscriptSummary>> {
        self.durable.list_all_transcripts(limit, offset).await
    }

    /// Finds transcripts whose title or turn text contains `query`.
    pub async fn search_transcripts(&self, query: &str) -> ConversaResult<Vec<TranscriptSummary>> {
        self.durable.search_transcripts(query).await
    }

    /// Deletes a transcript. Returns `true` iff it existed.
    pub async fn delete_transcript(&self, id: Uuid) -> ConversaResult<bool> {
        self.durable.delete_transcript(id).await
    }

    /// Aggregate counters over the durable tier.
    pub async fn stats(&self) -> ConversaResult<StoreStats> {
        self.durable.stats().await
    }

    /// Asks the cache tier to drop entries past their expiry instant.
    pub(crate) async fn evict_expired_cache_entries(&self) -> ConversaResult<usize> {
        self.cache.evict_expired().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;

    fn coordinator() -> SessionCoordinator {
        SessionCoordinator::new(
            Arc::new(MemoryCacheStore::new()),
            Arc::new(SqliteDurableStore::open_in_memory().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_record_turn_allocates_session_and_sets_title() {
        let coord = coordinator();
        let turn = coord
            .record_turn(None, Role::User, "Hello", Vec::new())
            .await
            .unwrap();
        let sid = turn.session_id;

        let history = coord.get_history(sid, 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].text, "Hello");

        let sessions = coord.list_active_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].title, "Hello");
    }

    #[tokio::test]
    async fn test_record_turn_rejects_empty_text() {
        let coord = coordinator();
        let err = coord
            .record_turn(None, Role::User, "   ", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConversaError::Validation(_)));
    }

    #[tokio::test]
    async fn test_title_set_once() {
        let coord = coordinator();
        let turn = coord
            .record_turn(None, Role::User, "First question", Vec::new())
            .await
            .unwrap();
        let sid = turn.session_id;
        coord
            .record_turn(Some(sid), Role::Assistant, "An answer", Vec::new())
            .await
            .unwrap();
        coord
            .record_turn(Some(sid), Role::User, "Second question", Vec::new())
            .await
            .unwrap();

        let sessions = coord.list_active_sessions().await.unwrap();
        assert_eq!(sessions[0].title, "First question");
    }

    #[tokio::test]
    async fn test_get_history_unknown_session_is_not_found() {
        let coord = coordinator();
        let err = coord.get_history(new_session_id(), 50).await.unwrap_err();
        assert!(matches!(err, ConversaError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_clear_then_restore_round_trip() {
        let coord = coordinator();
        let sid = coord
            .record_turn(None, Role::User, "How do refunds work?", Vec::new())
            .await
            .unwrap()
            .session_id;
        for (role, text) in [
            (Role::Assistant, "Refunds take 5 days."),
            (Role::User, "And exchanges?"),
            (Role::Assistant, "Exchanges are instant."),
            (Role::User, "Thanks!"),
            (Role::Assistant, "Any time."),
        ] {
            coord.record_turn(Some(sid), role, text, Vec::new()).await.unwrap();
        }

        coord.clear_session(sid).await.unwrap();
        assert!(matches!(
            coord.get_history(sid, 50).await,
            Err(ConversaError::NotFound(_))
        ));

        let outcome = coord.restore_from_durable(sid, 50).await.unwrap();
        assert!(outcome.restored);
        assert_eq!(outcome.turns.len(), 6);

        let history = coord.get_history(sid, 50).await.unwrap();
        assert_eq!(history.len(), 6);
        assert_eq!(history[0].text, "How do refunds work?");
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[5].text, "Any time.");
        assert_eq!(history[5].role, Role::Assistant);

        let sessions = coord.list_active_sessions().await.unwrap();
        assert_eq!(sessions[0].title, "How do refunds work");
    }

    #[tokio::test]
    async fn test_restore_is_idempotent() {
        let coord = coordinator();
        let sid = coord
            .record_turn(None, Role::User, "ping", Vec::new())
            .await
            .unwrap()
            .session_id;
        coord
            .record_turn(Some(sid), Role::Assistant, "pong", Vec::new())
            .await
            .unwrap();
        coord.clear_session(sid).await.unwrap();

        coord.restore_from_durable(sid, 50).await.unwrap();
        let first = coord.get_history(sid, 50).await.unwrap();
        coord.restore_from_durable(sid, 50).await.unwrap();
        let second = coord.get_history(sid, 50).await.unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.text, b.text);
        }
    }

    #[tokio::test]
    async fn test_restore_unknown_session_reports_not_restored() {
        let coord = coordinator();
        let outcome = coord
            .restore_from_durable(new_session_id(), 50)
            .await
            .unwrap();
        assert!(!outcome.restored);
        assert!(outcome.turns.is_empty());
    }

    #[tokio::test]
    async fn test_save_transcript_from_live_session() {
        let coord = coordinator();
        let sid = coord
            .record_turn(None, Role::User, "Summarize the report", Vec::new())
            .await
            .unwrap()
            .session_id;
        coord
            .record_turn(Some(sid), Role::Assistant, "Here is the summary.", Vec::new())
            .await
            .unwrap();

        let id = coord.save_transcript(sid, None).await.unwrap();
        let transcript = coord.get_transcript(id).await.unwrap().unwrap();
        assert_eq!(transcript.title, "Summarize the report");
        assert_eq!(transcript.turns.len(), 2);

        let again = coord.save_transcript(sid, Some("Final")).await.unwrap();
        assert_eq!(id, again);
        let transcript = coord.get_transcript(id).await.unwrap().unwrap();
        assert_eq!(transcript.title, "Final");
    }

    #[tokio::test]
    async fn test_save_transcript_falls_back_to_durable_after_expiry() {
        let coord = coordinator();
        let sid = coord
            .record_turn(None, Role::User, "Archive me", Vec::new())
            .await
            .unwrap()
            .session_id;
        coord.clear_session(sid).await.unwrap();

        let id = coord.save_transcript(sid, Some("Archived")).await.unwrap();
        let transcript = coord.get_transcript(id).await.unwrap().unwrap();
        assert_eq!(transcript.turns.len(), 1);
        assert_eq!(transcript.turns[0].text, "Archive me");
    }

    #[tokio::test]
    async fn test_save_transcript_empty_session_is_not_found() {
        let coord = coordinator();
        let err = coord.save_transcript(new_session_id(), None).await.unwrap_err();
        assert!(matches!(err, ConversaError::NotFound(_)));
    }
}
