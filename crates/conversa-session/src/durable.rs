//! Durable tier: append-only turn log plus transcript snapshots, backed by
//! SQLite.
//!
//! Every turn the coordinator records lands here unconditionally, independent
//! of the cache tier's TTL. Transcripts are saved snapshots of a session's
//! turns; the store keeps one canonical transcript per session for
//! save/update while older rows stay retrievable by id.
//!
//! All access goes through a single connection behind a mutex, with each
//! operation moved onto the blocking pool. Storage-layer errors surface as
//! [`ConversaError::Durability`] and are never absorbed.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use conversa_core::{default_title, Attachment, ConversaError, ConversaResult, Role, Turn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A saved snapshot of a session's turns, retrievable independently of the
/// cache tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    /// Unique transcript identifier, stable across re-saves.
    pub id: Uuid,
    /// The session this transcript was saved from.
    pub session_id: Uuid,
    /// Human-readable label.
    pub title: String,
    /// When the transcript was first saved.
    pub created_at: DateTime<Utc>,
    /// When the transcript was last re-saved.
    pub updated_at: DateTime<Utc>,
    /// The snapshotted turns, chronological.
    pub turns: Vec<Turn>,
}

/// Listing row for a transcript, without its turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSummary {
    /// Unique transcript identifier.
    pub id: Uuid,
    /// The session this transcript was saved from.
    pub session_id: Uuid,
    /// Human-readable label.
    pub title: String,
    /// When the transcript was first saved.
    pub created_at: DateTime<Utc>,
    /// When the transcript was last re-saved.
    pub updated_at: DateTime<Utc>,
    /// Number of turns in the snapshot.
    pub turn_count: u64,
}

/// Aggregate counters over the durable tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoreStats {
    /// Rows in the append-only turn log.
    pub total_turns: u64,
    /// Saved transcripts.
    pub total_transcripts: u64,
}

const MIGRATIONS: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS turns (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL,
    role        TEXT NOT NULL,
    text        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    attachments TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id);

CREATE TABLE IF NOT EXISTS transcripts (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL,
    title       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transcripts_session ON transcripts(session_id);

CREATE TABLE IF NOT EXISTS transcript_turns (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    transcript_id TEXT NOT NULL REFERENCES transcripts(id) ON DELETE CASCADE,
    turn_id       TEXT NOT NULL,
    role          TEXT NOT NULL,
    text          TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    attachments   TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_transcript_turns ON transcript_turns(transcript_id);
";

/// SQLite-backed durable store for turns and transcripts.
pub struct SqliteDurableStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDurableStore {
    /// Opens (or creates) the database at `path` and runs migrations.
    pub fn open(path: impl AsRef<Path>) -> ConversaResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ConversaError::Durability(format!("failed to open database: {e}")))?;
        Self::with_connection(conn)
    }

    /// Opens a fresh in-memory database. Used by tests and as a last-resort
    /// ephemeral store.
    pub fn open_in_memory() -> ConversaResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ConversaError::Durability(format!("failed to open database: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> ConversaResult<Self> {
        conn.execute_batch(MIGRATIONS)
            .map_err(|e| ConversaError::Durability(format!("migration failed: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn run_blocking<T, F>(&self, f: F) -> ConversaResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| ConversaError::Durability(format!("storage task failed: {e}")))?;
        result.map_err(|e| ConversaError::Durability(e.to_string()))
    }

    /// Inserts one immutable turn record. Never overwrites.
    pub async fn append_turn(&self, turn: &Turn) -> ConversaResult<()> {
        let turn = turn.clone();
        self.run_blocking(move |conn| {
            let attachments = encode_attachments(&turn.attachments)?;
            conn.execute(
                "INSERT INTO turns (id, session_id, role, text, created_at, attachments)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    turn.id.to_string(),
                    turn.session_id.to_string(),
                    role_to_str(turn.role),
                    turn.text,
                    turn.timestamp.to_rfc3339(),
                    attachments,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Reads the last `limit` turns of a session, chronological ascending.
    pub async fn read_turns(&self, session_id: Uuid, limit: usize) -> ConversaResult<Vec<Turn>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, text, created_at, attachments FROM (
                     SELECT rowid AS rid, * FROM turns
                     WHERE session_id = ?1
                     ORDER BY rid DESC LIMIT ?2
                 ) ORDER BY rid ASC",
            )?;
            let rows = stmt.query_map(params![session_id.to_string(), limit as i64], turn_from_row)?;
            rows.collect()
        })
        .await
    }

    /// Saves (or re-saves) the transcript for a session.
    ///
    /// If a transcript already exists for this session its turn set is
    /// replaced under one transaction and its id is preserved; otherwise a
    /// new transcript is created. Returns the transcript id.
    pub async fn save_transcript(
        &self,
        session_id: Uuid,
        turns: &[Turn],
        title: Option<&str>,
    ) -> ConversaResult<Uuid> {
        let turns = turns.to_vec();
        let title = title.map(str::to_owned);
        let fresh_id = Uuid::new_v4();
        self.run_blocking(move |conn| {
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;

            let existing: Option<(String, String)> = tx
                .query_row(
                    "SELECT id, title FROM transcripts
                     WHERE session_id = ?1
                     ORDER BY updated_at DESC, rowid DESC LIMIT 1",
                    params![session_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let transcript_id = match existing {
                Some((id, old_title)) => {
                    let new_title = title.unwrap_or(old_title);
                    tx.execute(
                        "DELETE FROM transcript_turns WHERE transcript_id = ?1",
                        params![id],
                    )?;
                    tx.execute(
                        "UPDATE transcripts SET title = ?1, updated_at = ?2 WHERE id = ?3",
                        params![new_title, now, id],
                    )?;
                    parse_uuid(&id)?
                }
                None => {
                    let new_title = title.unwrap_or_else(|| default_title(session_id));
                    tx.execute(
                        "INSERT INTO transcripts (id, session_id, title, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            fresh_id.to_string(),
                            session_id.to_string(),
                            new_title,
                            now,
                            now,
                        ],
                    )?;
                    fresh_id
                }
            };

            for turn in &turns {
                let attachments = encode_attachments(&turn.attachments)?;
                tx.execute(
                    "INSERT INTO transcript_turns
                         (transcript_id, turn_id, role, text, created_at, attachments)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        transcript_id.to_string(),
                        turn.id.to_string(),
                        role_to_str(turn.role),
                        turn.text,
                        turn.timestamp.to_rfc3339(),
                        attachments,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(transcript_id)
        })
        .await
    }

    /// Fetches a transcript with its turns, or `None` if the id is unknown.
    pub async fn get_transcript(&self, id: Uuid) -> ConversaResult<Option<Transcript>> {
        self.run_blocking(move |conn| {
            let header: Option<(String, String, String, String)> = conn
                .query_row(
                    "SELECT session_id, title, created_at, updated_at
                     FROM transcripts WHERE id = ?1",
                    params![id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            let Some((session_id, title, created_at, updated_at)) = header else {
                return Ok(None);
            };
            let session_id = parse_uuid(&session_id)?;

            let mut stmt = conn.prepare(
                "SELECT turn_id, role, text, created_at, attachments
                 FROM transcript_turns WHERE transcript_id = ?1
                 ORDER BY seq ASC",
            )?;
            let turns = stmt
                .query_map(params![id.to_string()], |row| {
                    transcript_turn_from_row(row, session_id)
                })?
                .collect::<rusqlite::Result<Vec<Turn>>>()?;

            Ok(Some(Transcript {
                id,
                session_id,
                title,
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
                turns,
            }))
        })
        .await
    }

    /// Lists transcripts saved from one session, most recently updated first.
    pub async fn list_transcripts_for_session(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> ConversaResult<Vec<TranscriptSummary>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SUMMARY_SELECT} WHERE t.session_id = ?1
                 ORDER BY t.updated_at DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(
                params![session_id.to_string(), limit as i64],
                summary_from_row,
            )?;
            rows.collect()
        })
        .await
    }

    /// Lists all transcripts, most recently updated first, paginated.
    pub async fn list_all_transcripts(
        &self,
        limit: usize,
        offset: usize,
    ) -> ConversaResult<Vec<TranscriptSummary>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SUMMARY_SELECT} ORDER BY t.updated_at DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let rows = stmt.query_map(params![limit as i64, offset as i64], summary_from_row)?;
            rows.collect()
        })
        .await
    }

    /// Finds transcripts whose title or any turn text contains `query`.
    pub async fn search_transcripts(&self, query: &str) -> ConversaResult<Vec<TranscriptSummary>> {
        let query = query.to_owned();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SUMMARY_SELECT} WHERE t.id IN (
                     SELECT t2.id FROM transcripts t2
                     LEFT JOIN transcript_turns tt ON tt.transcript_id = t2.id
                     WHERE t2.title LIKE '%' || ?1 || '%'
                        OR tt.text LIKE '%' || ?1 || '%'
                 ) ORDER BY t.updated_at DESC"
            ))?;
            let rows = stmt.query_map(params![query], summary_from_row)?;
            rows.collect()
        })
        .await
    }

    /// Deletes a transcript and its turns. Returns `true` iff a row existed.
    pub async fn delete_transcript(&self, id: Uuid) -> ConversaResult<bool> {
        self.run_blocking(move |conn| {
            let removed =
                conn.execute("DELETE FROM transcripts WHERE id = ?1", params![id.to_string()])?;
            Ok(removed > 0)
        })
        .await
    }

    /// Returns aggregate counters over the store.
    pub async fn stats(&self) -> ConversaResult<StoreStats> {
        self.run_blocking(|conn| {
            let total_turns: i64 =
                conn.query_row("SELECT COUNT(*) FROM turns", [], |row| row.get(0))?;
            let total_transcripts: i64 =
                conn.query_row("SELECT COUNT(*) FROM transcripts", [], |row| row.get(0))?;
            Ok(StoreStats {
                total_turns: total_turns as u64,
                total_transcripts: total_transcripts as u64,
            })
        })
        .await
    }
}

const SUMMARY_SELECT: &str = "SELECT t.id, t.session_id, t.title, t.created_at, t.updated_at,
       (SELECT COUNT(*) FROM transcript_turns tt WHERE tt.transcript_id = t.id)
 FROM transcripts t";

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn conversion_err(err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_role(s: &str) -> rusqlite::Result<Role> {
    match s {
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        other => Err(conversion_err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown role {other:?}"),
        ))),
    }
}

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(conversion_err)
}

fn parse_timestamp(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(conversion_err)
}

fn encode_attachments(attachments: &[Attachment]) -> rusqlite::Result<String> {
    serde_json::to_string(attachments).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn decode_attachments(raw: &str) -> rusqlite::Result<Vec<Attachment>> {
    serde_json::from_str(raw).map_err(conversion_err)
}

fn turn_from_row(row: &Row<'_>) -> rusqlite::Result<Turn> {
    let id: String = row.get(0)?;
    let session_id: String = row.get(1)?;
    let role: String = row.get(2)?;
    let text: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let attachments: String = row.get(5)?;
    Ok(Turn {
        id: parse_uuid(&id)?,
        session_id: parse_uuid(&session_id)?,
        role: parse_role(&role)?,
        text,
        timestamp: parse_timestamp(&created_at)?,
        attachments: decode_attachments(&attachments)?,
    })
}

fn transcript_turn_from_row(row: &Row<'_>, session_id: Uuid) -> rusqlite::Result<Turn> {
    let id: String = row.get(0)?;
    let role: String = row.get(1)?;
    let text: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let attachments: String = row.get(4)?;
    Ok(Turn {
        id: parse_uuid(&id)?,
        session_id,
        role: parse_role(&role)?,
        text,
        timestamp: parse_timestamp(&created_at)?,
        attachments: decode_attachments(&attachments)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<TranscriptSummary> {
    let id: String = row.get(0)?;
    let session_id: String = row.get(1)?;
    let title: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    let turn_count: i64 = row.get(5)?;
    Ok(TranscriptSummary {
        id: parse_uuid(&id)?,
        session_id: parse_uuid(&session_id)?,
        title,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        turn_count: turn_count as u64,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conversa_core::new_session_id;

    fn store() -> SqliteDurableStore {
        SqliteDurableStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_append_and_read_ascending() {
        let store = store();
        let sid = new_session_id();
        for i in 0..4 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .append_turn(&Turn::new(role, format!("turn {i}"), sid))
                .await
                .unwrap();
        }
        let turns = store.read_turns(sid, 50).await.unwrap();
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].text, "turn 0");
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[3].text, "turn 3");
        assert_eq!(turns[3].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_read_limit_keeps_most_recent() {
        let store = store();
        let sid = new_session_id();
        for i in 0..5 {
            store.append_turn(&Turn::user(format!("m{i}"), sid)).await.unwrap();
        }
        let turns = store.read_turns(sid, 2).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "m3");
        assert_eq!(turns[1].text, "m4");
    }

    #[tokio::test]
    async fn test_read_unknown_session_is_empty() {
        let store = store();
        let turns = store.read_turns(new_session_id(), 10).await.unwrap();
        assert!(turns.is_empty());
    }

    #[tokio::test]
    async fn test_attachments_round_trip() {
        let store = store();
        let sid = new_session_id();
        let turn = Turn::assistant("with sources", sid).with_attachments(vec![Attachment::new(
            "source",
            serde_json::json!({"doc": "manual.pdf", "page": 12}),
        )]);
        store.append_turn(&turn).await.unwrap();
        let turns = store.read_turns(sid, 10).await.unwrap();
        assert_eq!(turns[0].attachments.len(), 1);
        assert_eq!(turns[0].attachments[0].kind, "source");
        assert_eq!(turns[0].attachments[0].payload["page"], 12);
    }

    #[tokio::test]
    async fn test_save_transcript_upsert_keeps_id_and_replaces_turns() {
        let store = store();
        let sid = new_session_id();
        let first = vec![Turn::user("one", sid), Turn::assistant("two", sid)];
        let second = vec![
            Turn::user("one", sid),
            Turn::assistant("two", sid),
            Turn::user("three", sid),
        ];

        let id1 = store.save_transcript(sid, &first, Some("My Title")).await.unwrap();
        let id2 = store.save_transcript(sid, &second, None).await.unwrap();
        assert_eq!(id1, id2);

        let transcript = store.get_transcript(id1).await.unwrap().unwrap();
        assert_eq!(transcript.title, "My Title");
        assert_eq!(transcript.turns.len(), 3);
        assert_eq!(transcript.turns[2].text, "three");
        assert_eq!(transcript.session_id, sid);
    }

    #[tokio::test]
    async fn test_save_transcript_without_title_gets_fallback() {
        let store = store();
        let sid = new_session_id();
        let id = store
            .save_transcript(sid, &[Turn::user("hi", sid)], None)
            .await
            .unwrap();
        let transcript = store.get_transcript(id).await.unwrap().unwrap();
        assert!(transcript.title.starts_with("Session "));
    }

    #[tokio::test]
    async fn test_get_transcript_unknown_is_none() {
        let store = store();
        assert!(store.get_transcript(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_and_paginate_transcripts() {
        let store = store();
        let mut ids = Vec::new();
        for i in 0..3 {
            let sid = new_session_id();
            let id = store
                .save_transcript(sid, &[Turn::user(format!("t{i}"), sid)], Some(&format!("T{i}")))
                .await
                .unwrap();
            ids.push(id);
        }
        let all = store.list_all_transcripts(10, 0).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].turn_count, 1);

        let page = store.list_all_transcripts(2, 2).await.unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_list_transcripts_for_session() {
        let store = store();
        let sid = new_session_id();
        let other = new_session_id();
        store.save_transcript(sid, &[Turn::user("a", sid)], Some("Mine")).await.unwrap();
        store
            .save_transcript(other, &[Turn::user("b", other)], Some("Other"))
            .await
            .unwrap();
        let mine = store.list_transcripts_for_session(sid, 10).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].title, "Mine");
    }

    #[tokio::test]
    async fn test_search_matches_title_and_turn_text() {
        let store = store();
        let sid = new_session_id();
        store
            .save_transcript(
                sid,
                &[Turn::user("the quarterly revenue numbers", sid)],
                Some("Finance review"),
            )
            .await
            .unwrap();

        let by_title = store.search_transcripts("Finance").await.unwrap();
        assert_eq!(by_title.len(), 1);
        let by_text = store.search_transcripts("revenue").await.unwrap();
        assert_eq!(by_text.len(), 1);
        let miss = store.search_transcripts("kubernetes").await.unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn test_delete_transcript() {
        let store = store();
        let sid = new_session_id();
        let id = store
            .save_transcript(sid, &[Turn::user("gone soon", sid)], None)
            .await
            .unwrap();
        assert!(store.delete_transcript(id).await.unwrap());
        assert!(!store.delete_transcript(id).await.unwrap());
        assert!(store.get_transcript(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let store = store();
        let sid = new_session_id();
        store.append_turn(&Turn::user("a", sid)).await.unwrap();
        store.append_turn(&Turn::assistant("b", sid)).await.unwrap();
        store.save_transcript(sid, &[Turn::user("a", sid)], None).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_turns, 2);
        assert_eq!(stats.total_transcripts, 1);
    }
}
