//! The cache tier: low-latency view of active sessions under TTL.
//!
//! Two implementations sit behind [`CacheStore`]: [`RedisCacheStore`] for the
//! networked tier and [`MemoryCacheStore`] as the in-process fallback chosen
//! at startup when the networked tier is unreachable. The fallback doubles as
//! the deterministic fake for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conversa_core::{default_title, ConversaError, ConversaResult, Turn};
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// TTL window for cached sessions. Refreshed on every write.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Which backing the cache tier ended up with at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Backed by the networked cache; TTL expiry is native.
    Networked,
    /// Degraded in-process fallback; expiry happens on scan.
    InProcess,
}

/// One row of [`CacheStore::list_active`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// The session identifier.
    pub session_id: Uuid,
    /// Current title (or the deterministic fallback).
    pub title: String,
    /// Number of cached turns.
    pub turn_count: usize,
    /// Seconds until the entry expires if no further writes arrive.
    pub remaining_ttl_secs: u64,
    /// Timestamp of the most recent cached turn, if any.
    pub last_activity: Option<DateTime<Utc>>,
}

/// The live, low-latency view of active sessions.
///
/// Turns are stored most-recent-first (the storage convention); readers
/// always receive chronological order with the most recent turns preserved
/// when truncating.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Adds a turn to the head of the session's list and resets the TTL.
    /// Creates the list if absent. Must be atomic per key.
    async fn append(&self, session_id: Uuid, turn: &Turn) -> ConversaResult<()>;

    /// Returns at most `limit` turns in chronological order, oldest first,
    /// keeping the most recent when truncating.
    async fn read(&self, session_id: Uuid, limit: usize) -> ConversaResult<Vec<Turn>>;

    /// Whether the session currently has a live cache entry.
    async fn exists(&self, session_id: Uuid) -> ConversaResult<bool>;

    /// Deletes all cached state for the session. Idempotent.
    async fn clear(&self, session_id: Uuid) -> ConversaResult<()>;

    /// Stores the session title under the session TTL.
    async fn set_title(&self, session_id: Uuid, title: &str) -> ConversaResult<()>;

    /// Returns the session title, falling back to a deterministic default
    /// derived from the id.
    async fn get_title(&self, session_id: Uuid) -> ConversaResult<String>;

    /// Summaries of every live session.
    async fn list_active(&self) -> ConversaResult<Vec<SessionSummary>>;

    /// Removes entries past their expiry instant, returning how many were
    /// dropped. A no-op where the backend expires natively.
    async fn evict_expired(&self) -> ConversaResult<usize>;

    /// Which backing was selected at startup.
    fn mode(&self) -> CacheMode;
}

fn connectivity(e: redis::RedisError) -> ConversaError {
    ConversaError::Connectivity(e.to_string())
}

// ---------------------------------------------------------------------------
// RedisCacheStore
// ---------------------------------------------------------------------------

/// Networked cache tier. Per session it keeps a turn list and a title string,
/// both under the session TTL; `LPUSH` provides the atomic prepend the
/// concurrency model relies on.
pub struct RedisCacheStore {
    manager: ConnectionManager,
    ttl_secs: i64,
}

impl RedisCacheStore {
    /// Connects to the cache tier, verifying reachability with a PING.
    ///
    /// Callers are expected to fall back to [`MemoryCacheStore`] when this
    /// returns [`ConversaError::Connectivity`].
    pub async fn connect(url: &str, ttl: Duration) -> ConversaResult<Self> {
        let client = redis::Client::open(url).map_err(connectivity)?;
        let manager = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                ConversaError::Connectivity(format!("timed out connecting to cache at {url}"))
            })?
            .map_err(connectivity)?;
        let mut con = manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut con)
            .await
            .map_err(connectivity)?;
        Ok(Self {
            manager,
            ttl_secs: ttl.as_secs() as i64,
        })
    }

    fn turns_key(session_id: Uuid) -> String {
        format!("session:{session_id}:turns")
    }

    fn title_key(session_id: Uuid) -> String {
        format!("session:{session_id}:title")
    }

    fn session_id_from_key(key: &str) -> Option<Uuid> {
        key.strip_prefix("session:")
            .and_then(|rest| rest.strip_suffix(":turns"))
            .and_then(|id| Uuid::parse_str(id).ok())
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn append(&self, session_id: Uuid, turn: &Turn) -> ConversaResult<()> {
        let turns_key = Self::turns_key(session_id);
        let title_key = Self::title_key(session_id);
        let payload = serde_json::to_string(turn)?;
        let mut con = self.manager.clone();
        // LPUSH is atomic; the EXPIREs refresh the TTL window on every write.
        let _: () = redis::pipe()
            .lpush(&turns_key, payload)
            .ignore()
            .expire(&turns_key, self.ttl_secs)
            .ignore()
            .expire(&title_key, self.ttl_secs)
            .ignore()
            .query_async(&mut con)
            .await
            .map_err(connectivity)?;
        Ok(())
    }

    async fn read(&self, session_id: Uuid, limit: usize) -> ConversaResult<Vec<Turn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut con = self.manager.clone();
        let raw: Vec<String> = con
            .lrange(Self::turns_key(session_id), 0, limit as isize - 1)
            .await
            .map_err(connectivity)?;
        let mut turns = raw
            .iter()
            .map(|s| serde_json::from_str::<Turn>(s))
            .collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    async fn exists(&self, session_id: Uuid) -> ConversaResult<bool> {
        let mut con = self.manager.clone();
        con.exists(Self::turns_key(session_id))
            .await
            .map_err(connectivity)
    }

    async fn clear(&self, session_id: Uuid) -> ConversaResult<()> {
        let mut con = self.manager.clone();
        let _: i64 = con
            .del(vec![Self::turns_key(session_id), Self::title_key(session_id)])
            .await
            .map_err(connectivity)?;
        Ok(())
    }

    async fn set_title(&self, session_id: Uuid, title: &str) -> ConversaResult<()> {
        let mut con = self.manager.clone();
        let _: () = con
            .set_ex(Self::title_key(session_id), title, self.ttl_secs as u64)
            .await
            .map_err(connectivity)?;
        Ok(())
    }

    async fn get_title(&self, session_id: Uuid) -> ConversaResult<String> {
        let mut con = self.manager.clone();
        let title: Option<String> = con
            .get(Self::title_key(session_id))
            .await
            .map_err(connectivity)?;
        Ok(title.unwrap_or_else(|| default_title(session_id)))
    }

    async fn list_active(&self) -> ConversaResult<Vec<SessionSummary>> {
        let mut con = self.manager.clone();
        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter: redis::AsyncIter<'_, String> = con
                .scan_match("session:*:turns")
                .await
                .map_err(connectivity)?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        let mut con = self.manager.clone();
        let mut summaries = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(session_id) = Self::session_id_from_key(&key) else {
                continue;
            };
            let turn_count: i64 = con.llen(&key).await.map_err(connectivity)?;
            let ttl: i64 = con.ttl(&key).await.map_err(connectivity)?;
            if ttl == -2 {
                // Expired between SCAN and here.
                continue;
            }
            let newest: Option<String> = con.lindex(&key, 0).await.map_err(connectivity)?;
            let last_activity = newest
                .as_deref()
                .and_then(|s| serde_json::from_str::<Turn>(s).ok())
                .map(|t| t.timestamp);
            let title: Option<String> = con
                .get(Self::title_key(session_id))
                .await
                .map_err(connectivity)?;
            summaries.push(SessionSummary {
                session_id,
                title: title.unwrap_or_else(|| default_title(session_id)),
                turn_count: turn_count.max(0) as usize,
                remaining_ttl_secs: ttl.max(0) as u64,
                last_activity,
            });
        }
        Ok(summaries)
    }

    async fn evict_expired(&self) -> ConversaResult<usize> {
        // Expiry is native to the backend.
        Ok(0)
    }

    fn mode(&self) -> CacheMode {
        CacheMode::Networked
    }
}

// ---------------------------------------------------------------------------
// MemoryCacheStore
// ---------------------------------------------------------------------------

struct CachedSession {
    /// Most-recent-first, matching the networked tier's list convention.
    turns: Vec<Turn>,
    title: Option<String>,
    expires_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

/// In-process fallback cache. TTL is enforced lazily on access plus a
/// periodic [`CacheStore::evict_expired`] scan from the maintenance loop;
/// true zero-cost expiry is only available on the networked tier.
pub struct MemoryCacheStore {
    ttl: chrono::Duration,
    sessions: RwLock<HashMap<Uuid, CachedSession>>,
}

impl MemoryCacheStore {
    /// Creates a fallback cache with the default 24-hour TTL.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_SESSION_TTL)
    }

    /// Creates a fallback cache with a custom TTL window.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24)),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn live<'a>(
        sessions: &'a HashMap<Uuid, CachedSession>,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Option<&'a CachedSession> {
        sessions
            .get(&session_id)
            .filter(|entry| entry.expires_at > now)
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn append(&self, session_id: Uuid, turn: &Turn) -> ConversaResult<()> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(session_id).or_insert_with(|| CachedSession {
            turns: Vec::new(),
            title: None,
            expires_at: now + self.ttl,
            last_activity: now,
        });
        if entry.expires_at <= now {
            // Stale entry that was never scanned away; writing revives it fresh.
            entry.turns.clear();
            entry.title = None;
        }
        entry.turns.insert(0, turn.clone());
        entry.expires_at = now + self.ttl;
        entry.last_activity = now;
        Ok(())
    }

    async fn read(&self, session_id: Uuid, limit: usize) -> ConversaResult<Vec<Turn>> {
        let sessions = self.sessions.read().await;
        let Some(entry) = Self::live(&sessions, session_id, Utc::now()) else {
            return Ok(Vec::new());
        };
        let mut turns: Vec<Turn> = entry.turns.iter().take(limit).cloned().collect();
        turns.reverse();
        Ok(turns)
    }

    async fn exists(&self, session_id: Uuid) -> ConversaResult<bool> {
        let sessions = self.sessions.read().await;
        Ok(Self::live(&sessions, session_id, Utc::now()).is_some())
    }

    async fn clear(&self, session_id: Uuid) -> ConversaResult<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&session_id);
        Ok(())
    }

    async fn set_title(&self, session_id: Uuid, title: &str) -> ConversaResult<()> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(session_id).or_insert_with(|| CachedSession {
            turns: Vec::new(),
            title: None,
            expires_at: now + self.ttl,
            last_activity: now,
        });
        entry.title = Some(title.to_string());
        Ok(())
    }

    async fn get_title(&self, session_id: Uuid) -> ConversaResult<String> {
        let sessions = self.sessions.read().await;
        let title = Self::live(&sessions, session_id, Utc::now())
            .and_then(|entry| entry.title.clone());
        Ok(title.unwrap_or_else(|| default_title(session_id)))
    }

    async fn list_active(&self) -> ConversaResult<Vec<SessionSummary>> {
        let now = Utc::now();
        let sessions = self.sessions.read().await;
        let summaries = sessions
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(id, entry)| SessionSummary {
                session_id: *id,
                title: entry
                    .title
                    .clone()
                    .unwrap_or_else(|| default_title(*id)),
                turn_count: entry.turns.len(),
                remaining_ttl_secs: (entry.expires_at - now).num_seconds().max(0) as u64,
                last_activity: entry.turns.first().map(|t| t.timestamp),
            })
            .collect();
        Ok(summaries)
    }

    async fn evict_expired(&self) -> ConversaResult<usize> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires_at > now);
        Ok(before - sessions.len())
    }

    fn mode(&self) -> CacheMode {
        CacheMode::InProcess
    }
}
