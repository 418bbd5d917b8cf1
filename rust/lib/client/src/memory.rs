//! In-process backend implementing every collaborator trait.
//!
//! Tables are vectors of JSON rows. Writes fan out through a
//! [`RealtimeHub`] the way the hosted backend's change feed would, and
//! failures can be injected per operation to exercise rollback paths.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Duration;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use pulse_core::{new_id, ClientError, Clock, Result, SystemClock};

use crate::collab::{
    AuthProvider, ChangeEvent, ChannelFilter, DataStore, EventSink, ObjectStorage, Realtime,
    Services, Session, SessionEvent, SubscriptionGuard,
};
use crate::query::{matches_all, Filter, Query};
use crate::realtime::RealtimeHub;
use crate::row::{column, merge_into, scalar_eq, table, Row};

/// Column sets that must be unique per table.
const UNIQUE_KEYS: &[(&str, &[&str])] = &[
    (table::LIKES, &["post_id", "user_id"]),
    (table::REEL_LIKES, &["reel_id", "user_id"]),
    (table::FOLLOWERS, &["follower_id", "following_id"]),
    (table::BUCKET_POSTS, &["bucket_id", "post_id"]),
];

/// Operation kinds for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Select,
    Insert,
    Update,
    Delete,
    Upload,
}

struct Failure {
    op: Op,
    table: String,
    error: ClientError,
}

struct Account {
    password: String,
    user_id: String,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Row>>,
    accounts: HashMap<String, Account>,
    session: Option<Session>,
    objects: HashMap<String, Vec<u8>>,
    failures: VecDeque<Failure>,
    offline: bool,
    quiet: bool,
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    hub: RealtimeHub,
    sessions: broadcast::Sender<SessionEvent>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Server-side defaults (`created_at`, session expiry) use `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (sessions, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(MemoryState::default()),
            hub: RealtimeHub::new(),
            sessions,
            clock,
        }
    }

    /// Bundle this backend as every collaborator (no text generator).
    pub fn into_services(self: Arc<Self>) -> Services {
        Services {
            auth: self.clone(),
            data: self.clone(),
            realtime: self.clone(),
            storage: self,
            text: None,
        }
    }

    pub fn hub(&self) -> &RealtimeHub {
        &self.hub
    }

    // ── Test and demo controls ──

    /// Insert rows without publishing change events.
    pub fn seed<I: IntoIterator<Item = Row>>(&self, table: &str, rows: I) {
        let now = self.clock.now().to_rfc3339();
        let mut state = self.lock();
        let target = state.tables.entry(table.to_string()).or_default();
        for mut row in rows {
            fill_defaults(&mut row, &now);
            target.push(row);
        }
    }

    /// Snapshot of a table's rows in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Register an email/password account backed by `profile` (which
    /// must carry an `id`). Returns the user id.
    pub fn create_account(&self, email: &str, password: &str, profile: Row) -> Result<String> {
        let user_id = column(&profile, "id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Validation("profile row needs an id".into()))?;
        self.seed(table::PROFILES, [profile]);
        self.lock().accounts.insert(
            email.to_string(),
            Account {
                password: password.to_string(),
                user_id: user_id.clone(),
            },
        );
        Ok(user_id)
    }

    /// Fail the next `op` on `table` (bucket name for uploads) with `error`.
    pub fn fail_next(&self, op: Op, table: &str, error: ClientError) {
        self.lock().failures.push_back(Failure {
            op,
            table: table.to_string(),
            error,
        });
    }

    /// While offline every operation fails with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// While quiet, writes are stored but not published.
    pub fn set_quiet(&self, quiet: bool) {
        self.lock().quiet = quiet;
    }

    /// Publish an arbitrary change event without touching the tables.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        self.hub.publish(&event)
    }

    pub fn object(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(&format!("{}/{}", bucket, path)).cloned()
    }

    // ── Internals ──

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, state: &mut MemoryState, op: Op, table: &str) -> Result<()> {
        if state.offline {
            return Err(ClientError::Network("backend unreachable".into()));
        }
        let pos = state
            .failures
            .iter()
            .position(|f| f.op == op && f.table == table);
        match pos.and_then(|i| state.failures.remove(i)) {
            Some(failure) => {
                debug!(?op, table, error = %failure.error, "injected failure");
                Err(failure.error)
            }
            None => Ok(()),
        }
    }

    fn publish_all(&self, quiet: bool, events: Vec<ChangeEvent>) {
        if quiet {
            return;
        }
        for event in &events {
            self.hub.publish(event);
        }
    }

    fn resolve_joins(state: &MemoryState, query: &Query, mut row: Row) -> Row {
        for join in &query.joins {
            let target = column(&row, &join.local).and_then(|key| {
                state
                    .tables
                    .get(&join.table)
                    .and_then(|rows| rows.iter().find(|r| column(r, "id").is_some_and(|id| scalar_eq(id, key))))
                    .cloned()
            });
            if let Some(obj) = row.as_object_mut() {
                obj.insert(join.alias.clone(), target.unwrap_or(Value::Null));
            }
        }
        row
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn fill_defaults(row: &mut Row, now: &str) {
    if let Some(obj) = row.as_object_mut() {
        obj.entry("id").or_insert_with(|| Value::String(new_id()));
        obj.entry("created_at").or_insert_with(|| Value::String(now.to_string()));
    }
}

fn unique_violation(existing: &[Row], table_name: &str, row: &Row) -> Option<String> {
    let (_, cols) = UNIQUE_KEYS.iter().find(|(t, _)| *t == table_name)?;
    let clash = existing.iter().any(|other| {
        cols.iter().all(|c| match (column(other, c), column(row, c)) {
            (Some(a), Some(b)) => scalar_eq(a, b),
            _ => false,
        })
    });
    clash.then(|| format!("duplicate key value violates unique constraint on {}({})", table_name, cols.join(", ")))
}

// ── DataStore ───────────────────────────────────────────────────────

#[async_trait::async_trait]
impl DataStore for MemoryBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Row>> {
        let mut state = self.lock();
        self.check(&mut state, Op::Select, &query.table)?;
        let mut rows: Vec<Row> = state
            .tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| query.compare(a, b));
        let rows = rows
            .into_iter()
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|row| Self::resolve_joins(&state, query, row))
            .collect();
        Ok(rows)
    }

    async fn insert(&self, table_name: &str, mut row: Row) -> Result<Row> {
        if !row.is_object() {
            return Err(ClientError::Validation(format!("{} row must be an object", table_name)));
        }
        let now = self.clock.now().to_rfc3339();
        let quiet = {
            let mut state = self.lock();
            self.check(&mut state, Op::Insert, table_name)?;
            fill_defaults(&mut row, &now);
            let rows = state.tables.entry(table_name.to_string()).or_default();
            if let Some(msg) = unique_violation(rows, table_name, &row) {
                return Err(ClientError::Backend(msg));
            }
            rows.push(row.clone());
            state.quiet
        };
        self.publish_all(quiet, vec![ChangeEvent::insert(table_name, row.clone())]);
        Ok(row)
    }

    async fn update(&self, table_name: &str, filters: &[Filter], patch: Row) -> Result<Vec<Row>> {
        let (quiet, events, updated) = {
            let mut state = self.lock();
            self.check(&mut state, Op::Update, table_name)?;
            let mut events = Vec::new();
            let mut updated = Vec::new();
            if let Some(rows) = state.tables.get_mut(table_name) {
                for row in rows.iter_mut().filter(|r| matches_all(filters, r)) {
                    let old = row.clone();
                    merge_into(row, &patch);
                    updated.push(row.clone());
                    events.push(ChangeEvent {
                        old,
                        ..ChangeEvent::update(table_name, row.clone())
                    });
                }
            }
            (state.quiet, events, updated)
        };
        self.publish_all(quiet, events);
        Ok(updated)
    }

    async fn delete(&self, table_name: &str, filters: &[Filter]) -> Result<usize> {
        let (quiet, events) = {
            let mut state = self.lock();
            self.check(&mut state, Op::Delete, table_name)?;
            let mut removed = Vec::new();
            if let Some(rows) = state.tables.get_mut(table_name) {
                let (gone, kept): (Vec<Row>, Vec<Row>) =
                    rows.drain(..).partition(|r| matches_all(filters, r));
                *rows = kept;
                removed = gone;
            }
            let events: Vec<ChangeEvent> = removed
                .into_iter()
                .map(|old| ChangeEvent::delete(table_name, old))
                .collect();
            (state.quiet, events)
        };
        let count = events.len();
        self.publish_all(quiet, events);
        Ok(count)
    }
}

// ── AuthProvider ────────────────────────────────────────────────────

#[async_trait::async_trait]
impl AuthProvider for MemoryBackend {
    async fn session(&self) -> Result<Option<Session>> {
        let state = self.lock();
        if state.offline {
            return Err(ClientError::Network("backend unreachable".into()));
        }
        Ok(state.session.clone())
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let session = {
            let mut state = self.lock();
            if state.offline {
                return Err(ClientError::Network("backend unreachable".into()));
            }
            let user_id = match state.accounts.get(email) {
                Some(acct) if acct.password == password => acct.user_id.clone(),
                _ => return Err(ClientError::Unauthenticated("Invalid login credentials".into())),
            };
            let session = Session {
                user_id,
                email: Some(email.to_string()),
                access_token: new_id(),
                expires_at: Some(self.clock.now() + Duration::hours(1)),
            };
            state.session = Some(session.clone());
            session
        };
        info!(user_id = %session.user_id, "signed in");
        let _ = self.sessions.send(SessionEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        self.lock().session = None;
        info!("signed out");
        let _ = self.sessions.send(SessionEvent::SignedOut);
        Ok(())
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe()
    }
}

// ── Realtime / ObjectStorage ────────────────────────────────────────

impl Realtime for MemoryBackend {
    fn subscribe(&self, filter: ChannelFilter, sink: EventSink) -> Result<SubscriptionGuard> {
        self.hub.subscribe(filter, sink)
    }
}

#[async_trait::async_trait]
impl ObjectStorage for MemoryBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let mut state = self.lock();
        self.check(&mut state, Op::Upload, bucket)?;
        debug!(bucket, path, content_type, size = bytes.len(), "upload");
        state.objects.insert(format!("{}/{}", bucket, path), bytes);
        Ok(format!("memory://{}/{}", bucket, path))
    }
}
