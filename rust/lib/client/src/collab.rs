//! Collaborator traits consumed by the client core.
//!
//! Auth, relational data, real-time change delivery, object storage and
//! text generation are external services. Controllers only see these
//! traits; [`crate::MemoryBackend`] and [`crate::RestBackend`] implement
//! them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use pulse_core::Result;

use crate::query::{Filter, Query};
use crate::row::{column, scalar_text, Row};

// ── Auth ────────────────────────────────────────────────────────────

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub email: Option<String>,
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
}

#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// Current session, if signed in.
    async fn session(&self) -> Result<Option<Session>>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session>;

    async fn sign_out(&self) -> Result<()>;

    /// Session changes. Receivers created later only see later events.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}

// ── Relational data ─────────────────────────────────────────────────

#[async_trait::async_trait]
pub trait DataStore: Send + Sync + 'static {
    async fn select(&self, query: &Query) -> Result<Vec<Row>>;

    /// Insert one row; returns the stored row with server defaults
    /// (`id`, `created_at`) filled in.
    async fn insert(&self, table: &str, row: Row) -> Result<Row>;

    /// Patch every row matching `filters`; returns the updated rows.
    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<Vec<Row>>;

    /// Delete every row matching `filters`; returns how many were removed.
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<usize>;
}

// ── Real-time ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A row-level change pushed by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub op: ChangeOp,
    /// New row for insert/update, `Null` for delete.
    pub new: Row,
    /// Old row for delete (and update when the backend sends it).
    pub old: Row,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, new: Row) -> Self {
        Self {
            table: table.into(),
            op: ChangeOp::Insert,
            new,
            old: Row::Null,
        }
    }

    pub fn update(table: impl Into<String>, new: Row) -> Self {
        Self {
            table: table.into(),
            op: ChangeOp::Update,
            new,
            old: Row::Null,
        }
    }

    pub fn delete(table: impl Into<String>, old: Row) -> Self {
        Self {
            table: table.into(),
            op: ChangeOp::Delete,
            new: Row::Null,
            old,
        }
    }

    /// The row that identifies the change: `new`, or `old` for deletes.
    pub fn record(&self) -> &Row {
        match self.op {
            ChangeOp::Delete => &self.old,
            _ => &self.new,
        }
    }
}

/// Which changes a subscription wants: a whole table, or the rows whose
/// `column` equals `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFilter {
    pub table: String,
    pub column_eq: Option<(String, String)>,
}

impl ChannelFilter {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column_eq: None,
        }
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.column_eq = Some((column.into(), value.into()));
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        match &self.column_eq {
            None => true,
            Some((col, value)) => column(event.record(), col)
                .and_then(scalar_text)
                .is_some_and(|v| &v == value),
        }
    }

    /// Backend filter string, e.g. `post_id=eq.42`.
    pub fn to_backend_filter(&self) -> Option<String> {
        self.column_eq
            .as_ref()
            .map(|(c, v)| format!("{}=eq.{}", c, v))
    }
}

impl fmt::Display for ChannelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column_eq {
            None => write!(f, "{}", self.table),
            Some((c, v)) => write!(f, "{}:{}={}", self.table, c, v),
        }
    }
}

/// Where matched events are delivered. One queue per page visit.
pub type EventSink = mpsc::UnboundedSender<ChangeEvent>;

/// Releases a real-time subscription when dropped.
pub struct SubscriptionGuard {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionGuard {
    pub fn new<F: FnOnce() + Send + Sync + 'static>(release: F) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A guard with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("active", &self.release.is_some())
            .finish()
    }
}

pub trait Realtime: Send + Sync + 'static {
    /// Start delivering events matching `filter` into `sink` until the
    /// returned guard is dropped.
    fn subscribe(&self, filter: ChannelFilter, sink: EventSink) -> Result<SubscriptionGuard>;
}

// ── Object storage / text generation ────────────────────────────────

#[async_trait::async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    /// Store `bytes` at `bucket/path` and return its public URL.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String>;
}

#[async_trait::async_trait]
pub trait TextGenerator: Send + Sync + 'static {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

// ── Services ────────────────────────────────────────────────────────

/// The collaborator bundle handed to the app context.
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn AuthProvider>,
    pub data: Arc<dyn DataStore>,
    pub realtime: Arc<dyn Realtime>,
    pub storage: Arc<dyn ObjectStorage>,
    /// Absent when no generative endpoint is configured.
    pub text: Option<Arc<dyn TextGenerator>>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("text", &self.text.is_some())
            .finish_non_exhaustive()
    }
}
