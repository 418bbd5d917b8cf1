//! View controllers.
//!
//! Each controller exclusively owns the collections it renders, the
//! real-time subscriptions feeding them and the queue those subscriptions
//! deliver into. Optimistic actions come in two halves so that several can
//! be in flight at once:
//!
//! ```text
//! let pending = page.begin_toggle_like("p1")?;     // applied locally
//! let outcome = pending.run(&*data).await;         // backend round trip
//! page.settle_toggle_like(pending, outcome);       // confirm or revert
//! ```
//!
//! Every controller also offers the one-call form (`toggle_like(..).await`).
//! A pending mutation carries the visit it was started in; settling it on
//! a disposed controller, or on a later visit, is ignored.

pub mod chat;
pub mod feed;
pub mod notifications;
pub mod profile;
pub mod shorts;
pub mod timeline;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pulse_client::row::table;
use pulse_client::{
    ChangeEvent, ChannelFilter, DataStore, EventSink, Filter, Query, Realtime, Row, Services,
    SubscriptionGuard,
};
use pulse_core::{ClientConfig, ClientError, Clock, Result};
use pulse_flux::StateStore;

use crate::assistant::Assistant;
use crate::model::{User, UserId};
use crate::mutation::MutationId;
use crate::normalize::{user_from_row, AuthorCache};

pub use chat::ChatPage;
pub use feed::{FeedPage, NewStory};
pub use notifications::NotificationCenter;
pub use profile::{ProfileEdit, ProfilePage};
pub use shorts::ShortsPage;
pub use timeline::{Posts, Reels, Timeline, TimelineKind};

/// Which page is shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "user_id", rename_all = "lowercase")]
pub enum Page {
    Feed,
    Profile(UserId),
    Chat(UserId),
    Shorts,
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Page::Feed => write!(f, "feed"),
            Page::Profile(id) => write!(f, "profile/{}", id),
            Page::Chat(id) => write!(f, "chat/{}", id),
            Page::Shorts => write!(f, "shorts"),
        }
    }
}

/// An uploaded media file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUpload {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl MediaUpload {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    pub fn is_video(&self) -> bool {
        self.content_type.starts_with("video/")
    }

    fn extension(&self) -> &str {
        self.content_type
            .split('/')
            .nth(1)
            .and_then(|s| s.split(';').next())
            .filter(|s| !s.is_empty())
            .unwrap_or("bin")
    }
}

// ── Environment ─────────────────────────────────────────────────────

/// What every controller of one signed-in session shares.
#[derive(Clone)]
pub struct PageEnv {
    pub services: Services,
    pub store: Arc<StateStore>,
    pub clock: Arc<dyn Clock>,
    pub config: ClientConfig,
    pub me: User,
}

impl PageEnv {
    pub fn me_id(&self) -> &str {
        &self.me.id
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn echo_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.echo_window()).unwrap_or(chrono::Duration::MAX)
    }

    pub fn assistant(&self) -> Assistant {
        Assistant::new(self.services.text.clone())
    }

    /// Author cache seeded with the current user.
    pub(crate) fn author_cache(&self) -> AuthorCache {
        let mut authors = AuthorCache::new();
        authors.insert(self.me.clone());
        authors
    }

    /// Upload to the media bucket under `folder/{me}/{random}.{ext}`.
    pub(crate) async fn upload_media(&self, folder: &str, media: MediaUpload) -> Result<String> {
        let path = format!(
            "{}/{}/{}.{}",
            folder,
            self.me.id,
            pulse_core::new_id(),
            media.extension()
        );
        self.services
            .storage
            .upload(&self.config.media_bucket, &path, media.bytes, &media.content_type)
            .await
    }
}

impl fmt::Debug for PageEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageEnv").field("me", &self.me.id).finish_non_exhaustive()
    }
}

// ── Visits and pending mutations ────────────────────────────────────

static NEXT_VISIT: AtomicU64 = AtomicU64::new(1);

/// Identifies one controller lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VisitToken(u64);

impl VisitToken {
    pub fn next() -> Self {
        VisitToken(NEXT_VISIT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A backend write backing an optimistic change.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Insert {
        table: &'static str,
        row: Row,
    },
    Update {
        table: &'static str,
        filters: Vec<Filter>,
        patch: Row,
    },
    Delete {
        table: &'static str,
        filters: Vec<Filter>,
    },
}

impl Write {
    /// Perform the write. Returns the stored row for inserts and updates.
    /// An update that matched nothing is `NotFound`.
    pub async fn run(&self, data: &dyn DataStore) -> Result<Option<Row>> {
        match self {
            Write::Insert { table, row } => data.insert(table, row.clone()).await.map(Some),
            Write::Update {
                table,
                filters,
                patch,
            } => {
                let rows = data.update(table, filters, patch.clone()).await?;
                rows.into_iter()
                    .next()
                    .map(Some)
                    .ok_or_else(|| ClientError::NotFound(format!("{} row", table)))
            }
            Write::Delete { table, filters } => {
                data.delete(table, filters).await?;
                Ok(None)
            }
        }
    }
}

/// An applied, unsettled optimistic mutation.
#[must_use = "a pending mutation must be settled"]
#[derive(Debug)]
pub struct Pending<M> {
    visit: VisitToken,
    mutation: MutationId,
    write: Write,
    meta: M,
}

impl<M> Pending<M> {
    pub(crate) fn new(visit: VisitToken, mutation: MutationId, write: Write, meta: M) -> Self {
        Self {
            visit,
            mutation,
            write,
            meta,
        }
    }

    pub fn write(&self) -> &Write {
        &self.write
    }

    pub fn meta(&self) -> &M {
        &self.meta
    }

    pub fn mutation(&self) -> MutationId {
        self.mutation
    }

    pub async fn run(&self, data: &dyn DataStore) -> Result<Option<Row>> {
        self.write.run(data).await
    }
}

/// How a pending mutation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Confirmed,
    RolledBack,
    /// The controller was disposed or belongs to another visit.
    Ignored,
}

/// Lifetime bookkeeping shared by the controllers.
#[derive(Debug)]
pub(crate) struct Visit {
    pub token: VisitToken,
    pub disposed: bool,
}

impl Visit {
    pub fn new() -> Self {
        Self {
            token: VisitToken::next(),
            disposed: false,
        }
    }

    pub fn ensure_live(&self, what: &str) -> Result<()> {
        if self.disposed {
            return Err(ClientError::Disposed(what.to_string()));
        }
        Ok(())
    }

    /// Whether `pending` may still touch owned state.
    pub fn accepts<M>(&self, pending: &Pending<M>) -> bool {
        let ok = !self.disposed && pending.visit == self.token;
        if !ok {
            debug!(mutation = ?pending.mutation, "ignoring settle from a stale visit");
        }
        ok
    }
}

// ── Inbound events ──────────────────────────────────────────────────

/// A page's real-time queue and the subscriptions feeding it.
pub struct Inbox {
    tx: EventSink,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    guards: Vec<SubscriptionGuard>,
}

impl Inbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            guards: Vec::new(),
        }
    }

    /// Subscribe; a failed subscription is logged and the page runs
    /// without live updates for that filter.
    pub fn subscribe(&mut self, realtime: &dyn Realtime, filter: ChannelFilter) {
        let label = filter.to_string();
        match realtime.subscribe(filter, self.tx.clone()) {
            Ok(guard) => {
                debug!(filter = %label, "subscribed");
                self.guards.push(guard);
            }
            Err(e) => warn!(filter = %label, error = %e, "real-time subscription failed"),
        }
    }

    /// Everything queued so far, in arrival order.
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn subscriptions(&self) -> usize {
        self.guards.len()
    }

    /// Release every subscription and discard queued events.
    pub fn close(&mut self) {
        self.guards.clear();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Inbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox")
            .field("subscriptions", &self.guards.len())
            .finish()
    }
}

// ── Shared fetches ──────────────────────────────────────────────────

pub(crate) async fn fetch_user(data: &dyn DataStore, id: &str) -> Result<User> {
    let rows = data
        .select(&Query::table(table::PROFILES).eq("id", id).limit(1))
        .await?;
    match rows.first() {
        Some(row) => user_from_row(row),
        None => Err(ClientError::NotFound(format!("profile '{}'", id))),
    }
}

/// Make sure the user referenced by `row[key]` is in `authors`, fetching
/// the profile when needed. Real-time rows carry no joined relations.
pub(crate) async fn ensure_author(
    data: &dyn DataStore,
    authors: &mut AuthorCache,
    row: &Row,
    key: &str,
) {
    let Some(id) = pulse_client::row::column(row, key).and_then(pulse_client::row::scalar_text)
    else {
        return;
    };
    if authors.contains(&id) {
        return;
    }
    match fetch_user(data, &id).await {
        Ok(user) => authors.insert(user),
        Err(e) => warn!(user_id = %id, error = %e, "author lookup failed"),
    }
}
