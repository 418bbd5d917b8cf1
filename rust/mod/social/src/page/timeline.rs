//! A paged, live list of likeable, commentable items.
//!
//! [`Timeline<Posts>`] backs the feed and profile post lists,
//! [`Timeline<Reels>`] backs shorts. The kind supplies the tables and the
//! row mapping; everything else (paging, likes, comments, shares, edits,
//! deletes, real-time merging) is shared.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use pulse_client::row::{column, column_str, row_from, scalar_text, table};
use pulse_client::{ChangeEvent, ChangeOp, ChannelFilter, DataStore, Filter, Query, Row};
use pulse_core::{provisional_id, ClientError, Result};

use crate::model::{Comment, LikeState, Likeable, Post, Reel, User, UserId};
use crate::mutation::{MutationId, MutationLedger, PendingEchoes, Rollback};
use crate::normalize::{
    comment_from_row, like_summary, normalize_rows, patch_post, patch_reel, post_from_row,
    reel_from_row, AuthorCache,
};
use crate::page::{ensure_author, PageEnv, Pending, Settled, Visit, Write};
use crate::reconcile::{
    on_deleted, on_inserted, on_like_event, on_updated, settle_provisional, Entity, Placement,
};
use crate::state::{Listing, PageStatus, ViewError};

/// Table layout and row mapping for one kind of timeline item.
pub trait TimelineKind: Send + Sync + 'static {
    type Item: Entity + Likeable + Clone + std::fmt::Debug + Send + Sync + 'static;

    /// Name used in logs and errors.
    const ENTITY: &'static str;
    const TABLE: &'static str;
    const LIKES: &'static str;
    const COMMENTS: &'static str;
    /// Column referencing the item from like and comment rows.
    const PARENT: &'static str;
    /// Editable text column.
    const TEXT: &'static str;

    fn from_row(row: &Row, authors: &AuthorCache) -> Result<Self::Item>;
    fn patch(item: &mut Self::Item, row: &Row);
    fn author(item: &Self::Item) -> &User;
    fn comments(item: &mut Self::Item) -> &mut Vec<Comment>;
    fn shares(item: &mut Self::Item) -> &mut u32;
    fn text(item: &mut Self::Item) -> &mut String;
}

pub struct Posts;

impl TimelineKind for Posts {
    type Item = Post;

    const ENTITY: &'static str = "post";
    const TABLE: &'static str = table::POSTS;
    const LIKES: &'static str = table::LIKES;
    const COMMENTS: &'static str = table::COMMENTS;
    const PARENT: &'static str = "post_id";
    const TEXT: &'static str = "content";

    fn from_row(row: &Row, authors: &AuthorCache) -> Result<Post> {
        post_from_row(row, authors)
    }

    fn patch(item: &mut Post, row: &Row) {
        patch_post(item, row)
    }

    fn author(item: &Post) -> &User {
        &item.author
    }

    fn comments(item: &mut Post) -> &mut Vec<Comment> {
        &mut item.comments
    }

    fn shares(item: &mut Post) -> &mut u32 {
        &mut item.shares
    }

    fn text(item: &mut Post) -> &mut String {
        &mut item.content
    }
}

pub struct Reels;

impl TimelineKind for Reels {
    type Item = Reel;

    const ENTITY: &'static str = "reel";
    const TABLE: &'static str = table::REELS;
    const LIKES: &'static str = table::REEL_LIKES;
    const COMMENTS: &'static str = table::REEL_COMMENTS;
    const PARENT: &'static str = "reel_id";
    const TEXT: &'static str = "caption";

    fn from_row(row: &Row, authors: &AuthorCache) -> Result<Reel> {
        reel_from_row(row, authors)
    }

    fn patch(item: &mut Reel, row: &Row) {
        patch_reel(item, row)
    }

    fn author(item: &Reel) -> &User {
        &item.author
    }

    fn comments(item: &mut Reel) -> &mut Vec<Comment> {
        &mut item.comments
    }

    fn shares(item: &mut Reel) -> &mut u32 {
        &mut item.shares
    }

    fn text(item: &mut Reel) -> &mut String {
        &mut item.caption
    }
}

// ── Mutations ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Slot {
    Like(String),
    Share(String),
    Text(String),
    Presence(String),
    Comment(String),
}

#[derive(Debug, Clone)]
enum Snapshot<T> {
    Like(LikeState),
    Shares(u32),
    Text(String),
    Removed { index: usize, item: T },
    /// The provisional entry did not exist before.
    Absent,
}

/// What a pending timeline mutation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineAction {
    Like { id: String, liked: bool },
    Comment { parent_id: String, provisional_id: String },
    Share { id: String },
    Edit { id: String },
    Delete { id: String },
}

impl TimelineAction {
    fn target(&self) -> &str {
        match self {
            TimelineAction::Like { id, .. }
            | TimelineAction::Share { id }
            | TimelineAction::Edit { id }
            | TimelineAction::Delete { id } => id,
            TimelineAction::Comment { parent_id, .. } => parent_id,
        }
    }
}

// ── Timeline ────────────────────────────────────────────────────────

struct FetchedPage<T> {
    items: Vec<T>,
    /// Rows returned, including any dropped by the normalizer.
    rows: usize,
    cursor: Option<(Value, String)>,
}

pub struct Timeline<K: TimelineKind> {
    env: Arc<PageEnv>,
    visit: Visit,
    path: String,
    /// Only items by this user (profile pages).
    author: Option<UserId>,
    items: Vec<K::Item>,
    authors: AuthorCache,
    ledger: MutationLedger<Slot, Snapshot<K::Item>>,
    echoes: PendingEchoes<String>,
    inbox: super::Inbox,
    status: PageStatus,
    /// `(created_at, id)` of the oldest row fetched so far.
    cursor: Option<(Value, String)>,
    _kind: PhantomData<K>,
}

impl<K: TimelineKind> Timeline<K> {
    /// A timeline publishing to `path`.
    pub fn new(env: Arc<PageEnv>, path: impl Into<String>, author: Option<UserId>) -> Self {
        let echoes = PendingEchoes::new(env.echo_window());
        let authors = env.author_cache();
        Self {
            env,
            visit: Visit::new(),
            path: path.into(),
            author,
            items: Vec::new(),
            authors,
            ledger: MutationLedger::new(),
            echoes,
            inbox: super::Inbox::new(),
            status: PageStatus::default(),
            cursor: None,
            _kind: PhantomData,
        }
    }

    pub fn items(&self) -> &[K::Item] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&K::Item> {
        self.items.iter().find(|i| i.id() == id)
    }

    pub fn status(&self) -> &PageStatus {
        &self.status
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn pending_count(&self) -> usize {
        self.ledger.pending_count()
    }

    pub fn clear_notice(&mut self) {
        if self.status.notice.take().is_some() {
            self.publish();
        }
    }

    pub(crate) fn set_notice(&mut self, notice: ViewError) {
        self.status.notice = Some(notice);
        self.publish();
    }

    /// Apply `f` to every item and publish.
    pub(crate) fn update_all<F: FnMut(&mut K::Item)>(&mut self, f: F) {
        self.items.iter_mut().for_each(f);
        self.publish();
    }

    /// Replace the items with the first page and start live updates.
    ///
    /// Events queued before the refetch are already part of it and are
    /// discarded. Pending echoes go too: the refetched items carry the
    /// server's like state, so a later echo is caught as already reflected.
    pub async fn load(&mut self) -> Result<()> {
        self.visit.ensure_live(K::ENTITY)?;
        let stale = self.inbox.drain().len();
        if stale > 0 {
            trace!(entity = K::ENTITY, stale, "discarding events queued before reload");
        }
        self.status.loading = true;
        self.publish();
        let result = self.fetch_page(None).await;
        self.status.loading = false;
        match result {
            Ok(page) => {
                debug!(entity = K::ENTITY, count = page.items.len(), path = %self.path, "timeline loaded");
                self.items = page.items;
                self.echoes.clear();
                self.status.error = None;
                self.status.has_more = page.rows == self.env.config.feed_page_size;
                self.cursor = page.cursor;
                if self.inbox.subscriptions() == 0 {
                    self.subscribe();
                }
                self.publish();
                Ok(())
            }
            Err(e) => {
                warn!(entity = K::ENTITY, error = %e, "timeline load failed");
                self.status.error = Some(ViewError::failed(&e));
                self.publish();
                Err(e)
            }
        }
    }

    /// Append the next page, continuing after the oldest row fetched so
    /// far. Returns how many new items were added.
    pub async fn load_more(&mut self) -> Result<usize> {
        self.visit.ensure_live(K::ENTITY)?;
        if !self.status.has_more {
            return Ok(0);
        }
        let page = match self.fetch_page(self.cursor.clone()).await {
            Ok(v) => v,
            Err(e) => {
                self.status.notice = Some(ViewError::transient(&e));
                self.publish();
                return Err(e);
            }
        };
        self.status.has_more = page.rows == self.env.config.feed_page_size;
        if page.cursor.is_some() {
            self.cursor = page.cursor;
        }
        let mut added = 0;
        for item in page.items {
            if self.get(item.id()).is_none() {
                self.items.push(item);
                added += 1;
            }
        }
        self.publish();
        Ok(added)
    }

    async fn fetch_page(&mut self, after: Option<(Value, String)>) -> Result<FetchedPage<K::Item>> {
        let data = self.env.services.data.clone();
        let size = self.env.config.feed_page_size;
        let mut query = Query::table(K::TABLE)
            .join("author", table::PROFILES, "user_id")
            .order_desc("created_at")
            .order_desc("id")
            .limit(size);
        if let Some(author) = &self.author {
            query = query.eq("user_id", author.as_str());
        }
        if let Some((created_at, id)) = after {
            query = query.before("created_at", created_at, id);
        }
        let rows = data.select(&query).await?;
        let cursor = rows.last().and_then(|last| {
            let created_at = column(last, "created_at")?.clone();
            let id = column(last, "id").and_then(scalar_text)?;
            Some((created_at, id))
        });
        for row in &rows {
            self.authors.absorb(row, "author");
        }
        let mut items = normalize_rows(K::ENTITY, &rows, |r| K::from_row(r, &self.authors));
        if items.is_empty() {
            return Ok(FetchedPage {
                items,
                rows: rows.len(),
                cursor,
            });
        }
        let ids: Vec<String> = items.iter().map(|i| i.id().to_string()).collect();

        let like_rows = data
            .select(&Query::table(K::LIKES).in_list(K::PARENT, ids.clone()))
            .await?;
        let likes = like_summary(&like_rows, K::PARENT, self.env.me_id());

        let comment_rows = data
            .select(
                &Query::table(K::COMMENTS)
                    .in_list(K::PARENT, ids)
                    .join("author", table::PROFILES, "user_id")
                    .order_asc("created_at"),
            )
            .await?;
        for row in &comment_rows {
            self.authors.absorb(row, "author");
        }
        let mut comments: HashMap<String, Vec<Comment>> = HashMap::new();
        for c in normalize_rows("comment", &comment_rows, |r| comment_from_row(r, &self.authors)) {
            comments.entry(c.post_id.clone()).or_default().push(c);
        }

        for item in &mut items {
            let id = item.id().to_string();
            if let Some(state) = likes.get(&id) {
                item.set_like_state(*state);
            }
            if let Some(list) = comments.remove(&id) {
                *K::comments(item) = list;
            }
        }
        Ok(FetchedPage {
            items,
            rows: rows.len(),
            cursor,
        })
    }

    fn subscribe(&mut self) {
        let realtime = self.env.services.realtime.clone();
        let items = match &self.author {
            Some(author) => ChannelFilter::table(K::TABLE).eq("user_id", author.as_str()),
            None => ChannelFilter::table(K::TABLE),
        };
        self.inbox.subscribe(&*realtime, items);
        self.inbox.subscribe(&*realtime, ChannelFilter::table(K::LIKES));
        self.inbox.subscribe(&*realtime, ChannelFilter::table(K::COMMENTS));
    }

    // ── Optimistic actions ──

    fn find_mut(&mut self, id: &str) -> Result<&mut K::Item> {
        self.items
            .iter_mut()
            .find(|i| i.id() == id)
            .ok_or_else(|| ClientError::NotFound(format!("{} '{}'", K::ENTITY, id)))
    }

    fn pending(&self, mutation: MutationId, write: Write, action: TimelineAction) -> Pending<TimelineAction> {
        Pending::new(self.visit.token, mutation, write, action)
    }

    /// Flip the like on `id` and move its count by one.
    pub fn begin_toggle_like(&mut self, id: &str) -> Result<Pending<TimelineAction>> {
        self.visit.ensure_live(K::ENTITY)?;
        let me = self.env.me_id().to_string();
        let now = self.env.now();
        let item = self.find_mut(id)?;
        let prior = item.like_state();
        let next = prior.toggled();
        item.set_like_state(next);
        let mutation = self.ledger.apply(Slot::Like(id.to_string()), Snapshot::Like(prior));
        self.echoes.expect(id.to_string(), next.is_liked, now);

        let write = if next.is_liked {
            Write::Insert {
                table: K::LIKES,
                row: row_from([(K::PARENT, json!(id)), ("user_id", json!(me))]),
            }
        } else {
            Write::Delete {
                table: K::LIKES,
                filters: vec![Filter::eq(K::PARENT, id), Filter::eq("user_id", me)],
            }
        };
        self.publish();
        Ok(self.pending(
            mutation,
            write,
            TimelineAction::Like {
                id: id.to_string(),
                liked: next.is_liked,
            },
        ))
    }

    /// Append a provisional comment to `parent_id`.
    pub fn begin_comment(&mut self, parent_id: &str, text: &str) -> Result<Pending<TimelineAction>> {
        self.visit.ensure_live(K::ENTITY)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::Validation("Comment cannot be empty".into()));
        }
        let comment = Comment {
            id: provisional_id(),
            post_id: parent_id.to_string(),
            author: self.env.me.clone(),
            text: text.to_string(),
            created_at: self.env.now(),
            provisional: true,
        };
        let provisional = comment.id.clone();
        K::comments(self.find_mut(parent_id)?).push(comment);
        let mutation = self
            .ledger
            .apply(Slot::Comment(provisional.clone()), Snapshot::Absent);

        let write = Write::Insert {
            table: K::COMMENTS,
            row: row_from([
                (K::PARENT, json!(parent_id)),
                ("user_id", json!(self.env.me_id())),
                ("content", json!(text)),
            ]),
        };
        self.publish();
        Ok(self.pending(
            mutation,
            write,
            TimelineAction::Comment {
                parent_id: parent_id.to_string(),
                provisional_id: provisional,
            },
        ))
    }

    pub fn begin_share(&mut self, id: &str) -> Result<Pending<TimelineAction>> {
        self.visit.ensure_live(K::ENTITY)?;
        let shares = K::shares(self.find_mut(id)?);
        let prior = *shares;
        *shares += 1;
        let next = *shares;
        let mutation = self.ledger.apply(Slot::Share(id.to_string()), Snapshot::Shares(prior));
        let write = Write::Update {
            table: K::TABLE,
            filters: vec![Filter::eq("id", id)],
            patch: json!({ "shares": next }),
        };
        self.publish();
        Ok(self.pending(mutation, write, TimelineAction::Share { id: id.to_string() }))
    }

    /// Replace the text of one of the current user's items.
    pub fn begin_edit(&mut self, id: &str, text: &str) -> Result<Pending<TimelineAction>> {
        self.visit.ensure_live(K::ENTITY)?;
        let me = self.env.me_id().to_string();
        let item = self.find_mut(id)?;
        if K::author(item).id != me {
            return Err(ClientError::Validation(format!("Only the author can edit this {}", K::ENTITY)));
        }
        let prior = std::mem::replace(K::text(item), text.trim().to_string());
        let mutation = self.ledger.apply(Slot::Text(id.to_string()), Snapshot::Text(prior));
        let write = Write::Update {
            table: K::TABLE,
            filters: vec![Filter::eq("id", id)],
            patch: row_from([(K::TEXT, json!(text.trim()))]),
        };
        self.publish();
        Ok(self.pending(mutation, write, TimelineAction::Edit { id: id.to_string() }))
    }

    /// Remove one of the current user's items. A failure puts it back in
    /// its former position.
    pub fn begin_delete(&mut self, id: &str) -> Result<Pending<TimelineAction>> {
        self.visit.ensure_live(K::ENTITY)?;
        let me = self.env.me_id().to_string();
        if K::author(self.find_mut(id)?).id != me {
            return Err(ClientError::Validation(format!("Only the author can delete this {}", K::ENTITY)));
        }
        let Some((index, item)) = on_deleted(&mut self.items, id) else {
            return Err(ClientError::NotFound(format!("{} '{}'", K::ENTITY, id)));
        };
        let mutation = self
            .ledger
            .apply(Slot::Presence(id.to_string()), Snapshot::Removed { index, item });
        let write = Write::Delete {
            table: K::TABLE,
            filters: vec![Filter::eq("id", id)],
        };
        self.publish();
        Ok(self.pending(mutation, write, TimelineAction::Delete { id: id.to_string() }))
    }

    /// Settle a pending action with the backend's answer.
    pub fn settle(&mut self, pending: Pending<TimelineAction>, outcome: Result<Option<Row>>) -> Settled {
        if !self.visit.accepts(&pending) {
            return Settled::Ignored;
        }
        let Pending {
            mutation, meta: action, ..
        } = pending;
        let settled = match outcome {
            Ok(row) => {
                self.ledger.confirm(mutation);
                self.confirmed(&action, row);
                Settled::Confirmed
            }
            Err(e) => {
                warn!(entity = K::ENTITY, item = action.target(), error = %e, "reverting");
                self.revert(mutation, &action);
                self.status.notice = Some(ViewError::transient(&e));
                Settled::RolledBack
            }
        };
        self.publish();
        settled
    }

    fn confirmed(&mut self, action: &TimelineAction, row: Option<Row>) {
        let TimelineAction::Comment {
            parent_id,
            provisional_id,
        } = action
        else {
            return;
        };
        let Some(row) = row else { return };
        match comment_from_row(&row, &self.authors) {
            Ok(comment) => {
                if let Some(item) = self.items.iter_mut().find(|i| i.id() == parent_id) {
                    settle_provisional(K::comments(item), provisional_id, comment, &Placement::Append);
                }
            }
            Err(e) => warn!(error = %e, "confirmed comment undecodable"),
        }
    }

    fn revert(&mut self, mutation: MutationId, action: &TimelineAction) {
        if let TimelineAction::Like { id, liked } = action {
            self.echoes.cancel(id, *liked);
        }
        let snapshot = match self.ledger.roll_back(mutation) {
            Rollback::Restore(s) => s,
            Rollback::Superseded | Rollback::Stale => return,
        };
        let target = action.target();
        match snapshot {
            Snapshot::Like(state) => {
                on_updated(&mut self.items, target, |i| i.set_like_state(state));
            }
            Snapshot::Shares(n) => {
                on_updated(&mut self.items, target, |i| *K::shares(i) = n);
            }
            Snapshot::Text(text) => {
                on_updated(&mut self.items, target, |i| *K::text(i) = text);
            }
            Snapshot::Removed { index, item } => {
                if self.get(target).is_none() {
                    let index = index.min(self.items.len());
                    self.items.insert(index, item);
                }
            }
            Snapshot::Absent => {
                if let TimelineAction::Comment { provisional_id, .. } = action {
                    on_updated(&mut self.items, target, |i| {
                        K::comments(i).retain(|c| &c.id != provisional_id)
                    });
                }
            }
        }
    }

    async fn run(&mut self, pending: Pending<TimelineAction>) -> Settled {
        let data = self.env.services.data.clone();
        let outcome = pending.run(&*data).await;
        self.settle(pending, outcome)
    }

    pub async fn toggle_like(&mut self, id: &str) -> Result<Settled> {
        let pending = self.begin_toggle_like(id)?;
        Ok(self.run(pending).await)
    }

    pub async fn add_comment(&mut self, parent_id: &str, text: &str) -> Result<Settled> {
        let pending = self.begin_comment(parent_id, text)?;
        Ok(self.run(pending).await)
    }

    pub async fn share(&mut self, id: &str) -> Result<Settled> {
        let pending = self.begin_share(id)?;
        Ok(self.run(pending).await)
    }

    pub async fn edit(&mut self, id: &str, text: &str) -> Result<Settled> {
        let pending = self.begin_edit(id, text)?;
        Ok(self.run(pending).await)
    }

    pub async fn delete(&mut self, id: &str) -> Result<Settled> {
        let pending = self.begin_delete(id)?;
        Ok(self.run(pending).await)
    }

    /// Add an item the current user just created on the backend.
    pub fn insert_created(&mut self, row: &Row) -> Result<K::Item> {
        self.visit.ensure_live(K::ENTITY)?;
        let item = K::from_row(row, &self.authors)?;
        on_inserted(&mut self.items, item.clone(), &Placement::Prepend);
        self.publish();
        Ok(item)
    }

    // ── Real-time ──

    /// Apply every queued change event. Returns how many were handled.
    pub async fn drain_events(&mut self) -> usize {
        if self.visit.disposed {
            return 0;
        }
        let events = self.inbox.drain();
        if events.is_empty() {
            return 0;
        }
        let data = self.env.services.data.clone();
        for event in &events {
            self.apply_event(&*data, event).await;
        }
        self.publish();
        events.len()
    }

    async fn apply_event(&mut self, data: &dyn DataStore, event: &ChangeEvent) {
        let row = event.record();
        let Some(id) = column(row, "id").and_then(scalar_text) else {
            if event.table != K::LIKES {
                trace!(table = %event.table, "event without id");
                return;
            }
            self.apply_like(row, event.op == ChangeOp::Insert);
            return;
        };
        let table = event.table.as_str();
        match event.op {
            ChangeOp::Insert if table == K::TABLE => {
                ensure_author(data, &mut self.authors, row, "user_id").await;
                match K::from_row(row, &self.authors) {
                    Ok(item) => {
                        on_inserted(&mut self.items, item, &Placement::Prepend);
                    }
                    Err(e) => warn!(entity = K::ENTITY, error = %e, "dropping pushed row"),
                }
            }
            ChangeOp::Update if table == K::TABLE => {
                on_updated(&mut self.items, &id, |i| K::patch(i, row));
            }
            ChangeOp::Delete if table == K::TABLE => {
                on_deleted(&mut self.items, &id);
            }
            ChangeOp::Insert | ChangeOp::Delete if table == K::LIKES => {
                self.apply_like(row, event.op == ChangeOp::Insert);
            }
            ChangeOp::Insert if table == K::COMMENTS => {
                ensure_author(data, &mut self.authors, row, "user_id").await;
                match comment_from_row(row, &self.authors) {
                    Ok(comment) => {
                        let parent = comment.post_id.clone();
                        on_updated(&mut self.items, &parent, |i| {
                            on_inserted(K::comments(i), comment, &Placement::Append);
                        });
                    }
                    Err(e) => warn!(error = %e, "dropping pushed comment"),
                }
            }
            ChangeOp::Delete if table == K::COMMENTS => {
                let parent = column(row, K::PARENT).and_then(scalar_text);
                for item in &mut self.items {
                    if parent.as_deref().map_or(true, |p| p == item.id()) {
                        on_deleted(K::comments(item), &id);
                    }
                }
            }
            _ => trace!(table, op = ?event.op, "ignored event"),
        }
    }

    fn apply_like(&mut self, row: &Row, added: bool) {
        let target = column(row, K::PARENT).and_then(scalar_text);
        let user = column_str(row, "user_id");
        let (Some(target), Some(user)) = (target, user) else {
            return;
        };
        let me = self.env.me_id().to_string();
        let outcome = on_like_event(
            &mut self.items,
            &mut self.echoes,
            &target,
            user,
            added,
            &me,
            self.env.now(),
        );
        trace!(item = %target, ?outcome, "like event");
    }

    // ── Lifecycle ──

    pub fn publish(&self) {
        self.env.store.set(
            &self.path,
            Listing {
                items: self.items.clone(),
                status: self.status.clone(),
            },
        );
    }

    /// Stop live updates and ignore any still-pending mutation.
    pub fn dispose(&mut self) {
        self.visit.disposed = true;
        self.inbox.close();
        self.ledger.clear();
        self.echoes.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.visit.disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::testing::{fixture, like_rows, post_row, ts, Fixture};
    use crate::state::{path, PostList};
    use pulse_client::Op;

    async fn feed(f: &Fixture) -> Timeline<Posts> {
        let mut t = Timeline::<Posts>::new(f.env.clone(), path::FEED_POSTS, None);
        t.load().await.unwrap();
        t
    }

    fn seed_post(f: &Fixture, id: &str, author: &str, likes: usize) {
        f.backend.seed(table::POSTS, [post_row(id, author, 0)]);
        f.backend.seed(table::LIKES, like_rows(id, likes));
    }

    // ========================================================================
    // Loading
    // ========================================================================

    #[tokio::test]
    async fn load_orders_newest_first_with_aggregates() {
        let f = fixture();
        f.backend.seed(table::POSTS, [post_row("p1", "u2", 0), post_row("p2", "u3", 5)]);
        f.backend.seed(table::LIKES, like_rows("p1", 3));
        f.backend.seed(
            table::LIKES,
            [json!({"post_id": "p1", "user_id": "me"})],
        );
        f.backend.seed(
            table::COMMENTS,
            [json!({"id": "c1", "post_id": "p2", "user_id": "u2", "content": "nice", "created_at": ts(6)})],
        );
        let t = feed(&f).await;
        let ids: Vec<&str> = t.items().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p2", "p1"]);
        let p1 = t.get("p1").unwrap();
        assert_eq!((p1.likes, p1.is_liked), (4, true));
        assert_eq!(t.get("p2").unwrap().comments[0].author.display_name, "Bea");

        let published: PostList = f.env.store.get_as(path::FEED_POSTS).unwrap();
        assert_eq!(published.items.len(), 2);
        assert!(!published.status.loading);
    }

    #[tokio::test]
    async fn rows_without_author_are_dropped() {
        let f = fixture();
        f.backend.seed(table::POSTS, [post_row("p1", "ghost", 0), post_row("p2", "u2", 1)]);
        let t = feed(&f).await;
        assert_eq!(t.items().len(), 1);
        assert_eq!(t.items()[0].id, "p2");
    }

    #[tokio::test]
    async fn load_failure_sets_error() {
        let f = fixture();
        f.backend.fail_next(Op::Select, table::POSTS, ClientError::Network("down".into()));
        let mut t = Timeline::<Posts>::new(f.env.clone(), path::FEED_POSTS, None);
        assert!(t.load().await.is_err());
        assert!(matches!(t.status().error, Some(ViewError::Failed { .. })));
    }

    #[tokio::test]
    async fn load_more_pages_without_duplicates() {
        let f = fixture();
        let mut env = (*f.env).clone();
        env.config.feed_page_size = 2;
        let env = Arc::new(env);
        f.backend.seed(
            table::POSTS,
            (0..5).map(|i| post_row(&format!("p{}", i), "u2", i)),
        );
        let mut t = Timeline::<Posts>::new(env, path::FEED_POSTS, None);
        t.load().await.unwrap();
        assert_eq!(t.items().len(), 2);
        assert!(t.status().has_more);
        assert_eq!(t.load_more().await.unwrap(), 2);
        assert_eq!(t.load_more().await.unwrap(), 1);
        assert!(!t.status().has_more);
        assert_eq!(t.load_more().await.unwrap(), 0);
        assert_eq!(t.items().last().unwrap().id, "p0");
    }

    #[tokio::test]
    async fn deletion_above_the_cursor_skips_nothing() {
        let f = fixture();
        let mut env = (*f.env).clone();
        env.config.feed_page_size = 2;
        let env = Arc::new(env);
        f.backend.seed(
            table::POSTS,
            (0..5).map(|i| post_row(&format!("p{}", i), "u2", i)),
        );
        let mut t = Timeline::<Posts>::new(env, path::FEED_POSTS, None);
        t.load().await.unwrap();

        f.backend.delete(table::POSTS, &[Filter::eq("id", "p3")]).await.unwrap();
        t.drain_events().await;
        while t.load_more().await.unwrap() > 0 {}

        let ids: Vec<&str> = t.items().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p4", "p2", "p1", "p0"]);
    }

    #[tokio::test]
    async fn same_timestamp_pages_break_ties_by_id() {
        let f = fixture();
        let mut env = (*f.env).clone();
        env.config.feed_page_size = 2;
        let env = Arc::new(env);
        f.backend.seed(
            table::POSTS,
            ["a", "b", "c"].map(|id| post_row(id, "u2", 0)),
        );
        let mut t = Timeline::<Posts>::new(env, path::FEED_POSTS, None);
        t.load().await.unwrap();
        t.load_more().await.unwrap();
        let ids: Vec<&str> = t.items().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn reload_drops_events_already_in_the_refetch() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 1);
        let mut t = feed(&f).await;
        f.backend
            .insert(table::LIKES, json!({"post_id": "p1", "user_id": "u3"}))
            .await
            .unwrap();
        t.load().await.unwrap();
        assert_eq!(t.drain_events().await, 0);
        assert_eq!(t.get("p1").unwrap().likes, 2);
    }

    // ========================================================================
    // Likes
    // ========================================================================

    #[tokio::test]
    async fn like_failure_restores_exact_state() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 15);
        let mut t = feed(&f).await;
        let before = t.get("p1").unwrap().clone();

        f.backend.fail_next(Op::Insert, table::LIKES, ClientError::Backend("boom".into()));
        let pending = t.begin_toggle_like("p1").unwrap();
        assert_eq!(t.get("p1").unwrap().likes, 16);
        let outcome = pending.run(&*f.backend).await;
        assert_eq!(t.settle(pending, outcome), Settled::RolledBack);

        assert_eq!(t.get("p1").unwrap(), &before);
        assert!(matches!(t.status().notice, Some(ViewError::Transient { .. })));
    }

    #[tokio::test]
    async fn echo_of_own_like_does_not_double_count() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 2);
        let mut t = feed(&f).await;
        assert_eq!(t.toggle_like("p1").await.unwrap(), Settled::Confirmed);
        assert_eq!(t.drain_events().await, 1);
        let p = t.get("p1").unwrap();
        assert_eq!((p.likes, p.is_liked), (3, true));
    }

    #[tokio::test]
    async fn double_toggle_returns_to_start() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 7);
        let mut t = feed(&f).await;
        let before = t.get("p1").unwrap().clone();
        t.toggle_like("p1").await.unwrap();
        t.toggle_like("p1").await.unwrap();
        t.drain_events().await;
        assert_eq!(t.get("p1").unwrap(), &before);
        assert!(f.backend.rows(table::LIKES).iter().all(|r| r["user_id"] != "me"));
    }

    #[tokio::test]
    async fn interleaved_toggles_first_fails() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 15);
        let mut t = feed(&f).await;

        let like = t.begin_toggle_like("p1").unwrap();
        let unlike = t.begin_toggle_like("p1").unwrap();
        assert_eq!(t.get("p1").unwrap().likes, 15);

        assert_eq!(t.settle(like, Err(ClientError::Network("lost".into()))), Settled::RolledBack);
        assert_eq!(t.get("p1").unwrap().likes, 15);
        assert_eq!(t.settle(unlike, Err(ClientError::Network("lost".into()))), Settled::RolledBack);
        let p = t.get("p1").unwrap();
        assert_eq!((p.likes, p.is_liked), (15, false));
    }

    #[tokio::test]
    async fn reload_during_a_like_keeps_the_like_observable() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 15);
        let mut t = feed(&f).await;

        let pending = t.begin_toggle_like("p1").unwrap();
        t.load().await.unwrap();
        let p = t.get("p1").unwrap();
        assert_eq!((p.likes, p.is_liked), (15, false));

        let outcome = pending.run(&*f.backend).await;
        assert_eq!(t.settle(pending, outcome), Settled::Confirmed);
        t.drain_events().await;

        let server = f.backend.rows(table::LIKES).iter().filter(|r| r["post_id"] == "p1").count();
        let p = t.get("p1").unwrap();
        assert_eq!(server, 16);
        assert_eq!((p.likes, p.is_liked), (16, true));
    }

    #[tokio::test]
    async fn other_users_likes_move_the_count() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 1);
        let mut t = feed(&f).await;
        f.backend
            .insert(table::LIKES, json!({"post_id": "p1", "user_id": "u3"}))
            .await
            .unwrap();
        t.drain_events().await;
        assert_eq!(t.get("p1").unwrap().likes, 2);
        assert!(!t.get("p1").unwrap().is_liked);
    }

    // ========================================================================
    // Comments
    // ========================================================================

    #[tokio::test]
    async fn comment_is_reconciled_not_duplicated() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 0);
        let mut t = feed(&f).await;

        let pending = t.begin_comment("p1", "great  shot").unwrap();
        assert!(t.get("p1").unwrap().comments[0].provisional);
        let outcome = pending.run(&*f.backend).await;
        // The pushed insert arrives before the response is handled.
        t.drain_events().await;
        assert_eq!(t.get("p1").unwrap().comments.len(), 1);
        assert!(!t.get("p1").unwrap().comments[0].provisional);

        assert_eq!(t.settle(pending, outcome), Settled::Confirmed);
        let comments = &t.get("p1").unwrap().comments;
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].text, "great  shot");
    }

    #[tokio::test]
    async fn failed_comment_is_removed() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 0);
        let mut t = feed(&f).await;
        f.backend.fail_next(Op::Insert, table::COMMENTS, ClientError::Backend("nope".into()));
        assert_eq!(t.add_comment("p1", "hi").await.unwrap(), Settled::RolledBack);
        assert!(t.get("p1").unwrap().comments.is_empty());
    }

    #[tokio::test]
    async fn empty_comment_is_rejected() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 0);
        let mut t = feed(&f).await;
        let err = t.begin_comment("p1", "   ").unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
        assert_eq!(t.pending_count(), 0);
    }

    #[tokio::test]
    async fn pushed_comment_from_unknown_author_is_fetched() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 0);
        let mut t = feed(&f).await;
        f.backend
            .insert(table::COMMENTS, json!({"post_id": "p1", "user_id": "u3", "content": "yo"}))
            .await
            .unwrap();
        t.drain_events().await;
        assert_eq!(t.get("p1").unwrap().comments[0].author.display_name, "Caio");
    }

    // ========================================================================
    // Share / edit / delete
    // ========================================================================

    #[tokio::test]
    async fn share_failure_restores_count() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 0);
        let mut t = feed(&f).await;
        assert_eq!(t.share("p1").await.unwrap(), Settled::Confirmed);
        assert_eq!(t.get("p1").unwrap().shares, 1);
        f.backend.fail_next(Op::Update, table::POSTS, ClientError::Backend("x".into()));
        assert_eq!(t.share("p1").await.unwrap(), Settled::RolledBack);
        assert_eq!(t.get("p1").unwrap().shares, 1);
    }

    #[tokio::test]
    async fn only_author_edits() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 0);
        seed_post(&f, "p2", "me", 0);
        let mut t = feed(&f).await;
        assert!(t.begin_edit("p1", "hacked").is_err());
        assert_eq!(t.edit("p2", "  fixed typo ").await.unwrap(), Settled::Confirmed);
        assert_eq!(t.get("p2").unwrap().content, "fixed typo");
    }

    #[tokio::test]
    async fn failed_delete_restores_position() {
        let f = fixture();
        f.backend.seed(
            table::POSTS,
            [post_row("p1", "u2", 0), post_row("p2", "me", 1), post_row("p3", "u2", 2)],
        );
        let mut t = feed(&f).await;
        let before: Vec<Post> = t.items().to_vec();
        f.backend.fail_next(Op::Delete, table::POSTS, ClientError::Network("x".into()));
        let pending = t.begin_delete("p2").unwrap();
        assert_eq!(t.items().len(), 2);
        let outcome = pending.run(&*f.backend).await;
        t.settle(pending, outcome);
        assert_eq!(t.items(), &before[..]);
    }

    #[tokio::test]
    async fn pushed_update_keeps_local_fields() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 0);
        let mut t = feed(&f).await;
        t.toggle_like("p1").await.unwrap();
        f.backend
            .update(table::POSTS, &[Filter::eq("id", "p1")], json!({"content": "edited"}))
            .await
            .unwrap();
        t.drain_events().await;
        let p = t.get("p1").unwrap();
        assert_eq!(p.content, "edited");
        assert!(p.is_liked);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[tokio::test]
    async fn settle_after_dispose_is_ignored() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 3);
        let mut t = feed(&f).await;
        let pending = t.begin_toggle_like("p1").unwrap();
        t.dispose();
        assert_eq!(t.settle(pending, Err(ClientError::Network("x".into()))), Settled::Ignored);
        assert_eq!(t.get("p1").unwrap().likes, 4);
        assert!(t.begin_toggle_like("p1").is_err());
    }

    #[tokio::test]
    async fn pending_from_another_visit_is_ignored() {
        let f = fixture();
        seed_post(&f, "p1", "u2", 3);
        let mut first = feed(&f).await;
        let mut second = feed(&f).await;
        let pending = first.begin_toggle_like("p1").unwrap();
        assert_eq!(second.settle(pending, Ok(None)), Settled::Ignored);
        assert_eq!(second.get("p1").unwrap().likes, 3);
    }
}
