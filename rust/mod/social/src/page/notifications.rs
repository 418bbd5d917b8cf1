//! The signed-in user's notifications.
//!
//! Lives for the whole session rather than one page visit, so the unread
//! badge stays current whatever page is shown.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use pulse_client::row::{column, scalar_text, table};
use pulse_client::{ChangeOp, ChannelFilter, Filter, Query, Row};
use pulse_core::{ClientError, Result};

use crate::model::Notification;
use crate::mutation::{MutationId, MutationLedger, Rollback};
use crate::normalize::{normalize_rows, notification_from_row, patch_notification, AuthorCache};
use crate::page::{ensure_author, Inbox, PageEnv, Pending, Settled, Visit, Write};
use crate::reconcile::{on_deleted, on_inserted, on_updated, Placement};
use crate::state::{NotificationList, PageStatus, ViewError};

/// Most recent notifications fetched on load.
const LOAD_LIMIT: usize = 50;

pub struct NotificationCenter {
    env: Arc<PageEnv>,
    visit: Visit,
    items: Vec<Notification>,
    authors: AuthorCache,
    /// Read flag before the change, per notification.
    reads: MutationLedger<String, bool>,
    inbox: Inbox,
    status: PageStatus,
}

impl NotificationCenter {
    pub fn new(env: Arc<PageEnv>) -> Self {
        let authors = env.author_cache();
        Self {
            env,
            visit: Visit::new(),
            items: Vec::new(),
            authors,
            reads: MutationLedger::new(),
            inbox: Inbox::new(),
            status: PageStatus::default(),
        }
    }

    /// Newest first.
    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn unread(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    pub fn status(&self) -> &PageStatus {
        &self.status
    }

    pub async fn load(&mut self) -> Result<()> {
        self.visit.ensure_live("notifications")?;
        self.status.loading = true;
        let query = Query::table(table::NOTIFICATIONS)
            .eq("user_id", self.env.me_id())
            .join("actor", table::PROFILES, "actor_id")
            .order_desc("created_at")
            .limit(LOAD_LIMIT);
        let data = self.env.services.data.clone();
        let result = data.select(&query).await;
        self.status.loading = false;
        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "notifications load failed");
                self.status.error = Some(ViewError::failed(&e));
                self.publish();
                return Err(e);
            }
        };
        for row in &rows {
            self.authors.absorb(row, "actor");
        }
        let authors = &self.authors;
        self.items = normalize_rows("notification", &rows, |r| notification_from_row(r, authors));
        self.status.error = None;
        debug!(count = self.items.len(), unread = self.unread(), "notifications loaded");

        if self.inbox.subscriptions() == 0 {
            let realtime = self.env.services.realtime.clone();
            self.inbox.subscribe(
                &*realtime,
                ChannelFilter::table(table::NOTIFICATIONS).eq("user_id", self.env.me_id()),
            );
        }
        self.publish();
        Ok(())
    }

    // ── Read state ──

    pub fn begin_mark_read(&mut self, id: &str) -> Result<Pending<String>> {
        self.visit.ensure_live("notifications")?;
        let item = self
            .items
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| ClientError::NotFound(format!("notification '{}'", id)))?;
        let mutation = self.reads.apply(id.to_string(), item.read);
        item.read = true;
        let write = Write::Update {
            table: table::NOTIFICATIONS,
            filters: vec![Filter::eq("id", id)],
            patch: json!({"is_read": true}),
        };
        self.publish();
        Ok(Pending::new(self.visit.token, mutation, write, id.to_string()))
    }

    pub fn settle_mark_read(&mut self, pending: Pending<String>, outcome: Result<Option<Row>>) -> Settled {
        if !self.visit.accepts(&pending) {
            return Settled::Ignored;
        }
        let Pending { mutation, meta, .. } = pending;
        let settled = match outcome {
            Ok(_) => {
                self.reads.confirm(mutation);
                Settled::Confirmed
            }
            Err(e) => {
                warn!(notification = %meta, error = %e, "reverting read flag");
                self.restore(&meta, mutation);
                self.status.notice = Some(ViewError::transient(&e));
                Settled::RolledBack
            }
        };
        self.publish();
        settled
    }

    fn restore(&mut self, id: &str, mutation: MutationId) {
        if let Rollback::Restore(read) = self.reads.roll_back(mutation) {
            on_updated(&mut self.items, id, |n| n.read = read);
        }
    }

    pub async fn mark_read(&mut self, id: &str) -> Result<Settled> {
        if self.items.iter().any(|n| n.id == id && n.read) {
            return Ok(Settled::Confirmed);
        }
        let pending = self.begin_mark_read(id)?;
        let data = self.env.services.data.clone();
        let outcome = pending.run(&*data).await;
        Ok(self.settle_mark_read(pending, outcome))
    }

    /// Mark every unread notification read with one backend write.
    pub async fn mark_all_read(&mut self) -> Result<Settled> {
        self.visit.ensure_live("notifications")?;
        let mut applied = Vec::new();
        for n in self.items.iter_mut().filter(|n| !n.read) {
            applied.push((n.id.clone(), self.reads.apply(n.id.clone(), false)));
            n.read = true;
        }
        if applied.is_empty() {
            return Ok(Settled::Confirmed);
        }
        self.publish();
        let write = Write::Update {
            table: table::NOTIFICATIONS,
            filters: vec![
                Filter::eq("user_id", self.env.me_id()),
                Filter::eq("is_read", false),
            ],
            patch: json!({"is_read": true}),
        };
        let data = self.env.services.data.clone();
        let outcome = write.run(&*data).await;
        if self.visit.disposed {
            return Ok(Settled::Ignored);
        }
        let settled = match outcome {
            Ok(_) => {
                for (_, mutation) in applied {
                    self.reads.confirm(mutation);
                }
                Settled::Confirmed
            }
            Err(e) => {
                warn!(count = applied.len(), error = %e, "reverting read flags");
                for (id, mutation) in applied {
                    self.restore(&id, mutation);
                }
                self.status.notice = Some(ViewError::transient(&e));
                Settled::RolledBack
            }
        };
        self.publish();
        Ok(settled)
    }

    // ── Real-time / lifecycle ──

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
            let row = event.record();
            let Some(id) = column(row, "id").and_then(scalar_text) else {
                continue;
            };
            match event.op {
                ChangeOp::Insert => {
                    ensure_author(&*data, &mut self.authors, row, "actor_id").await;
                    match notification_from_row(row, &self.authors) {
                        Ok(n) => {
                            on_inserted(&mut self.items, n, &Placement::Prepend);
                        }
                        Err(e) => warn!(error = %e, "dropping pushed notification"),
                    }
                }
                ChangeOp::Update => {
                    on_updated(&mut self.items, &id, |n| patch_notification(n, row));
                }
                ChangeOp::Delete => {
                    on_deleted(&mut self.items, &id);
                }
            }
        }
        self.publish();
        events.len()
    }

    pub fn publish(&self) {
        self.env.store.set(
            NotificationList::PATH,
            NotificationList {
                items: self.items.clone(),
                unread: self.unread(),
                status: self.status.clone(),
            },
        );
    }

    pub fn dispose(&mut self) {
        self.visit.disposed = true;
        self.inbox.close();
        self.reads.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::testing::{fixture, ts, Fixture};
    use pulse_client::{DataStore, Op};

    fn notification(id: &str, actor: &str, kind: &str, read: bool, minutes: i64) -> Row {
        json!({
            "id": id,
            "user_id": "me",
            "actor_id": actor,
            "type": kind,
            "post_id": null,
            "is_read": read,
            "created_at": ts(minutes),
        })
    }

    async fn open(f: &Fixture) -> NotificationCenter {
        let mut center = NotificationCenter::new(f.env.clone());
        center.load().await.unwrap();
        center
    }

    #[tokio::test]
    async fn loads_own_notifications_newest_first() {
        let f = fixture();
        f.backend.seed(
            table::NOTIFICATIONS,
            [
                notification("n1", "u2", "like", false, 0),
                notification("n2", "u3", "follow", true, 5),
                json!({"id": "n3", "user_id": "u2", "actor_id": "me", "type": "like", "is_read": false, "created_at": ts(9)}),
            ],
        );
        let center = open(&f).await;
        let ids: Vec<_> = center.items().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n2", "n1"]);
        assert_eq!(center.unread(), 1);
        assert_eq!(center.items()[1].actor.display_name, "Bea");

        let list: NotificationList = f.env.store.get_as(NotificationList::PATH).unwrap();
        assert_eq!(list.unread, 1);
    }

    #[tokio::test]
    async fn mark_read_failure_restores_flag() {
        let f = fixture();
        f.backend.seed(table::NOTIFICATIONS, [notification("n1", "u2", "like", false, 0)]);
        let mut center = open(&f).await;
        f.backend.fail_next(Op::Update, table::NOTIFICATIONS, ClientError::Network("x".into()));
        assert_eq!(center.mark_read("n1").await.unwrap(), Settled::RolledBack);
        assert_eq!(center.unread(), 1);

        assert_eq!(center.mark_read("n1").await.unwrap(), Settled::Confirmed);
        assert_eq!(center.unread(), 0);
    }

    #[tokio::test]
    async fn mark_all_read_is_one_write() {
        let f = fixture();
        f.backend.seed(
            table::NOTIFICATIONS,
            [notification("n1", "u2", "like", false, 0), notification("n2", "u3", "comment", false, 1)],
        );
        let mut center = open(&f).await;
        assert_eq!(center.mark_all_read().await.unwrap(), Settled::Confirmed);
        assert_eq!(center.unread(), 0);
        assert!(f.backend.rows(table::NOTIFICATIONS).iter().all(|r| r["is_read"] == json!(true)));
    }

    #[tokio::test]
    async fn pushed_notification_resolves_actor() {
        let f = fixture();
        let mut center = open(&f).await;
        f.backend
            .insert(
                table::NOTIFICATIONS,
                json!({"user_id": "me", "actor_id": "u3", "type": "follow", "is_read": false}),
            )
            .await
            .unwrap();
        // Someone else's notification never reaches this queue.
        f.backend
            .insert(
                table::NOTIFICATIONS,
                json!({"user_id": "u2", "actor_id": "me", "type": "like", "is_read": false}),
            )
            .await
            .unwrap();
        assert_eq!(center.drain_events().await, 1);
        assert_eq!(center.unread(), 1);
        assert_eq!(center.items()[0].actor.display_name, "Caio");
    }

    #[tokio::test]
    async fn unknown_notification_cannot_be_marked() {
        let f = fixture();
        let mut center = open(&f).await;
        assert!(center.begin_mark_read("nope").is_err());
    }
}
