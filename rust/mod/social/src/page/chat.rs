//! One-to-one conversation with a peer.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use pulse_client::row::{column, scalar_text, table};
use pulse_client::{ChangeOp, ChannelFilter, Filter, Query, Row};
use pulse_core::{provisional_id, ClientError, Result};

use crate::model::{Message, User, UserId};
use crate::mutation::{MutationLedger, Rollback};
use crate::normalize::{message_from_row, normalize_rows, patch_message};
use crate::page::{fetch_user, Inbox, PageEnv, Pending, Settled, Visit, Write};
use crate::reconcile::{on_deleted, on_inserted, on_updated, settle_provisional, Placement};
use crate::state::{ChatThread, PageStatus, ViewError};

fn by_time(a: &Message, b: &Message) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

const ORDER: Placement<Message> = Placement::Sorted(by_time);

pub struct ChatPage {
    env: Arc<PageEnv>,
    visit: Visit,
    peer_id: UserId,
    peer: Option<User>,
    messages: Vec<Message>,
    /// Provisional message id per send in flight.
    sends: MutationLedger<String, ()>,
    inbox: Inbox,
    status: PageStatus,
}

impl ChatPage {
    pub fn new(env: Arc<PageEnv>, peer_id: &str) -> Self {
        Self {
            env,
            visit: Visit::new(),
            peer_id: peer_id.to_string(),
            peer: None,
            messages: Vec::new(),
            sends: MutationLedger::new(),
            inbox: Inbox::new(),
            status: PageStatus::default(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn peer(&self) -> Option<&User> {
        self.peer.as_ref()
    }

    /// Oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn status(&self) -> &PageStatus {
        &self.status
    }

    pub async fn load(&mut self) -> Result<()> {
        self.visit.ensure_live("chat")?;
        if self.peer_id == self.env.me_id() {
            return Err(ClientError::Validation("You cannot chat with yourself".into()));
        }
        self.status.loading = true;
        self.publish();
        let result = self.fetch().await;
        self.status.loading = false;
        if let Err(e) = result {
            warn!(peer_id = %self.peer_id, error = %e, "chat load failed");
            self.status.error = Some(ViewError::failed(&e));
            self.publish();
            return Err(e);
        }
        self.status.error = None;
        if self.inbox.subscriptions() == 0 {
            let realtime = self.env.services.realtime.clone();
            let me = self.env.me_id();
            self.inbox
                .subscribe(&*realtime, ChannelFilter::table(table::MESSAGES).eq("receiver_id", me));
            self.inbox
                .subscribe(&*realtime, ChannelFilter::table(table::MESSAGES).eq("sender_id", me));
        }
        self.publish();
        Ok(())
    }

    async fn fetch(&mut self) -> Result<()> {
        let data = self.env.services.data.clone();
        self.peer = Some(fetch_user(&*data, &self.peer_id).await?);
        let me = self.env.me_id();
        let query = Query::table(table::MESSAGES)
            .any_of(vec![
                vec![Filter::eq("sender_id", me), Filter::eq("receiver_id", self.peer_id.as_str())],
                vec![Filter::eq("sender_id", self.peer_id.as_str()), Filter::eq("receiver_id", me)],
            ])
            .order_asc("created_at");
        let rows = data.select(&query).await?;
        let mut messages = normalize_rows("message", &rows, message_from_row);
        messages.sort_by(by_time);
        debug!(peer_id = %self.peer_id, count = messages.len(), "conversation fetched");
        self.messages = messages;
        Ok(())
    }

    /// Show the message at once and queue its insert. Returns the pending
    /// send; its meta is the provisional id.
    pub fn begin_send(&mut self, text: &str) -> Result<Pending<String>> {
        self.visit.ensure_live("chat")?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::Validation("Message cannot be empty".into()));
        }
        let message = Message {
            id: provisional_id(),
            sender_id: self.env.me_id().to_string(),
            receiver_id: self.peer_id.clone(),
            text: text.to_string(),
            created_at: self.env.now(),
            provisional: true,
        };
        let local = message.id.clone();
        on_inserted(&mut self.messages, message, &ORDER);
        let mutation = self.sends.apply(local.clone(), ());
        let write = Write::Insert {
            table: table::MESSAGES,
            row: json!({
                "sender_id": self.env.me_id(),
                "receiver_id": self.peer_id,
                "content": text,
            }),
        };
        self.publish();
        Ok(Pending::new(self.visit.token, mutation, write, local))
    }

    pub fn settle_send(&mut self, pending: Pending<String>, outcome: Result<Option<Row>>) -> Settled {
        if !self.visit.accepts(&pending) {
            return Settled::Ignored;
        }
        let Pending {
            mutation,
            meta: local,
            ..
        } = pending;
        let confirmed = outcome.and_then(|row| {
            row.ok_or_else(|| ClientError::Decode("insert returned no row".into()))
                .and_then(|row| message_from_row(&row))
        });
        let settled = match confirmed {
            Ok(message) => {
                self.sends.confirm(mutation);
                settle_provisional(&mut self.messages, &local, message, &ORDER);
                Settled::Confirmed
            }
            Err(e) => {
                warn!(provisional = %local, error = %e, "message not sent");
                if let Rollback::Restore(()) = self.sends.roll_back(mutation) {
                    on_deleted(&mut self.messages, &local);
                }
                self.status.notice = Some(ViewError::transient(&e));
                Settled::RolledBack
            }
        };
        self.publish();
        settled
    }

    pub async fn send(&mut self, text: &str) -> Result<Settled> {
        let pending = self.begin_send(text)?;
        let data = self.env.services.data.clone();
        let outcome = pending.run(&*data).await;
        Ok(self.settle_send(pending, outcome))
    }

    pub async fn drain_events(&mut self) -> usize {
        if self.visit.disposed {
            return 0;
        }
        let events = self.inbox.drain();
        let me = self.env.me_id().to_string();
        for event in &events {
            if event.table != table::MESSAGES {
                continue;
            }
            let row = event.record();
            match event.op {
                ChangeOp::Insert => match message_from_row(row) {
                    Ok(message) if message.is_between(&me, &self.peer_id) => {
                        on_inserted(&mut self.messages, message, &ORDER);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "dropping pushed message"),
                },
                ChangeOp::Update => {
                    if let Some(id) = column(row, "id").and_then(scalar_text) {
                        on_updated(&mut self.messages, &id, |m| patch_message(m, row));
                    }
                }
                ChangeOp::Delete => {
                    if let Some(id) = column(row, "id").and_then(scalar_text) {
                        on_deleted(&mut self.messages, &id);
                    }
                }
            }
        }
        if !events.is_empty() {
            self.publish();
        }
        events.len()
    }

    pub fn publish(&self) {
        self.env.store.set(
            &ChatThread::path(&self.peer_id),
            ChatThread {
                peer_id: self.peer_id.clone(),
                peer: self.peer.clone(),
                messages: self.messages.clone(),
                status: self.status.clone(),
            },
        );
    }

    pub fn dispose(&mut self) {
        self.visit.disposed = true;
        self.inbox.close();
        self.sends.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::testing::{fixture, ts, Fixture};
    use pulse_client::{DataStore, Op};

    fn message(id: &str, from: &str, to: &str, text: &str, minutes: i64) -> Row {
        json!({"id": id, "sender_id": from, "receiver_id": to, "content": text, "created_at": ts(minutes)})
    }

    async fn open(f: &Fixture) -> ChatPage {
        let mut chat = ChatPage::new(f.env.clone(), "u2");
        chat.load().await.unwrap();
        chat
    }

    fn texts(chat: &ChatPage) -> Vec<&str> {
        chat.messages().iter().map(|m| m.text.as_str()).collect()
    }

    // ========================================================================
    // Loading
    // ========================================================================

    #[tokio::test]
    async fn loads_only_this_conversation_in_order() {
        let f = fixture();
        f.backend.seed(
            table::MESSAGES,
            [
                message("m2", "u2", "me", "second", 2),
                message("m1", "me", "u2", "first", 1),
                message("m3", "u3", "me", "elsewhere", 0),
                message("m4", "me", "u3", "elsewhere", 3),
            ],
        );
        let chat = open(&f).await;
        assert_eq!(texts(&chat), vec!["first", "second"]);
        assert_eq!(chat.peer().unwrap().display_name, "Bea");
    }

    #[tokio::test]
    async fn equal_timestamps_order_by_id() {
        let f = fixture();
        f.backend.seed(
            table::MESSAGES,
            [message("b", "u2", "me", "two", 1), message("a", "me", "u2", "one", 1)],
        );
        let chat = open(&f).await;
        assert_eq!(texts(&chat), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn missing_peer_fails() {
        let f = fixture();
        let mut chat = ChatPage::new(f.env.clone(), "ghost");
        assert!(chat.load().await.is_err());
        assert!(chat.status().error.is_some());
    }

    // ========================================================================
    // Sending
    // ========================================================================

    #[tokio::test]
    async fn send_replaces_provisional_once() {
        let f = fixture();
        let mut chat = open(&f).await;
        let pending = chat.begin_send("  hello  ").unwrap();
        assert!(chat.messages()[0].provisional);
        let outcome = pending.run(&*f.backend).await;
        // The echo lands before the insert response.
        chat.drain_events().await;
        assert_eq!(chat.settle_send(pending, outcome), Settled::Confirmed);
        assert_eq!(chat.messages().len(), 1);
        assert!(!chat.messages()[0].provisional);
        assert_eq!(chat.messages()[0].text, "hello");
    }

    #[tokio::test]
    async fn failed_send_removes_message() {
        let f = fixture();
        let mut chat = open(&f).await;
        f.backend.fail_next(Op::Insert, table::MESSAGES, ClientError::Network("x".into()));
        assert_eq!(chat.send("hi").await.unwrap(), Settled::RolledBack);
        assert!(chat.messages().is_empty());
        assert!(chat.status().notice.is_some());
    }

    #[tokio::test]
    async fn empty_message_rejected() {
        let f = fixture();
        let mut chat = open(&f).await;
        assert!(chat.begin_send("   ").is_err());
    }

    // ========================================================================
    // Real-time
    // ========================================================================

    #[tokio::test]
    async fn pushed_messages_are_filtered_to_the_peer() {
        let f = fixture();
        let mut chat = open(&f).await;
        f.backend.insert(table::MESSAGES, json!({"sender_id": "u2", "receiver_id": "me", "content": "yo"})).await.unwrap();
        f.backend.insert(table::MESSAGES, json!({"sender_id": "u3", "receiver_id": "me", "content": "psst"})).await.unwrap();
        chat.drain_events().await;
        assert_eq!(texts(&chat), vec!["yo"]);
    }

    #[tokio::test]
    async fn settle_after_dispose_is_ignored() {
        let f = fixture();
        let mut chat = open(&f).await;
        let pending = chat.begin_send("late").unwrap();
        chat.dispose();
        let outcome = pending.run(&*f.backend).await;
        assert_eq!(chat.settle_send(pending, outcome), Settled::Ignored);
    }
}
