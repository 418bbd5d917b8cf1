use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use pulse_core::Result;
use pulse_flux::Trie;

use crate::collab::{ChangeEvent, ChannelFilter, EventSink, Realtime, SubscriptionGuard};
use crate::row::scalar_text;

/// In-process fan-out of change events to channel subscriptions.
///
/// Subscriptions are stored in a topic trie: a table-wide subscription
/// under `{table}/#`, a filtered one under `{table}/{column}/{value}`.
/// An event is published to `{table}` and to `{table}/{column}/{value}`
/// for every scalar column of its record, so one subscription can match
/// several topics; delivery is de-duplicated per subscription.
#[derive(Clone, Default)]
pub struct RealtimeHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    trie: Trie<Entry>,
    next_id: AtomicU64,
}

#[derive(Clone)]
struct Entry {
    id: u64,
    sink: EventSink,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every matching subscription. Returns the number
    /// of subscriptions reached.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let mut delivered = HashSet::new();
        for topic in topics(event) {
            for entry in self.inner.trie.match_topic(&topic) {
                if !delivered.insert(entry.id) {
                    continue;
                }
                if entry.sink.send(event.clone()).is_err() {
                    trace!(subscription = entry.id, "receiver gone, dropping event");
                }
            }
        }
        trace!(table = %event.table, op = ?event.op, delivered = delivered.len(), "published");
        delivered.len()
    }

    pub fn has_subscribers(&self, filter: &ChannelFilter) -> bool {
        self.inner.trie.has_pattern(&pattern(filter))
    }
}

impl Realtime for RealtimeHub {
    fn subscribe(&self, filter: ChannelFilter, sink: EventSink) -> Result<SubscriptionGuard> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let pattern = pattern(&filter);
        debug!(%filter, id, "realtime subscribe");
        self.inner.trie.insert(&pattern, Entry { id, sink });

        let inner = Arc::downgrade(&self.inner);
        Ok(SubscriptionGuard::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.trie.remove(&pattern, |e| e.id == id);
                debug!(pattern, id, "realtime unsubscribe");
            }
        }))
    }
}

fn pattern(filter: &ChannelFilter) -> String {
    match &filter.column_eq {
        None => format!("{}/#", filter.table),
        Some((col, value)) => format!("{}/{}/{}", filter.table, col, value),
    }
}

fn topics(event: &ChangeEvent) -> Vec<String> {
    let mut out = vec![event.table.clone()];
    if let Some(obj) = event.record().as_object() {
        for (col, value) in obj {
            // Values containing topic separators can't be addressed by a
            // filtered subscription; table-wide ones still see them.
            if let Some(text) = scalar_text(value).filter(|t| !t.contains(['/', '+', '#'])) {
                out.push(format!("{}/{}/{}", event.table, col, text));
            }
        }
    }
    out
}
