//! Merging pushed change events into owned collections.
//!
//! Controllers call these with `&mut` access to the collection they own.
//! Inserts de-duplicate by id and pair provisional entries with their
//! server records by natural key; updates patch in place; deletes are
//! idempotent; like events are guarded against the current user's own
//! optimistic changes.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::model::{Bucket, Comment, LikeState, Likeable, Message, Notification, Post, Reel, Story};
use crate::mutation::PendingEchoes;

/// Something with an identity key, optionally a provisional one.
pub trait Entity {
    fn id(&self) -> &str;

    fn is_provisional(&self) -> bool {
        false
    }

    /// Content-derived key pairing a provisional entry with its server
    /// record. `None` for entities that are never created provisionally.
    fn natural_key(&self) -> Option<String> {
        None
    }
}

/// Collapse runs of whitespace and trim, so "hi  there " pairs with
/// "hi there".
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl Entity for Comment {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_provisional(&self) -> bool {
        self.provisional
    }

    fn natural_key(&self) -> Option<String> {
        Some(format!("{}|{}|{}", self.author.id, self.post_id, normalize_text(&self.text)))
    }
}

impl Entity for Message {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_provisional(&self) -> bool {
        self.provisional
    }

    fn natural_key(&self) -> Option<String> {
        Some(format!("{}|{}|{}", self.sender_id, self.receiver_id, normalize_text(&self.text)))
    }
}

macro_rules! entity_by_id {
    ($($ty:ty),*) => {
        $(impl Entity for $ty {
            fn id(&self) -> &str {
                &self.id
            }
        })*
    };
}

entity_by_id!(Post, Reel, Story, Notification, Bucket);

// ── Inserts ─────────────────────────────────────────────────────────

/// Where a new entity goes in its collection.
pub enum Placement<T> {
    /// Newest first (feeds, notifications).
    Prepend,
    /// Oldest first, arrival order (comments).
    Append,
    /// Kept sorted by the comparator (messages).
    Sorted(fn(&T, &T) -> Ordering),
}

impl<T> Clone for Placement<T> {
    fn clone(&self) -> Self {
        match self {
            Placement::Prepend => Placement::Prepend,
            Placement::Append => Placement::Append,
            Placement::Sorted(f) => Placement::Sorted(*f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// An entity with this id is already present; nothing changed.
    AlreadyPresent(usize),
    /// A provisional entry with the same natural key was replaced.
    ReplacedProvisional(usize),
    Inserted(usize),
}

impl InsertOutcome {
    /// Whether the collection grew.
    pub fn grew(self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

fn position_of<T: Entity>(items: &[T], id: &str) -> Option<usize> {
    items.iter().position(|i| i.id() == id)
}

fn place<T>(items: &mut Vec<T>, item: T, placement: &Placement<T>) -> usize {
    match placement {
        Placement::Prepend => {
            items.insert(0, item);
            0
        }
        Placement::Append => {
            items.push(item);
            items.len() - 1
        }
        Placement::Sorted(cmp) => {
            // After equal elements, so equal keys keep arrival order.
            let pos = items.partition_point(|x| cmp(x, &item) != Ordering::Greater);
            items.insert(pos, item);
            pos
        }
    }
}

fn replace_at<T>(items: &mut Vec<T>, index: usize, item: T, placement: &Placement<T>) -> usize {
    if let Placement::Sorted(_) = placement {
        items.remove(index);
        place(items, item, placement)
    } else {
        items[index] = item;
        index
    }
}

/// Merge an inserted entity.
pub fn on_inserted<T: Entity>(
    items: &mut Vec<T>,
    incoming: T,
    placement: &Placement<T>,
) -> InsertOutcome {
    if let Some(i) = position_of(items, incoming.id()) {
        return InsertOutcome::AlreadyPresent(i);
    }
    if let Some(key) = incoming.natural_key() {
        let provisional = items
            .iter()
            .position(|i| i.is_provisional() && i.natural_key().as_deref() == Some(key.as_str()));
        if let Some(i) = provisional {
            trace!(id = incoming.id(), "provisional entry reconciled");
            return InsertOutcome::ReplacedProvisional(replace_at(items, i, incoming, placement));
        }
    }
    InsertOutcome::Inserted(place(items, incoming, placement))
}

/// The backend confirmed a provisional entity with `confirmed`. Replaces
/// the provisional entry unless a real-time insert already did.
pub fn settle_provisional<T: Entity>(
    items: &mut Vec<T>,
    provisional_id: &str,
    confirmed: T,
    placement: &Placement<T>,
) -> InsertOutcome {
    if let Some(i) = position_of(items, confirmed.id()) {
        if let Some(p) = position_of(items, provisional_id) {
            items.remove(p);
            return InsertOutcome::AlreadyPresent(if p < i { i - 1 } else { i });
        }
        return InsertOutcome::AlreadyPresent(i);
    }
    match position_of(items, provisional_id) {
        Some(p) => InsertOutcome::ReplacedProvisional(replace_at(items, p, confirmed, placement)),
        None => on_inserted(items, confirmed, placement),
    }
}

// ── Updates / deletes ───────────────────────────────────────────────

/// Patch the entity with `id` in place. Returns whether it was found.
pub fn on_updated<T: Entity, F: FnOnce(&mut T)>(items: &mut [T], id: &str, patch: F) -> bool {
    match items.iter_mut().find(|i| i.id() == id) {
        Some(item) => {
            patch(item);
            true
        }
        None => false,
    }
}

/// Remove by id, returning the entity and its former index. Absent ids
/// are a no-op.
pub fn on_deleted<T: Entity>(items: &mut Vec<T>, id: &str) -> Option<(usize, T)> {
    let i = position_of(items, id)?;
    Some((i, items.remove(i)))
}

// ── Likes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeOutcome {
    /// The event is the echo of our own optimistic toggle.
    EchoConsumed,
    /// Our own like whose effect is already visible (e.g. from a reload).
    AlreadyReflected,
    Applied(LikeState),
    /// No such entity in the collection.
    Unknown,
}

/// Apply a like (or unlike) by `user_id` on `target_id`.
pub fn on_like_event<T: Entity + Likeable>(
    items: &mut [T],
    echoes: &mut PendingEchoes<String>,
    target_id: &str,
    user_id: &str,
    added: bool,
    me: &str,
    now: DateTime<Utc>,
) -> LikeOutcome {
    let own = user_id == me;
    if own && echoes.consume(&target_id.to_string(), added, now) {
        return LikeOutcome::EchoConsumed;
    }
    let Some(item) = items.iter_mut().find(|i| i.id() == target_id) else {
        return LikeOutcome::Unknown;
    };
    let mut state = item.like_state();
    if own && state.is_liked == added {
        return LikeOutcome::AlreadyReflected;
    }
    state.likes = if added {
        state.likes + 1
    } else {
        state.likes.saturating_sub(1)
    };
    if own {
        state.is_liked = added;
    }
    item.set_like_state(state);
    LikeOutcome::Applied(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;
    use chrono::{Duration, TimeZone};

    fn user(id: &str) -> User {
        User {
            id: id.into(),
            username: id.into(),
            display_name: id.into(),
            avatar_url: None,
            bio: None,
            gender: None,
            country: None,
            online: false,
            followers: 0,
            following: 0,
            posts: 0,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_714_560_000 + secs, 0).unwrap()
    }

    fn comment(id: &str, text: &str, provisional: bool) -> Comment {
        Comment {
            id: id.into(),
            post_id: "p1".into(),
            author: user("u1"),
            text: text.into(),
            created_at: at(0),
            provisional,
        }
    }

    fn message(id: &str, secs: i64) -> Message {
        Message {
            id: id.into(),
            sender_id: "a".into(),
            receiver_id: "b".into(),
            text: id.into(),
            created_at: at(secs),
            provisional: false,
        }
    }

    fn by_time(a: &Message, b: &Message) -> Ordering {
        a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
    }

    fn post(id: &str, likes: u32, is_liked: bool) -> Post {
        Post {
            id: id.into(),
            author: user("u2"),
            content: String::new(),
            media: None,
            created_at: at(0),
            likes,
            comments: vec![],
            shares: 0,
            is_liked,
            is_saved: false,
        }
    }

    // ========================================================================
    // Inserts
    // ========================================================================

    #[test]
    fn insert_replaces_matching_provisional() {
        let mut items = vec![comment("local-1", "nice  shot ", true)];
        let outcome = on_inserted(&mut items, comment("c9", "nice shot", false), &Placement::Append);
        assert_eq!(outcome, InsertOutcome::ReplacedProvisional(0));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "c9");
        assert!(!items[0].provisional);
    }

    #[test]
    fn insert_with_known_id_is_noop() {
        let mut items = vec![comment("c1", "a", false)];
        assert_eq!(
            on_inserted(&mut items, comment("c1", "a", false), &Placement::Append),
            InsertOutcome::AlreadyPresent(0)
        );
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn insert_does_not_pair_with_confirmed_entries() {
        let mut items = vec![comment("c1", "same", false)];
        let outcome = on_inserted(&mut items, comment("c2", "same", false), &Placement::Append);
        assert!(outcome.grew());
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn identical_provisionals_pair_in_order() {
        let mut items = vec![comment("local-1", "+1", true), comment("local-2", "+1", true)];
        on_inserted(&mut items, comment("c1", "+1", false), &Placement::Append);
        on_inserted(&mut items, comment("c2", "+1", false), &Placement::Append);
        let ids: Vec<&str> = items.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn prepend_and_sorted_placement() {
        let mut posts = vec![post("p1", 0, false)];
        assert_eq!(
            on_inserted(&mut posts, post("p2", 0, false), &Placement::Prepend),
            InsertOutcome::Inserted(0)
        );

        let mut msgs = vec![message("m1", 10), message("m3", 30)];
        let sorted = Placement::Sorted(by_time);
        assert_eq!(on_inserted(&mut msgs, message("m2", 20), &sorted), InsertOutcome::Inserted(1));
        assert_eq!(on_inserted(&mut msgs, message("m0", 0), &sorted), InsertOutcome::Inserted(0));
    }

    #[test]
    fn sorted_replacement_moves_to_server_time() {
        let mut local = message("local-x", 100);
        local.text = "hey".into();
        local.provisional = true;
        let mut msgs = vec![message("m1", 10), local, message("m2", 50)];

        let mut server = message("m9", 40);
        server.text = "hey".into();
        let outcome = on_inserted(&mut msgs, server, &Placement::Sorted(by_time));
        assert_eq!(outcome, InsertOutcome::ReplacedProvisional(1));
        let ids: Vec<&str> = msgs.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m9", "m2"]);
    }

    // ========================================================================
    // Settling provisional entries
    // ========================================================================

    #[test]
    fn settle_replaces_provisional_by_id() {
        let mut items = vec![comment("local-1", "a", true)];
        let outcome = settle_provisional(&mut items, "local-1", comment("c1", "a", false), &Placement::Append);
        assert_eq!(outcome, InsertOutcome::ReplacedProvisional(0));
        assert_eq!(items[0].id, "c1");
    }

    #[test]
    fn settle_after_realtime_insert_does_not_duplicate() {
        let mut items = vec![comment("local-1", "a", true)];
        on_inserted(&mut items, comment("c1", "a", false), &Placement::Append);
        let outcome = settle_provisional(&mut items, "local-1", comment("c1", "a", false), &Placement::Append);
        assert_eq!(outcome, InsertOutcome::AlreadyPresent(0));
        assert_eq!(items.len(), 1);
    }

    // ========================================================================
    // Updates and deletes
    // ========================================================================

    #[test]
    fn delete_is_idempotent() {
        let mut items = vec![post("p1", 0, false), post("p2", 0, false)];
        let (index, removed) = on_deleted(&mut items, "p2").unwrap();
        assert_eq!((index, removed.id.as_str()), (1, "p2"));
        assert!(on_deleted(&mut items, "p2").is_none());
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn update_patches_in_place() {
        let mut items = vec![post("p1", 3, true)];
        assert!(on_updated(&mut items, "p1", |p| p.content = "edited".into()));
        assert!(!on_updated(&mut items, "p9", |p| p.content = "x".into()));
        assert_eq!(items[0].content, "edited");
        assert_eq!(items[0].likes, 3);
    }

    // ========================================================================
    // Likes
    // ========================================================================

    #[test]
    fn own_echo_is_skipped() {
        let now = at(0);
        let mut echoes = PendingEchoes::new(Duration::seconds(10));
        let mut posts = vec![post("p1", 16, true)];
        echoes.expect("p1".to_string(), true, now);

        let outcome = on_like_event(&mut posts, &mut echoes, "p1", "me", true, "me", now);
        assert_eq!(outcome, LikeOutcome::EchoConsumed);
        assert_eq!(posts[0].likes, 16);
    }

    #[test]
    fn own_like_without_echo_already_reflected() {
        let mut echoes = PendingEchoes::new(Duration::seconds(10));
        let mut posts = vec![post("p1", 16, true)];
        let outcome = on_like_event(&mut posts, &mut echoes, "p1", "me", true, "me", at(0));
        assert_eq!(outcome, LikeOutcome::AlreadyReflected);
        assert_eq!(posts[0].likes, 16);
    }

    #[test]
    fn own_like_from_elsewhere_sets_flag() {
        let mut echoes = PendingEchoes::new(Duration::seconds(10));
        let mut posts = vec![post("p1", 15, false)];
        let outcome = on_like_event(&mut posts, &mut echoes, "p1", "me", true, "me", at(0));
        assert_eq!(outcome, LikeOutcome::Applied(LikeState { likes: 16, is_liked: true }));
    }

    #[test]
    fn other_users_move_count_only() {
        let mut echoes = PendingEchoes::new(Duration::seconds(10));
        let mut posts = vec![post("p1", 0, true)];
        on_like_event(&mut posts, &mut echoes, "p1", "u7", true, "me", at(0));
        assert_eq!(posts[0].like_state(), LikeState { likes: 1, is_liked: true });
        on_like_event(&mut posts, &mut echoes, "p1", "u7", false, "me", at(0));
        on_like_event(&mut posts, &mut echoes, "p1", "u8", false, "me", at(0));
        assert_eq!(posts[0].like_state(), LikeState { likes: 0, is_liked: true });
        assert_eq!(
            on_like_event(&mut posts, &mut echoes, "p9", "u7", true, "me", at(0)),
            LikeOutcome::Unknown
        );
    }
}
