//! Client-side view models.
//!
//! These are what the page controllers own and publish. Backend rows are
//! mapped into them by [`crate::normalize`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub gender: Option<String>,
    pub country: Option<String>,
    pub online: bool,
    pub followers: u32,
    pub following: u32,
    pub posts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "url", rename_all = "lowercase")]
pub enum Media {
    Image(String),
    Video(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author: User,
    pub content: String,
    pub media: Option<Media>,
    pub created_at: DateTime<Utc>,
    pub likes: u32,
    pub comments: Vec<Comment>,
    pub shares: u32,
    pub is_liked: bool,
    pub is_saved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    /// Parent post (or reel) id.
    pub post_id: String,
    pub author: User,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Still waiting for its server record.
    pub provisional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reel {
    pub id: String,
    pub author: User,
    pub video_url: String,
    pub caption: String,
    pub music: Option<String>,
    pub created_at: DateTime<Utc>,
    pub likes: u32,
    pub comments: Vec<Comment>,
    pub shares: u32,
    pub is_liked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoryKind {
    Image { url: String },
    Text { text: String, background: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub author: User,
    pub kind: StoryKind,
    pub caption: Option<String>,
    pub created_at: DateTime<Utc>,
    pub viewers: BTreeSet<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub provisional: bool,
}

impl Message {
    /// Whether this message belongs to the conversation between `a` and `b`.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Like,
    Comment,
    Follow,
    Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub actor: User,
    pub post_id: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub owner_id: UserId,
    pub name: String,
    pub post_ids: BTreeSet<String>,
}

// ── Likeable ────────────────────────────────────────────────────────

/// Entities with a like counter and a liked-by-me flag.
pub trait Likeable {
    fn like_state(&self) -> LikeState;
    fn set_like_state(&mut self, state: LikeState);
}

/// The pair that must move together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeState {
    pub likes: u32,
    pub is_liked: bool,
}

impl LikeState {
    /// State after the current user toggles.
    pub fn toggled(self) -> Self {
        if self.is_liked {
            Self {
                likes: self.likes.saturating_sub(1),
                is_liked: false,
            }
        } else {
            Self {
                likes: self.likes + 1,
                is_liked: true,
            }
        }
    }
}

impl Likeable for Post {
    fn like_state(&self) -> LikeState {
        LikeState {
            likes: self.likes,
            is_liked: self.is_liked,
        }
    }

    fn set_like_state(&mut self, state: LikeState) {
        self.likes = state.likes;
        self.is_liked = state.is_liked;
    }
}

impl Likeable for Reel {
    fn like_state(&self) -> LikeState {
        LikeState {
            likes: self.likes,
            is_liked: self.is_liked,
        }
    }

    fn set_like_state(&mut self, state: LikeState) {
        self.likes = state.likes;
        self.is_liked = state.is_liked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggled_moves_count_with_flag() {
        let s = LikeState {
            likes: 15,
            is_liked: false,
        };
        assert_eq!(
            s.toggled(),
            LikeState {
                likes: 16,
                is_liked: true
            }
        );
        assert_eq!(s.toggled().toggled(), s);
    }

    #[test]
    fn unlike_at_zero_saturates() {
        let s = LikeState {
            likes: 0,
            is_liked: true,
        };
        assert_eq!(s.toggled().likes, 0);
    }

    #[test]
    fn conversation_membership_is_symmetric() {
        let m = Message {
            id: "m1".into(),
            sender_id: "a".into(),
            receiver_id: "b".into(),
            text: "hi".into(),
            created_at: Utc::now(),
            provisional: false,
        };
        assert!(m.is_between("a", "b"));
        assert!(m.is_between("b", "a"));
        assert!(!m.is_between("a", "c"));
    }
}
