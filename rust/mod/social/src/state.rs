//! Published view state.
//!
//! Controllers own their collections and publish a snapshot into the
//! [`StateStore`](pulse_flux::StateStore) after every change. A UI layer
//! reads these paths or subscribes to patterns such as `profile/+` or
//! `chat/#`.

use serde::{Deserialize, Serialize};

use pulse_core::ClientError;

use crate::model::{Bucket, Message, Notification, Post, Reel, User, UserId};
use crate::page::Page;
use crate::stories::{StoryGroup, ViewerSnapshot};

/// Store paths.
pub mod path {
    pub const FEED_POSTS: &str = "feed/posts";
    pub const FEED_BUCKETS: &str = "feed/buckets";
    pub const STORY_TRAY: &str = "stories/tray";
    pub const STORY_VIEWER: &str = "stories/viewer";
    pub const SHORTS_REELS: &str = "shorts/reels";
    pub const NOTIFICATIONS: &str = "notifications/list";
    pub const APP_PAGE: &str = "app/page";
    pub const AUTH_SESSION: &str = "auth/session";

    pub fn profile(user_id: &str) -> String {
        format!("profile/{}", user_id)
    }

    pub fn profile_posts(user_id: &str) -> String {
        format!("profile/{}/posts", user_id)
    }

    pub fn chat(peer_id: &str) -> String {
        format!("chat/{}/messages", peer_id)
    }
}

/// A user-visible error attached to a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ViewError {
    /// An action failed and was reverted; shown as a toast.
    Transient { code: String, message: String },
    /// The page content could not be loaded.
    Failed { code: String, message: String },
}

impl ViewError {
    pub fn transient(err: &ClientError) -> Self {
        ViewError::Transient {
            code: err.error_code().to_string(),
            message: err.user_message(),
        }
    }

    pub fn failed(err: &ClientError) -> Self {
        ViewError::Failed {
            code: err.error_code().to_string(),
            message: err.user_message(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ViewError::Transient { message, .. } | ViewError::Failed { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageStatus {
    pub loading: bool,
    pub has_more: bool,
    /// Load failure, shown in place of content.
    pub error: Option<ViewError>,
    /// Last reverted action.
    pub notice: Option<ViewError>,
}

/// A rendered list with its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub status: PageStatus,
}

/// Published at [`path::FEED_POSTS`] and [`path::profile_posts`].
pub type PostList = Listing<Post>;

/// Published at [`path::SHORTS_REELS`].
pub type ReelList = Listing<Reel>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketList {
    pub buckets: Vec<Bucket>,
}

impl BucketList {
    pub const PATH: &'static str = path::FEED_BUCKETS;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryTray {
    pub groups: Vec<StoryGroup>,
}

impl StoryTray {
    pub const PATH: &'static str = path::STORY_TRAY;
}

impl ViewerSnapshot {
    pub const PATH: &'static str = path::STORY_VIEWER;
}

/// Profile header; the posts are a separate [`PostList`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileView {
    pub user: Option<User>,
    pub is_me: bool,
    pub followed_by_me: bool,
    pub status: PageStatus,
}

impl ProfileView {
    pub fn path(user_id: &str) -> String {
        path::profile(user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatThread {
    pub peer_id: UserId,
    pub peer: Option<User>,
    pub messages: Vec<Message>,
    pub status: PageStatus,
}

impl ChatThread {
    pub fn path(peer_id: &str) -> String {
        path::chat(peer_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationList {
    pub items: Vec<Notification>,
    pub unread: usize,
    pub status: PageStatus,
}

impl NotificationList {
    pub const PATH: &'static str = path::NOTIFICATIONS;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthState {
    pub user: Option<User>,
}

impl AuthState {
    pub const PATH: &'static str = path::AUTH_SESSION;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    pub page: Page,
}

impl AppState {
    pub const PATH: &'static str = path::APP_PAGE;
}
