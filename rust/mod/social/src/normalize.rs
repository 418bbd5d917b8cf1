//! Backend rows → view models.
//!
//! Pure functions. A row whose required relation (an author or actor)
//! cannot be resolved is rejected with `MissingRelation`; list loaders use
//! [`normalize_rows`] to drop such rows and log them.

use std::collections::{BTreeSet, HashMap};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

use pulse_client::row::{column, column_str, scalar_text};
use pulse_client::Row;
use pulse_core::{parse_timestamp, ClientError, Result};

use crate::model::{
    Bucket, Comment, LikeState, Media, Message, Notification, NotificationKind, Post, Reel,
    Story, StoryKind, User, UserId,
};

// ── Row shapes ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ProfileRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    username: Option<String>,
    full_name: Option<String>,
    avatar_url: Option<String>,
    bio: Option<String>,
    gender: Option<String>,
    country: Option<String>,
    #[serde(default)]
    is_online: Option<bool>,
    followers_count: Option<u32>,
    following_count: Option<u32>,
    posts_count: Option<u32>,
}

#[derive(Deserialize)]
struct PostRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    content: Option<String>,
    image_url: Option<String>,
    video_url: Option<String>,
    created_at: String,
    shares: Option<u32>,
}

#[derive(Deserialize)]
struct CommentRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(alias = "reel_id", deserialize_with = "id_string")]
    post_id: String,
    content: String,
    created_at: String,
}

#[derive(Deserialize)]
struct ReelRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    video_url: String,
    caption: Option<String>,
    music: Option<String>,
    created_at: String,
    shares: Option<u32>,
}

#[derive(Deserialize)]
struct StoryRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(rename = "type")]
    kind: String,
    content: String,
    caption: Option<String>,
    background: Option<String>,
    created_at: String,
    #[serde(default)]
    viewers: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct MessageRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(deserialize_with = "id_string")]
    sender_id: String,
    #[serde(deserialize_with = "id_string")]
    receiver_id: String,
    content: String,
    created_at: String,
}

#[derive(Deserialize)]
struct NotificationRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(rename = "type")]
    kind: NotificationKind,
    #[serde(default, deserialize_with = "opt_id_string")]
    post_id: Option<String>,
    #[serde(default)]
    is_read: bool,
    created_at: String,
}

#[derive(Deserialize)]
struct BucketRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(deserialize_with = "id_string")]
    user_id: String,
    name: String,
}

/// Ids arrive as strings or numbers depending on the table.
fn id_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    let v = Value::deserialize(d)?;
    scalar_text(&v).ok_or_else(|| serde::de::Error::custom(format!("invalid id {}", v)))
}

fn opt_id_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(scalar_text(&v))
}

fn decode<T: DeserializeOwned>(entity: &str, row: &Row) -> Result<T> {
    T::deserialize(row).map_err(|e| ClientError::Decode(format!("{} row: {}", entity, e)))
}

// ── Author cache ────────────────────────────────────────────────────

/// Users seen so far in this page visit, keyed by id.
///
/// Real-time rows arrive without joined relations; their author is looked
/// up here (or fetched by the controller and then inserted).
#[derive(Debug, Clone, Default)]
pub struct AuthorCache {
    users: HashMap<UserId, User>,
}

impl AuthorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&User> {
        self.users.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.users.contains_key(id)
    }

    pub fn insert(&mut self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    /// Record the user joined under `alias`, if present and decodable.
    pub fn absorb(&mut self, row: &Row, alias: &str) {
        if let Some(joined) = column(row, alias).filter(|v| v.is_object()) {
            match user_from_row(joined) {
                Ok(user) => self.insert(user),
                Err(e) => warn!(error = %e, "undecodable joined profile"),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Resolve the `alias` relation of a row: the joined object, else the
    /// cached user with id `row[key]`.
    fn resolve(
        &self,
        row: &Row,
        alias: &str,
        key: &str,
        entity: &'static str,
        relation: &'static str,
    ) -> Result<User> {
        if let Some(joined) = column(row, alias).filter(|v| v.is_object()) {
            return user_from_row(joined);
        }
        let user_id = column(row, key).and_then(scalar_text);
        user_id
            .as_deref()
            .and_then(|id| self.get(id))
            .cloned()
            .ok_or_else(|| ClientError::MissingRelation {
                entity,
                id: column(row, "id").and_then(scalar_text).unwrap_or_default(),
                relation,
            })
    }
}

// ── Entities ────────────────────────────────────────────────────────

pub fn user_from_row(row: &Row) -> Result<User> {
    let r: ProfileRow = decode("profile", row)?;
    let username = r.username.unwrap_or_else(|| r.id.clone());
    Ok(User {
        display_name: r
            .full_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| username.clone()),
        id: r.id,
        username,
        avatar_url: r.avatar_url,
        bio: r.bio,
        gender: r.gender,
        country: r.country,
        online: r.is_online.unwrap_or(false),
        followers: r.followers_count.unwrap_or(0),
        following: r.following_count.unwrap_or(0),
        posts: r.posts_count.unwrap_or(0),
    })
}

/// Post without like/comment aggregates; those come from their own tables.
pub fn post_from_row(row: &Row, authors: &AuthorCache) -> Result<Post> {
    let author = authors.resolve(row, "author", "user_id", "post", "author")?;
    let r: PostRow = decode("post", row)?;
    Ok(Post {
        id: r.id,
        author,
        content: r.content.unwrap_or_default(),
        media: media_of(r.image_url, r.video_url),
        created_at: parse_timestamp(&r.created_at)?,
        likes: 0,
        comments: Vec::new(),
        shares: r.shares.unwrap_or(0),
        is_liked: false,
        is_saved: false,
    })
}

pub fn comment_from_row(row: &Row, authors: &AuthorCache) -> Result<Comment> {
    let author = authors.resolve(row, "author", "user_id", "comment", "author")?;
    let r: CommentRow = decode("comment", row)?;
    Ok(Comment {
        id: r.id,
        post_id: r.post_id,
        author,
        text: r.content,
        created_at: parse_timestamp(&r.created_at)?,
        provisional: false,
    })
}

pub fn reel_from_row(row: &Row, authors: &AuthorCache) -> Result<Reel> {
    let author = authors.resolve(row, "author", "user_id", "reel", "author")?;
    let r: ReelRow = decode("reel", row)?;
    Ok(Reel {
        id: r.id,
        author,
        video_url: r.video_url,
        caption: r.caption.unwrap_or_default(),
        music: r.music,
        created_at: parse_timestamp(&r.created_at)?,
        likes: 0,
        comments: Vec::new(),
        shares: r.shares.unwrap_or(0),
        is_liked: false,
    })
}

pub fn story_from_row(row: &Row, authors: &AuthorCache) -> Result<Story> {
    let author = authors.resolve(row, "author", "user_id", "story", "author")?;
    let r: StoryRow = decode("story", row)?;
    let kind = match r.kind.as_str() {
        "image" => StoryKind::Image { url: r.content },
        "text" => StoryKind::Text {
            text: r.content,
            background: r.background,
        },
        other => return Err(ClientError::Decode(format!("unknown story type '{}'", other))),
    };
    Ok(Story {
        id: r.id,
        author,
        kind,
        caption: r.caption,
        created_at: parse_timestamp(&r.created_at)?,
        viewers: r.viewers.unwrap_or_default().into_iter().collect(),
    })
}

pub fn message_from_row(row: &Row) -> Result<Message> {
    let r: MessageRow = decode("message", row)?;
    Ok(Message {
        id: r.id,
        sender_id: r.sender_id,
        receiver_id: r.receiver_id,
        text: r.content,
        created_at: parse_timestamp(&r.created_at)?,
        provisional: false,
    })
}

pub fn notification_from_row(row: &Row, authors: &AuthorCache) -> Result<Notification> {
    let actor = authors.resolve(row, "actor", "actor_id", "notification", "actor")?;
    let r: NotificationRow = decode("notification", row)?;
    Ok(Notification {
        id: r.id,
        kind: r.kind,
        actor,
        post_id: r.post_id,
        read: r.is_read,
        created_at: parse_timestamp(&r.created_at)?,
    })
}

/// Bucket with its post ids taken from `bucket_posts` rows.
pub fn bucket_from_row(row: &Row, links: &[Row]) -> Result<Bucket> {
    let r: BucketRow = decode("bucket", row)?;
    let post_ids = links
        .iter()
        .filter(|l| column(l, "bucket_id").and_then(scalar_text).as_deref() == Some(r.id.as_str()))
        .filter_map(|l| column(l, "post_id").and_then(scalar_text))
        .collect();
    Ok(Bucket {
        id: r.id,
        owner_id: r.user_id,
        name: r.name,
        post_ids,
    })
}

fn media_of(image: Option<String>, video: Option<String>) -> Option<Media> {
    let image = image.filter(|s| !s.is_empty());
    let video = video.filter(|s| !s.is_empty());
    video.map(Media::Video).or(image.map(Media::Image))
}

// ── Aggregates ──────────────────────────────────────────────────────

/// Like count and liked-by-`me` per parent id, from like rows whose
/// parent column is `parent` (`post_id` or `reel_id`).
pub fn like_summary(rows: &[Row], parent: &str, me: &str) -> HashMap<String, LikeState> {
    let mut out: HashMap<String, LikeState> = HashMap::new();
    for row in rows {
        let Some(parent_id) = column(row, parent).and_then(scalar_text) else {
            continue;
        };
        let entry = out.entry(parent_id).or_insert(LikeState {
            likes: 0,
            is_liked: false,
        });
        entry.likes = entry.likes.saturating_add(1);
        if column_str(row, "user_id") == Some(me) {
            entry.is_liked = true;
        }
    }
    out
}

/// Follow edges `(follower_id, following_id)` from follower rows.
pub fn follow_edges(rows: &[Row]) -> Vec<(UserId, UserId)> {
    rows.iter()
        .filter_map(|r| {
            let follower = column(r, "follower_id").and_then(scalar_text)?;
            let following = column(r, "following_id").and_then(scalar_text)?;
            Some((follower, following))
        })
        .collect()
}

/// Map every row, dropping (and logging) the ones that fail.
pub fn normalize_rows<T, F>(entity: &str, rows: &[Row], f: F) -> Vec<T>
where
    F: Fn(&Row) -> Result<T>,
{
    rows.iter()
        .filter_map(|row| match f(row) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(entity, error = %e, "dropping row");
                None
            }
        })
        .collect()
}

// ── Partial updates ─────────────────────────────────────────────────
//
// Update events carry the columns that changed (or the whole row). Only
// columns present in the row are applied; derived fields such as
// `is_liked`, `is_saved` and loaded comments stay as they are.

fn opt_str(v: &Value) -> Option<String> {
    v.as_str().map(str::to_string)
}

/// A row count or counter clamped into the `u32` the view models carry.
pub fn saturating_count<N: TryInto<u32>>(n: N) -> u32 {
    n.try_into().unwrap_or(u32::MAX)
}

pub fn patch_post(post: &mut Post, row: &Row) {
    if let Some(v) = column(row, "content") {
        post.content = opt_str(v).unwrap_or_default();
    }
    let image = column(row, "image_url");
    let video = column(row, "video_url");
    if image.is_some() || video.is_some() {
        let (cur_image, cur_video) = match &post.media {
            Some(Media::Image(u)) => (Some(u.clone()), None),
            Some(Media::Video(u)) => (None, Some(u.clone())),
            None => (None, None),
        };
        post.media = media_of(
            image.map_or(cur_image, opt_str),
            video.map_or(cur_video, opt_str),
        );
    }
    if let Some(n) = column(row, "shares").and_then(Value::as_u64) {
        post.shares = saturating_count(n);
    }
}

pub fn patch_reel(reel: &mut Reel, row: &Row) {
    if let Some(v) = column(row, "caption") {
        reel.caption = opt_str(v).unwrap_or_default();
    }
    if let Some(v) = column(row, "music") {
        reel.music = opt_str(v);
    }
    if let Some(url) = column_str(row, "video_url") {
        reel.video_url = url.to_string();
    }
    if let Some(n) = column(row, "shares").and_then(Value::as_u64) {
        reel.shares = saturating_count(n);
    }
}

pub fn patch_user(user: &mut User, row: &Row) {
    if let Some(v) = column_str(row, "username") {
        user.username = v.to_string();
    }
    if let Some(v) = column(row, "full_name") {
        user.display_name = opt_str(v)
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| user.username.clone());
    }
    if let Some(v) = column(row, "avatar_url") {
        user.avatar_url = opt_str(v);
    }
    if let Some(v) = column(row, "bio") {
        user.bio = opt_str(v);
    }
    if let Some(v) = column(row, "gender") {
        user.gender = opt_str(v);
    }
    if let Some(v) = column(row, "country") {
        user.country = opt_str(v);
    }
    if let Some(v) = column(row, "is_online").and_then(Value::as_bool) {
        user.online = v;
    }
}

pub fn patch_story(story: &mut Story, row: &Row) {
    if let Some(v) = column(row, "caption") {
        story.caption = opt_str(v);
    }
    if let Some(viewers) = column(row, "viewers").and_then(Value::as_array) {
        story.viewers = viewers.iter().filter_map(scalar_text).collect::<BTreeSet<_>>();
    }
}

pub fn patch_notification(notification: &mut Notification, row: &Row) {
    if let Some(v) = column(row, "is_read").and_then(Value::as_bool) {
        notification.read = v;
    }
}

pub fn patch_message(message: &mut Message, row: &Row) {
    if let Some(v) = column_str(row, "content") {
        message.text = v.to_string();
    }
}
