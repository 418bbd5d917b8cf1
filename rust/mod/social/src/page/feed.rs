//! Home feed: posts, saved-post buckets and the story tray.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use pulse_client::row::{column, scalar_text, table};
use pulse_client::{ChangeOp, ChannelFilter, Filter, Query, Row};
use pulse_core::{ClientError, Result};

use crate::model::{Bucket, Post, Story};
use crate::mutation::{MutationLedger, Rollback};
use crate::normalize::{bucket_from_row, normalize_rows, patch_story, story_from_row, AuthorCache};
use crate::page::timeline::{Posts, Timeline, TimelineAction};
use crate::page::{ensure_author, Inbox, MediaUpload, PageEnv, Pending, Settled, Visit, Write};
use crate::reconcile::{on_deleted, on_inserted, on_updated, Placement};
use crate::state::{path, BucketList, StoryTray, ViewError};
use crate::stories::{active_tray, StoryGroup, StoryViewer, ViewerSnapshot, ViewerStep};

/// Content of a new story.
#[derive(Debug, Clone)]
pub enum NewStory {
    Image(MediaUpload),
    Text {
        text: String,
        background: Option<String>,
    },
}

/// A pending bucket membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveAction {
    pub bucket_id: String,
    pub post_id: String,
    pub saved: bool,
}

pub struct FeedPage {
    env: Arc<PageEnv>,
    visit: Visit,
    posts: Timeline<Posts>,
    buckets: Vec<Bucket>,
    /// Bucket id → its post ids before the change.
    saves: MutationLedger<String, BTreeSet<String>>,
    stories: Vec<Story>,
    story_authors: AuthorCache,
    viewer: Option<StoryViewer>,
    inbox: Inbox,
}

impl FeedPage {
    pub fn new(env: Arc<PageEnv>) -> Self {
        let posts = Timeline::new(env.clone(), path::FEED_POSTS, None);
        let story_authors = env.author_cache();
        Self {
            env,
            visit: Visit::new(),
            posts,
            buckets: Vec::new(),
            saves: MutationLedger::new(),
            stories: Vec::new(),
            story_authors,
            viewer: None,
            inbox: Inbox::new(),
        }
    }

    /// Load posts, buckets and stories. Only a post failure fails the
    /// page; the others are logged and left empty.
    pub async fn load(&mut self) -> Result<()> {
        self.visit.ensure_live("feed")?;
        self.posts.load().await?;
        if let Err(e) = self.load_buckets().await {
            warn!(error = %e, "buckets unavailable");
        }
        if let Err(e) = self.load_stories().await {
            warn!(error = %e, "stories unavailable");
        }
        if self.inbox.subscriptions() == 0 {
            let realtime = self.env.services.realtime.clone();
            self.inbox.subscribe(&*realtime, ChannelFilter::table(table::STORIES));
        }
        info!(posts = self.posts.items().len(), stories = self.stories.len(), "feed loaded");
        Ok(())
    }

    pub fn posts(&self) -> &Timeline<Posts> {
        &self.posts
    }

    pub fn posts_mut(&mut self) -> &mut Timeline<Posts> {
        &mut self.posts
    }

    pub async fn load_more(&mut self) -> Result<usize> {
        let added = self.posts.load_more().await?;
        self.sync_saved();
        Ok(added)
    }

    // ── Posts ──

    pub async fn toggle_like(&mut self, post_id: &str) -> Result<Settled> {
        self.posts.toggle_like(post_id).await
    }

    pub async fn add_comment(&mut self, post_id: &str, text: &str) -> Result<Settled> {
        self.posts.add_comment(post_id, text).await
    }

    pub async fn share(&mut self, post_id: &str) -> Result<Settled> {
        self.posts.share(post_id).await
    }

    pub async fn edit_post(&mut self, post_id: &str, content: &str) -> Result<Settled> {
        self.posts.edit(post_id, content).await
    }

    pub async fn delete_post(&mut self, post_id: &str) -> Result<Settled> {
        self.posts.delete(post_id).await
    }

    pub fn settle_post(&mut self, pending: Pending<TimelineAction>, outcome: Result<Option<Row>>) -> Settled {
        self.posts.settle(pending, outcome)
    }

    /// Upload the media (if any), optionally polish the text, and insert
    /// the post. Nothing is shown until the backend has stored it.
    pub async fn create_post(
        &mut self,
        content: &str,
        media: Option<MediaUpload>,
        enhance: bool,
    ) -> Result<Post> {
        self.visit.ensure_live("feed")?;
        let content = content.trim();
        if content.is_empty() && media.is_none() {
            return Err(ClientError::Validation("Post cannot be empty".into()));
        }
        let content = if enhance {
            self.env.assistant().enhance_caption(content).await
        } else {
            content.to_string()
        };
        let result = self.insert_post(content, media).await;
        match result {
            Ok(row) => {
                let post = self.posts.insert_created(&row)?;
                info!(post_id = %post.id, "post created");
                Ok(post)
            }
            Err(e) => {
                warn!(error = %e, "post creation failed");
                self.posts.set_notice(ViewError::transient(&e));
                Err(e)
            }
        }
    }

    async fn insert_post(&self, content: String, media: Option<MediaUpload>) -> Result<Row> {
        let (image, video) = match media {
            Some(m) => {
                let is_video = m.is_video();
                let url = self.env.upload_media("posts", m).await?;
                if is_video {
                    (None, Some(url))
                } else {
                    (Some(url), None)
                }
            }
            None => (None, None),
        };
        self.env
            .services
            .data
            .insert(
                table::POSTS,
                json!({
                    "user_id": self.env.me_id(),
                    "content": content,
                    "image_url": image,
                    "video_url": video,
                    "shares": 0,
                }),
            )
            .await
    }

    // ── Buckets ──

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Buckets of the current user that contain `post_id`.
    pub fn buckets_for_post(&self, post_id: &str) -> Vec<&Bucket> {
        self.buckets
            .iter()
            .filter(|b| b.post_ids.contains(post_id))
            .collect()
    }

    pub async fn load_buckets(&mut self) -> Result<()> {
        let data = self.env.services.data.clone();
        let rows = data
            .select(
                &Query::table(table::BUCKETS)
                    .eq("user_id", self.env.me_id())
                    .order_asc("created_at"),
            )
            .await?;
        let ids: Vec<String> = rows
            .iter()
            .filter_map(|r| column(r, "id").and_then(scalar_text))
            .collect();
        let links = if ids.is_empty() {
            Vec::new()
        } else {
            data.select(&Query::table(table::BUCKET_POSTS).in_list("bucket_id", ids))
                .await?
        };
        self.buckets = normalize_rows("bucket", &rows, |r| bucket_from_row(r, &links));
        self.sync_saved();
        self.publish_buckets();
        Ok(())
    }

    pub async fn create_bucket(&mut self, name: &str) -> Result<Bucket> {
        self.visit.ensure_live("feed")?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ClientError::Validation("Bucket name cannot be empty".into()));
        }
        if self.buckets.iter().any(|b| b.name.eq_ignore_ascii_case(name)) {
            return Err(ClientError::Validation(format!("A bucket named '{}' already exists", name)));
        }
        let row = self
            .env
            .services
            .data
            .insert(table::BUCKETS, json!({"user_id": self.env.me_id(), "name": name}))
            .await?;
        let bucket = bucket_from_row(&row, &[])?;
        debug!(bucket_id = %bucket.id, name, "bucket created");
        self.buckets.push(bucket.clone());
        self.publish_buckets();
        Ok(bucket)
    }

    /// Add `post_id` to the bucket, or remove it if already there.
    pub fn begin_toggle_save(&mut self, post_id: &str, bucket_id: &str) -> Result<Pending<SaveAction>> {
        self.visit.ensure_live("feed")?;
        let bucket = self
            .buckets
            .iter_mut()
            .find(|b| b.id == bucket_id)
            .ok_or_else(|| ClientError::NotFound(format!("bucket '{}'", bucket_id)))?;
        let prior = bucket.post_ids.clone();
        let saved = !prior.contains(post_id);
        if saved {
            bucket.post_ids.insert(post_id.to_string());
        } else {
            bucket.post_ids.remove(post_id);
        }
        let mutation = self.saves.apply(bucket_id.to_string(), prior);
        let write = if saved {
            Write::Insert {
                table: table::BUCKET_POSTS,
                row: json!({"bucket_id": bucket_id, "post_id": post_id}),
            }
        } else {
            Write::Delete {
                table: table::BUCKET_POSTS,
                filters: vec![Filter::eq("bucket_id", bucket_id), Filter::eq("post_id", post_id)],
            }
        };
        self.sync_saved();
        self.publish_buckets();
        Ok(Pending::new(
            self.visit.token,
            mutation,
            write,
            SaveAction {
                bucket_id: bucket_id.to_string(),
                post_id: post_id.to_string(),
                saved,
            },
        ))
    }

    pub fn settle_save(&mut self, pending: Pending<SaveAction>, outcome: Result<Option<Row>>) -> Settled {
        if !self.visit.accepts(&pending) {
            return Settled::Ignored;
        }
        let Pending {
            mutation, meta, ..
        } = pending;
        match outcome {
            Ok(_) => {
                self.saves.confirm(mutation);
                Settled::Confirmed
            }
            Err(e) => {
                warn!(bucket_id = %meta.bucket_id, post_id = %meta.post_id, error = %e, "reverting save");
                if let Rollback::Restore(post_ids) = self.saves.roll_back(mutation) {
                    if let Some(bucket) = self.buckets.iter_mut().find(|b| b.id == meta.bucket_id) {
                        bucket.post_ids = post_ids;
                    }
                }
                self.sync_saved();
                self.publish_buckets();
                self.posts.set_notice(ViewError::transient(&e));
                Settled::RolledBack
            }
        }
    }

    pub async fn toggle_save(&mut self, post_id: &str, bucket_id: &str) -> Result<Settled> {
        let pending = self.begin_toggle_save(post_id, bucket_id)?;
        let data = self.env.services.data.clone();
        let outcome = pending.run(&*data).await;
        Ok(self.settle_save(pending, outcome))
    }

    /// Re-derive `is_saved` on every loaded post from the buckets.
    fn sync_saved(&mut self) {
        let saved: BTreeSet<String> = self
            .buckets
            .iter()
            .flat_map(|b| b.post_ids.iter().cloned())
            .collect();
        self.posts.update_all(|p| p.is_saved = saved.contains(&p.id));
    }

    fn publish_buckets(&self) {
        self.env.store.set(
            BucketList::PATH,
            BucketList {
                buckets: self.buckets.clone(),
            },
        );
    }

    // ── Stories ──

    pub async fn load_stories(&mut self) -> Result<()> {
        let since = self.env.now() - self.env.config.story_ttl();
        let rows = self
            .env
            .services
            .data
            .select(
                &Query::table(table::STORIES)
                    .gte("created_at", since.to_rfc3339())
                    .join("author", table::PROFILES, "user_id")
                    .order_asc("created_at"),
            )
            .await?;
        for row in &rows {
            self.story_authors.absorb(row, "author");
        }
        self.stories = normalize_rows("story", &rows, |r| story_from_row(r, &self.story_authors));
        self.refresh_tray();
        Ok(())
    }

    /// Active story groups as of now.
    pub fn tray(&self) -> Vec<StoryGroup> {
        active_tray(
            &self.stories,
            self.env.me_id(),
            self.env.now(),
            self.env.config.story_ttl(),
        )
    }

    /// Re-evaluate visibility against the clock and publish the tray.
    pub fn refresh_tray(&self) {
        self.env.store.set(StoryTray::PATH, StoryTray { groups: self.tray() });
    }

    pub async fn create_story(&mut self, story: NewStory, caption: Option<String>) -> Result<Story> {
        self.visit.ensure_live("feed")?;
        let (kind, content, background) = match story {
            NewStory::Image(media) => ("image", self.env.upload_media("stories", media).await?, None),
            NewStory::Text { text, background } => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    return Err(ClientError::Validation("Story text cannot be empty".into()));
                }
                ("text", text, background)
            }
        };
        let caption = caption.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
        let row = self
            .env
            .services
            .data
            .insert(
                table::STORIES,
                json!({
                    "user_id": self.env.me_id(),
                    "type": kind,
                    "content": content,
                    "background": background,
                    "caption": caption,
                    "viewers": [],
                }),
            )
            .await?;
        let story = story_from_row(&row, &self.story_authors)?;
        on_inserted(&mut self.stories, story.clone(), &Placement::Append);
        self.refresh_tray();
        info!(story_id = %story.id, "story created");
        Ok(story)
    }

    pub fn viewer(&self) -> Option<&StoryViewer> {
        self.viewer.as_ref()
    }

    /// Open the viewer at the first story of tray group `group`.
    pub async fn open_story(&mut self, group: usize) -> Result<()> {
        self.visit.ensure_live("feed")?;
        let duration = self.env.config.story_duration();
        let viewer = StoryViewer::open(self.tray(), group, self.env.me_id(), duration)
            .ok_or_else(|| ClientError::NotFound(format!("story group {}", group)))?;
        self.viewer = Some(viewer);
        self.flush_views().await;
        Ok(())
    }

    fn viewer_mut(&mut self) -> Result<&mut StoryViewer> {
        self.viewer
            .as_mut()
            .ok_or_else(|| ClientError::NotFound("open story viewer".into()))
    }

    pub async fn story_next(&mut self) -> Result<ViewerStep> {
        let step = self.viewer_mut()?.next();
        self.flush_views().await;
        Ok(step)
    }

    pub async fn story_previous(&mut self) -> Result<ViewerStep> {
        let step = self.viewer_mut()?.previous();
        self.flush_views().await;
        Ok(step)
    }

    /// Advance the viewer clock by `elapsed`.
    pub async fn story_tick(&mut self, elapsed: Duration) -> Result<Option<ViewerStep>> {
        let step = self.viewer_mut()?.tick(elapsed);
        self.flush_views().await;
        Ok(step)
    }

    pub fn story_pause(&mut self) -> Result<()> {
        self.viewer_mut()?.pause();
        self.publish_viewer();
        Ok(())
    }

    pub fn story_resume(&mut self) -> Result<()> {
        self.viewer_mut()?.resume();
        self.publish_viewer();
        Ok(())
    }

    pub fn close_story(&mut self) {
        if self.viewer.take().is_some() {
            self.env.store.remove(ViewerSnapshot::PATH);
            self.refresh_tray();
        }
    }

    /// Record newly shown stories as viewed, locally and on the backend.
    /// A failed write leaves the local view in place.
    async fn flush_views(&mut self) {
        let shown = match self.viewer.as_mut() {
            Some(viewer) => viewer.take_views(),
            None => return,
        };
        let data = self.env.services.data.clone();
        let me = self.env.me_id().to_string();
        for id in shown {
            let Some(story) = self.stories.iter_mut().find(|s| s.id == id) else {
                continue;
            };
            story.viewers.insert(me.clone());
            let write = Write::Update {
                table: table::STORIES,
                filters: vec![Filter::eq("id", id.as_str())],
                patch: json!({ "viewers": story.viewers }),
            };
            if let Err(e) = write.run(&*data).await {
                warn!(story_id = %id, error = %e, "recording story view failed");
            }
        }
        self.publish_viewer();
        self.refresh_tray();
    }

    fn publish_viewer(&self) {
        if let Some(viewer) = &self.viewer {
            self.env.store.set(ViewerSnapshot::PATH, viewer.snapshot());
        }
    }

    // ── Real-time / lifecycle ──

    pub async fn drain_events(&mut self) -> usize {
        if self.visit.disposed {
            return 0;
        }
        let mut handled = self.posts.drain_events().await;
        let events = self.inbox.drain();
        if !events.is_empty() {
            let data = self.env.services.data.clone();
            for event in &events {
                let row = event.record();
                let Some(id) = column(row, "id").and_then(scalar_text) else {
                    continue;
                };
                match event.op {
                    ChangeOp::Insert => {
                        ensure_author(&*data, &mut self.story_authors, row, "user_id").await;
                        match story_from_row(row, &self.story_authors) {
                            Ok(story) => {
                                on_inserted(&mut self.stories, story, &Placement::Append);
                            }
                            Err(e) => warn!(error = %e, "dropping pushed story"),
                        }
                    }
                    ChangeOp::Update => {
                        on_updated(&mut self.stories, &id, |s| patch_story(s, row));
                    }
                    ChangeOp::Delete => {
                        on_deleted(&mut self.stories, &id);
                    }
                }
            }
            handled += events.len();
            self.refresh_tray();
        }
        if handled > 0 {
            self.sync_saved();
        }
        handled
    }

    pub fn dispose(&mut self) {
        self.visit.disposed = true;
        self.posts.dispose();
        self.inbox.close();
        self.saves.clear();
        self.viewer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::testing::{fixture, post_row, ts, Fixture};
    use chrono::Duration as ChronoDuration;
    use pulse_client::{DataStore, Op};

    async fn loaded(f: &Fixture) -> FeedPage {
        let mut feed = FeedPage::new(f.env.clone());
        feed.load().await.unwrap();
        feed
    }

    fn story_row(id: &str, author: &str, minutes: i64) -> Row {
        json!({
            "id": id,
            "user_id": author,
            "type": "text",
            "content": id,
            "created_at": ts(minutes),
            "viewers": [],
        })
    }

    // ========================================================================
    // Buckets
    // ========================================================================

    #[tokio::test]
    async fn bucket_add_then_remove_leaves_post_unsaved() {
        let f = fixture();
        f.backend.seed(table::POSTS, [post_row("1001", "u2", 0)]);
        let mut feed = loaded(&f).await;
        let bucket = feed.create_bucket("x").await.unwrap();

        assert_eq!(feed.toggle_save("1001", &bucket.id).await.unwrap(), Settled::Confirmed);
        assert_eq!(feed.buckets_for_post("1001").len(), 1);
        assert!(feed.posts().get("1001").unwrap().is_saved);

        assert_eq!(feed.toggle_save("1001", &bucket.id).await.unwrap(), Settled::Confirmed);
        assert!(feed.buckets_for_post("1001").is_empty());
        assert!(!feed.posts().get("1001").unwrap().is_saved);
        assert!(f.backend.rows(table::BUCKET_POSTS).is_empty());
    }

    #[tokio::test]
    async fn failed_save_restores_association_set() {
        let f = fixture();
        f.backend.seed(table::POSTS, [post_row("p1", "u2", 0), post_row("p2", "u2", 1)]);
        let mut feed = loaded(&f).await;
        let bucket = feed.create_bucket("trips").await.unwrap();
        feed.toggle_save("p1", &bucket.id).await.unwrap();
        let before = feed.buckets().to_vec();

        f.backend.fail_next(Op::Insert, table::BUCKET_POSTS, ClientError::Network("x".into()));
        assert_eq!(feed.toggle_save("p2", &bucket.id).await.unwrap(), Settled::RolledBack);
        assert_eq!(feed.buckets(), &before[..]);
        assert!(!feed.posts().get("p2").unwrap().is_saved);
    }

    #[tokio::test]
    async fn bucket_names_are_validated() {
        let f = fixture();
        let mut feed = loaded(&f).await;
        assert!(feed.create_bucket("  ").await.is_err());
        feed.create_bucket("Food").await.unwrap();
        let err = feed.create_bucket("food").await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn buckets_load_with_links() {
        let f = fixture();
        f.backend.seed(table::POSTS, [post_row("p1", "u2", 0)]);
        f.backend.seed(table::BUCKETS, [json!({"id": 7, "user_id": "me", "name": "later"})]);
        f.backend.seed(table::BUCKET_POSTS, [json!({"bucket_id": 7, "post_id": "p1"})]);
        let feed = loaded(&f).await;
        assert_eq!(feed.buckets_for_post("p1")[0].name, "later");
        assert!(feed.posts().get("p1").unwrap().is_saved);
    }

    // ========================================================================
    // Posts
    // ========================================================================

    #[tokio::test]
    async fn create_post_uploads_media_and_prepends() {
        let f = fixture();
        f.backend.seed(table::POSTS, [post_row("p1", "u2", 0)]);
        let mut feed = loaded(&f).await;
        let post = feed
            .create_post("  beach day ", Some(MediaUpload::new(vec![1, 2, 3], "image/jpeg")), false)
            .await
            .unwrap();
        assert_eq!(post.content, "beach day");
        assert!(matches!(&post.media, Some(crate::model::Media::Image(url)) if url.starts_with("memory://media/posts/me/")));
        assert_eq!(feed.posts().items()[0].id, post.id);

        feed.drain_events().await;
        assert_eq!(feed.posts().items().len(), 2);
    }

    #[tokio::test]
    async fn empty_post_is_rejected() {
        let f = fixture();
        let mut feed = loaded(&f).await;
        assert!(feed.create_post(" ", None, false).await.is_err());
        assert!(f.backend.rows(table::POSTS).is_empty());
    }

    #[tokio::test]
    async fn failed_upload_creates_nothing() {
        let f = fixture();
        let mut feed = loaded(&f).await;
        f.backend.fail_next(Op::Upload, "media", ClientError::Backend("full".into()));
        let err = feed
            .create_post("hi", Some(MediaUpload::new(vec![0], "video/mp4")), false)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(f.backend.rows(table::POSTS).is_empty());
        assert!(feed.posts().status().notice.is_some());
    }

    // ========================================================================
    // Stories
    // ========================================================================

    #[tokio::test]
    async fn story_expires_after_a_day() {
        let f = fixture();
        f.backend.seed(table::STORIES, [story_row("s1", "u2", 0)]);
        f.clock.advance(ChronoDuration::minutes(23 * 60 + 59));
        let feed = loaded(&f).await;
        assert_eq!(feed.tray().len(), 1);

        f.clock.advance(ChronoDuration::minutes(2));
        feed.refresh_tray();
        let tray: StoryTray = f.env.store.get_as(StoryTray::PATH).unwrap();
        assert!(tray.groups.is_empty());
    }

    #[tokio::test]
    async fn viewing_marks_group_seen_and_persists() {
        let f = fixture();
        f.backend.seed(
            table::STORIES,
            [story_row("s1", "u2", 0), story_row("s2", "u2", 1)],
        );
        let mut feed = loaded(&f).await;
        assert!(feed.tray()[0].has_unviewed);

        feed.open_story(0).await.unwrap();
        assert_eq!(
            feed.story_tick(std::time::Duration::from_secs(5)).await.unwrap(),
            Some(ViewerStep::Showing { group: 0, story: 1 })
        );
        assert_eq!(feed.story_next().await.unwrap(), ViewerStep::Finished);
        feed.close_story();

        assert!(!feed.tray()[0].has_unviewed);
        let stored = f.backend.rows(table::STORIES);
        assert!(stored.iter().all(|r| r["viewers"] == json!(["me"])));
    }

    #[tokio::test]
    async fn text_story_creation() {
        let f = fixture();
        let mut feed = loaded(&f).await;
        let story = feed
            .create_story(
                NewStory::Text {
                    text: "hello".into(),
                    background: Some("#ff0080".into()),
                },
                None,
            )
            .await
            .unwrap();
        let tray = feed.tray();
        assert_eq!(tray[0].author.id, "me");
        assert_eq!(tray[0].stories[0].id, story.id);
        assert!(feed
            .create_story(NewStory::Text { text: " ".into(), background: None }, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn pushed_story_joins_tray() {
        let f = fixture();
        let mut feed = loaded(&f).await;
        f.backend
            .insert(table::STORIES, json!({"user_id": "u3", "type": "text", "content": "hey"}))
            .await
            .unwrap();
        feed.drain_events().await;
        assert_eq!(feed.tray()[0].author.display_name, "Caio");
    }

    #[tokio::test]
    async fn viewer_requires_an_open_story() {
        let f = fixture();
        let mut feed = loaded(&f).await;
        assert!(feed.story_next().await.is_err());
        assert!(feed.open_story(0).await.is_err());
    }
}
