//! Short-video page.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use pulse_client::row::table;
use pulse_client::Row;
use pulse_core::{ClientError, Result};

use crate::model::Reel;
use crate::page::timeline::{Reels, Timeline, TimelineAction};
use crate::page::{MediaUpload, PageEnv, Pending, Settled};
use crate::state::{path, ViewError};

pub struct ShortsPage {
    env: Arc<PageEnv>,
    reels: Timeline<Reels>,
}

impl ShortsPage {
    pub fn new(env: Arc<PageEnv>) -> Self {
        let reels = Timeline::new(env.clone(), path::SHORTS_REELS, None);
        Self { env, reels }
    }

    pub fn reels(&self) -> &Timeline<Reels> {
        &self.reels
    }

    pub fn reels_mut(&mut self) -> &mut Timeline<Reels> {
        &mut self.reels
    }

    pub async fn load(&mut self) -> Result<()> {
        self.reels.load().await
    }

    pub async fn load_more(&mut self) -> Result<usize> {
        self.reels.load_more().await
    }

    pub async fn toggle_like(&mut self, reel_id: &str) -> Result<Settled> {
        self.reels.toggle_like(reel_id).await
    }

    pub async fn add_comment(&mut self, reel_id: &str, text: &str) -> Result<Settled> {
        self.reels.add_comment(reel_id, text).await
    }

    pub async fn share(&mut self, reel_id: &str) -> Result<Settled> {
        self.reels.share(reel_id).await
    }

    pub async fn delete_reel(&mut self, reel_id: &str) -> Result<Settled> {
        self.reels.delete(reel_id).await
    }

    pub fn settle_reel(&mut self, pending: Pending<TimelineAction>, outcome: Result<Option<Row>>) -> Settled {
        self.reels.settle(pending, outcome)
    }

    /// Upload a video and publish it as a reel.
    pub async fn create_reel(
        &mut self,
        video: MediaUpload,
        caption: &str,
        music: Option<String>,
        enhance: bool,
    ) -> Result<Reel> {
        if self.reels.is_disposed() {
            return Err(ClientError::Disposed("reel".into()));
        }
        if !video.is_video() {
            return Err(ClientError::Validation(format!(
                "Reels need a video, got '{}'",
                video.content_type
            )));
        }
        let caption = caption.trim();
        let caption = if enhance {
            self.env.assistant().enhance_caption(caption).await
        } else {
            caption.to_string()
        };
        match self.insert_reel(video, caption, music).await {
            Ok(row) => {
                let reel = self.reels.insert_created(&row)?;
                info!(reel_id = %reel.id, "reel created");
                Ok(reel)
            }
            Err(e) => {
                warn!(error = %e, "reel creation failed");
                self.reels.set_notice(ViewError::transient(&e));
                Err(e)
            }
        }
    }

    async fn insert_reel(&self, video: MediaUpload, caption: String, music: Option<String>) -> Result<Row> {
        let url = self.env.upload_media("reels", video).await?;
        let row = json!({
            "user_id": self.env.me_id(),
            "video_url": url,
            "caption": caption,
            "music": music.filter(|m| !m.trim().is_empty()),
            "shares": 0,
        });
        self.env.services.data.insert(table::REELS, row).await
    }

    pub async fn drain_events(&mut self) -> usize {
        self.reels.drain_events().await
    }

    pub fn dispose(&mut self) {
        self.reels.dispose();
    }
}
