//! Story tray and story viewer.
//!
//! Visibility is a filter over the clock, re-evaluated whenever the tray
//! is built: a story is active while `now < created_at + ttl`, and a group
//! is in the tray while it has an active story. "Seen" is derived from the
//! viewer sets, never stored as a separate flag.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Story, User, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryGroup {
    pub author: User,
    /// Active stories, oldest first.
    pub stories: Vec<Story>,
    /// Some active story lacks the current user in its viewers.
    pub has_unviewed: bool,
    pub latest_at: DateTime<Utc>,
}

impl StoryGroup {
    fn refresh_seen(&mut self, me: &str) {
        self.has_unviewed = self.stories.iter().any(|s| !s.viewers.contains(me));
    }
}

pub fn is_active(story: &Story, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
    now < story.created_at + ttl
}

/// Group active stories by author. Own group first, then groups with
/// unviewed stories, then the most recent.
pub fn active_tray(
    stories: &[Story],
    me: &str,
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> Vec<StoryGroup> {
    let mut groups: Vec<StoryGroup> = Vec::new();
    for story in stories.iter().filter(|s| is_active(s, now, ttl)) {
        match groups.iter_mut().find(|g| g.author.id == story.author.id) {
            Some(group) => group.stories.push(story.clone()),
            None => groups.push(StoryGroup {
                author: story.author.clone(),
                stories: vec![story.clone()],
                has_unviewed: false,
                latest_at: story.created_at,
            }),
        }
    }
    for group in &mut groups {
        group
            .stories
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        group.latest_at = group.stories.iter().map(|s| s.created_at).max().unwrap_or(group.latest_at);
        group.refresh_seen(me);
    }
    groups.sort_by(|a, b| {
        let own = |g: &StoryGroup| g.author.id != me;
        own(a)
            .cmp(&own(b))
            .then_with(|| b.has_unviewed.cmp(&a.has_unviewed))
            .then_with(|| b.latest_at.cmp(&a.latest_at))
    });
    groups
}

// ── Viewer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerStep {
    Showing { group: usize, story: usize },
    /// Stepped back at the very first story: progress restarts.
    Restarted,
    /// Advanced past the last story of the last group.
    Finished,
}

/// Published view of the viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerSnapshot {
    pub group: usize,
    pub story: usize,
    pub story_id: Option<String>,
    pub author_id: Option<UserId>,
    pub progress: f32,
    pub paused: bool,
    pub finished: bool,
}

/// Sequential playback over (group, story) positions.
///
/// `next` past a group's last story opens the next group; `previous` from
/// a group's first story opens the previous group at its first story.
/// Each story auto-advances once `duration` of unpaused time has elapsed.
#[derive(Debug, Clone)]
pub struct StoryViewer {
    groups: Vec<StoryGroup>,
    me: UserId,
    group: usize,
    story: usize,
    elapsed: Duration,
    duration: Duration,
    paused: bool,
    finished: bool,
    views: Vec<String>,
}

impl StoryViewer {
    /// Open at the first story of `groups[start]`. `None` if out of range.
    pub fn open(groups: Vec<StoryGroup>, start: usize, me: &str, duration: Duration) -> Option<Self> {
        if groups.get(start).map_or(true, |g| g.stories.is_empty()) {
            return None;
        }
        let mut viewer = Self {
            groups,
            me: me.to_string(),
            group: start,
            story: 0,
            elapsed: Duration::ZERO,
            duration,
            paused: false,
            finished: false,
            views: Vec::new(),
        };
        viewer.show(start, 0);
        Some(viewer)
    }

    pub fn current(&self) -> Option<&Story> {
        if self.finished {
            return None;
        }
        self.groups.get(self.group)?.stories.get(self.story)
    }

    pub fn position(&self) -> (usize, usize) {
        (self.group, self.story)
    }

    pub fn groups(&self) -> &[StoryGroup] {
        &self.groups
    }

    pub fn next(&mut self) -> ViewerStep {
        if self.finished {
            return ViewerStep::Finished;
        }
        let len = self.groups[self.group].stories.len();
        if self.story + 1 < len {
            self.show(self.group, self.story + 1)
        } else if self.group + 1 < self.groups.len() {
            self.show(self.group + 1, 0)
        } else {
            self.finished = true;
            ViewerStep::Finished
        }
    }

    pub fn previous(&mut self) -> ViewerStep {
        if self.finished {
            return ViewerStep::Finished;
        }
        if self.story > 0 {
            self.show(self.group, self.story - 1)
        } else if self.group > 0 {
            self.show(self.group - 1, 0)
        } else {
            self.elapsed = Duration::ZERO;
            ViewerStep::Restarted
        }
    }

    /// Advance the timer. Returns the step taken when the current story
    /// runs out.
    pub fn tick(&mut self, dt: Duration) -> Option<ViewerStep> {
        if self.paused || self.finished {
            return None;
        }
        self.elapsed += dt;
        (self.elapsed >= self.duration).then(|| self.next())
    }

    /// Press-and-hold: stop the timer, keep the progress.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Fraction of the current story shown, 0.0..=1.0.
    pub fn progress(&self) -> f32 {
        if self.duration.is_zero() {
            return 1.0;
        }
        (self.elapsed.as_secs_f32() / self.duration.as_secs_f32()).min(1.0)
    }

    /// Story ids shown for the first time since the last call.
    pub fn take_views(&mut self) -> Vec<String> {
        std::mem::take(&mut self.views)
    }

    pub fn snapshot(&self) -> ViewerSnapshot {
        let current = self.current();
        ViewerSnapshot {
            group: self.group,
            story: self.story,
            story_id: current.map(|s| s.id.clone()),
            author_id: current.map(|s| s.author.id.clone()),
            progress: self.progress(),
            paused: self.paused,
            finished: self.finished,
        }
    }

    fn show(&mut self, group: usize, story: usize) -> ViewerStep {
        self.group = group;
        self.story = story;
        self.elapsed = Duration::ZERO;
        let me = self.me.clone();
        let g = &mut self.groups[group];
        if let Some(s) = g.stories.get_mut(story) {
            if s.viewers.insert(me.clone()) {
                self.views.push(s.id.clone());
            }
        }
        g.refresh_seen(&me);
        ViewerStep::Showing { group, story }
    }
}
