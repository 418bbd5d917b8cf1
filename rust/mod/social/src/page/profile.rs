//! Profile page: header, follow state and the user's posts.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use pulse_client::row::{column, column_str, scalar_text, table};
use pulse_client::{ChangeOp, ChannelFilter, Filter, Query, Row};
use pulse_core::{ClientError, Result};

use crate::model::{User, UserId};
use crate::mutation::{MutationLedger, PendingEchoes, Rollback};
use crate::normalize::{follow_edges, patch_user, saturating_count};
use crate::page::timeline::{Posts, Timeline};
use crate::page::{fetch_user, Inbox, MediaUpload, PageEnv, Pending, Settled, Visit, Write};
use crate::state::{path, PageStatus, ProfileView, ViewError};

/// Fields to change on the current user's profile. `None` leaves a field
/// as it is.
#[derive(Debug, Clone, Default)]
pub struct ProfileEdit {
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub gender: Option<String>,
    pub country: Option<String>,
    pub avatar: Option<MediaUpload>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowAction {
    pub user_id: UserId,
    pub follow: bool,
}

#[derive(Debug, Clone)]
struct FollowSnapshot {
    followed: bool,
    followers: u32,
    my_following: BTreeSet<UserId>,
}

pub struct ProfilePage {
    env: Arc<PageEnv>,
    visit: Visit,
    user_id: UserId,
    user: Option<User>,
    followed_by_me: bool,
    /// Everyone the current user follows.
    my_following: BTreeSet<UserId>,
    posts: Timeline<Posts>,
    follows: MutationLedger<UserId, FollowSnapshot>,
    edits: MutationLedger<UserId, User>,
    echoes: PendingEchoes<String>,
    inbox: Inbox,
    status: PageStatus,
}

impl ProfilePage {
    pub fn new(env: Arc<PageEnv>, user_id: &str) -> Self {
        let posts = Timeline::new(env.clone(), path::profile_posts(user_id), Some(user_id.to_string()));
        let echoes = PendingEchoes::new(env.echo_window());
        Self {
            env,
            visit: Visit::new(),
            user_id: user_id.to_string(),
            user: None,
            followed_by_me: false,
            my_following: BTreeSet::new(),
            posts,
            follows: MutationLedger::new(),
            edits: MutationLedger::new(),
            echoes,
            inbox: Inbox::new(),
            status: PageStatus::default(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn is_me(&self) -> bool {
        self.user_id == self.env.me_id()
    }

    pub fn followed_by_me(&self) -> bool {
        self.followed_by_me
    }

    pub fn my_following(&self) -> &BTreeSet<UserId> {
        &self.my_following
    }

    pub fn posts(&self) -> &Timeline<Posts> {
        &self.posts
    }

    pub fn posts_mut(&mut self) -> &mut Timeline<Posts> {
        &mut self.posts
    }

    pub fn status(&self) -> &PageStatus {
        &self.status
    }

    /// Fetch the user and counts, then the posts. Queued events and
    /// pending follow echoes predate the refetch and are dropped.
    pub async fn load(&mut self) -> Result<()> {
        self.visit.ensure_live("profile")?;
        self.inbox.drain();
        self.status.loading = true;
        self.publish();
        let result = self.fetch().await;
        self.status.loading = false;
        if let Err(e) = result {
            warn!(user_id = %self.user_id, error = %e, "profile load failed");
            self.status.error = Some(ViewError::failed(&e));
            self.publish();
            return Err(e);
        }
        self.status.error = None;
        self.echoes.clear();
        if self.inbox.subscriptions() == 0 {
            let realtime = self.env.services.realtime.clone();
            let id = self.user_id.clone();
            self.inbox
                .subscribe(&*realtime, ChannelFilter::table(table::FOLLOWERS).eq("following_id", id.as_str()));
            self.inbox
                .subscribe(&*realtime, ChannelFilter::table(table::FOLLOWERS).eq("follower_id", id.as_str()));
            self.inbox
                .subscribe(&*realtime, ChannelFilter::table(table::PROFILES).eq("id", id.as_str()));
        }
        self.publish();
        self.posts.load().await
    }

    async fn fetch(&mut self) -> Result<()> {
        let data = self.env.services.data.clone();
        let mut user = fetch_user(&*data, &self.user_id).await?;
        let followers = data
            .select(&Query::table(table::FOLLOWERS).eq("following_id", self.user_id.as_str()))
            .await?;
        let following = data
            .select(&Query::table(table::FOLLOWERS).eq("follower_id", self.user_id.as_str()))
            .await?;
        let mine = if self.is_me() {
            following.clone()
        } else {
            data.select(&Query::table(table::FOLLOWERS).eq("follower_id", self.env.me_id()))
                .await?
        };
        let posts = data
            .select(&Query::table(table::POSTS).eq("user_id", self.user_id.as_str()))
            .await?;

        user.followers = saturating_count(followers.len());
        user.following = saturating_count(following.len());
        user.posts = saturating_count(posts.len());
        self.my_following = follow_edges(&mine).into_iter().map(|(_, to)| to).collect();
        self.followed_by_me = self.my_following.contains(&self.user_id);
        debug!(user_id = %self.user_id, followers = user.followers, following = user.following, "profile fetched");
        self.user = Some(user);
        Ok(())
    }

    // ── Follow ──

    pub fn begin_toggle_follow(&mut self) -> Result<Pending<FollowAction>> {
        self.visit.ensure_live("profile")?;
        if self.is_me() {
            return Err(ClientError::Validation("You cannot follow yourself".into()));
        }
        let user = self
            .user
            .as_mut()
            .ok_or_else(|| ClientError::NotFound(format!("profile '{}'", self.user_id)))?;
        let snapshot = FollowSnapshot {
            followed: self.followed_by_me,
            followers: user.followers,
            my_following: self.my_following.clone(),
        };
        let follow = !self.followed_by_me;
        self.followed_by_me = follow;
        if follow {
            user.followers += 1;
            self.my_following.insert(self.user_id.clone());
        } else {
            user.followers = user.followers.saturating_sub(1);
            self.my_following.remove(&self.user_id);
        }
        let mutation = self.follows.apply(self.user_id.clone(), snapshot);
        self.echoes.expect(self.user_id.clone(), follow, self.env.now());

        let me = self.env.me_id();
        let write = if follow {
            Write::Insert {
                table: table::FOLLOWERS,
                row: json!({"follower_id": me, "following_id": self.user_id}),
            }
        } else {
            Write::Delete {
                table: table::FOLLOWERS,
                filters: vec![
                    Filter::eq("follower_id", me),
                    Filter::eq("following_id", self.user_id.as_str()),
                ],
            }
        };
        self.publish();
        Ok(Pending::new(
            self.visit.token,
            mutation,
            write,
            FollowAction {
                user_id: self.user_id.clone(),
                follow,
            },
        ))
    }

    pub fn settle_follow(&mut self, pending: Pending<FollowAction>, outcome: Result<Option<Row>>) -> Settled {
        if !self.visit.accepts(&pending) {
            return Settled::Ignored;
        }
        let Pending {
            mutation, meta, ..
        } = pending;
        let settled = match outcome {
            Ok(_) => {
                self.follows.confirm(mutation);
                Settled::Confirmed
            }
            Err(e) => {
                warn!(user_id = %meta.user_id, follow = meta.follow, error = %e, "reverting follow");
                self.echoes.cancel(&meta.user_id, meta.follow);
                if let Rollback::Restore(s) = self.follows.roll_back(mutation) {
                    self.followed_by_me = s.followed;
                    self.my_following = s.my_following;
                    if let Some(user) = self.user.as_mut() {
                        user.followers = s.followers;
                    }
                }
                self.status.notice = Some(ViewError::transient(&e));
                Settled::RolledBack
            }
        };
        self.publish();
        settled
    }

    pub async fn toggle_follow(&mut self) -> Result<Settled> {
        let pending = self.begin_toggle_follow()?;
        let data = self.env.services.data.clone();
        let outcome = pending.run(&*data).await;
        Ok(self.settle_follow(pending, outcome))
    }

    // ── Edit ──

    /// Apply `edit` to the current user's own profile. The avatar is
    /// uploaded first; the field changes are optimistic.
    pub async fn edit_profile(&mut self, edit: ProfileEdit) -> Result<Settled> {
        self.visit.ensure_live("profile")?;
        if !self.is_me() {
            return Err(ClientError::Validation("You can only edit your own profile".into()));
        }
        if self.user.is_none() {
            return Err(ClientError::NotFound(format!("profile '{}'", self.user_id)));
        }

        let mut patch = Map::new();
        let mut put = |column: &str, value: Option<String>| {
            if let Some(v) = value {
                let v = v.trim().to_string();
                patch.insert(column.to_string(), if v.is_empty() { Value::Null } else { Value::String(v) });
            }
        };
        put("full_name", edit.display_name);
        put("bio", edit.bio);
        put("gender", edit.gender);
        put("country", edit.country);
        if let Some(avatar) = edit.avatar {
            match self.env.upload_media("avatars", avatar).await {
                Ok(url) => {
                    patch.insert("avatar_url".into(), Value::String(url));
                }
                Err(e) => {
                    self.status.notice = Some(ViewError::transient(&e));
                    self.publish();
                    return Err(e);
                }
            }
        }
        if patch.is_empty() {
            return Ok(Settled::Confirmed);
        }
        let patch = Value::Object(patch);

        let Some(user) = self.user.as_mut() else {
            return Err(ClientError::NotFound(format!("profile '{}'", self.user_id)));
        };
        let mutation = self.edits.apply(self.user_id.clone(), user.clone());
        patch_user(user, &patch);
        self.publish();

        let write = Write::Update {
            table: table::PROFILES,
            filters: vec![Filter::eq("id", self.user_id.as_str())],
            patch,
        };
        let data = self.env.services.data.clone();
        let settled = match write.run(&*data).await {
            Ok(row) => {
                self.edits.confirm(mutation);
                if let (Some(row), Some(user)) = (row, self.user.as_mut()) {
                    patch_user(user, &row);
                }
                Settled::Confirmed
            }
            Err(e) => {
                warn!(error = %e, "reverting profile edit");
                if let Rollback::Restore(prior) = self.edits.roll_back(mutation) {
                    self.user = Some(prior);
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
        let mut handled = self.posts.drain_events().await;
        let events = self.inbox.drain();
        for event in &events {
            let row = event.record();
            match (event.table.as_str(), event.op) {
                (table::FOLLOWERS, ChangeOp::Insert) => self.apply_follow(row, true),
                (table::FOLLOWERS, ChangeOp::Delete) => self.apply_follow(row, false),
                (table::PROFILES, ChangeOp::Update) => {
                    if let Some(user) = self.user.as_mut() {
                        patch_user(user, row);
                    }
                }
                _ => {}
            }
        }
        handled += events.len();
        if !events.is_empty() {
            self.publish();
        }
        handled
    }

    fn apply_follow(&mut self, row: &Row, added: bool) {
        let follower = column(row, "follower_id").and_then(scalar_text);
        let following = column_str(row, "following_id").map(str::to_string);
        let (Some(follower), Some(following)) = (follower, following) else {
            return;
        };
        let me = self.env.me_id().to_string();
        let step = |n: u32| if added { n.saturating_add(1) } else { n.saturating_sub(1) };

        if following == self.user_id {
            if follower == me {
                if self.echoes.consume(&following, added, self.env.now()) {
                    return;
                }
                if self.followed_by_me == added {
                    return;
                }
                self.followed_by_me = added;
                if added {
                    self.my_following.insert(following.clone());
                } else {
                    self.my_following.remove(&following);
                }
            }
            if let Some(user) = self.user.as_mut() {
                user.followers = step(user.followers);
            }
        }
        if follower == self.user_id {
            if let Some(user) = self.user.as_mut() {
                user.following = step(user.following);
            }
        }
    }

    pub fn publish(&self) {
        self.env.store.set(
            &ProfileView::path(&self.user_id),
            ProfileView {
                user: self.user.clone(),
                is_me: self.is_me(),
                followed_by_me: self.followed_by_me,
                status: self.status.clone(),
            },
        );
    }

    pub fn dispose(&mut self) {
        self.visit.disposed = true;
        self.posts.dispose();
        self.inbox.close();
        self.follows.clear();
        self.edits.clear();
        self.echoes.clear();
    }
}
