use std::sync::Arc;

use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use pulse_client::{Services, SessionEvent};
use pulse_core::{ClientConfig, ClientError, Clock, Result, SystemClock};
use pulse_flux::StateStore;

use crate::assistant::Assistant;
use crate::model::User;
use crate::page::{
    fetch_user, ChatPage, FeedPage, NotificationCenter, Page, PageEnv, ProfileEdit, ProfilePage,
    Settled, ShortsPage,
};
use crate::state::{AppState, AuthState};

/// The controller behind the page being shown.
pub enum ActivePage {
    Feed(FeedPage),
    Profile(ProfilePage),
    Chat(ChatPage),
    Shorts(ShortsPage),
}

impl ActivePage {
    fn open(page: &Page, env: Arc<PageEnv>) -> Self {
        match page {
            Page::Feed => ActivePage::Feed(FeedPage::new(env)),
            Page::Profile(id) => ActivePage::Profile(ProfilePage::new(env, id)),
            Page::Chat(id) => ActivePage::Chat(ChatPage::new(env, id)),
            Page::Shorts => ActivePage::Shorts(ShortsPage::new(env)),
        }
    }

    pub fn page(&self) -> Page {
        match self {
            ActivePage::Feed(_) => Page::Feed,
            ActivePage::Profile(p) => Page::Profile(p.user_id().to_string()),
            ActivePage::Chat(c) => Page::Chat(c.peer_id().to_string()),
            ActivePage::Shorts(_) => Page::Shorts,
        }
    }

    async fn load(&mut self) -> Result<()> {
        match self {
            ActivePage::Feed(p) => p.load().await,
            ActivePage::Profile(p) => p.load().await,
            ActivePage::Chat(p) => p.load().await,
            ActivePage::Shorts(p) => p.load().await,
        }
    }

    async fn drain_events(&mut self) -> usize {
        match self {
            ActivePage::Feed(p) => p.drain_events().await,
            ActivePage::Profile(p) => p.drain_events().await,
            ActivePage::Chat(p) => p.drain_events().await,
            ActivePage::Shorts(p) => p.drain_events().await,
        }
    }

    fn dispose(&mut self) {
        match self {
            ActivePage::Feed(p) => p.dispose(),
            ActivePage::Profile(p) => p.dispose(),
            ActivePage::Chat(p) => p.dispose(),
            ActivePage::Shorts(p) => p.dispose(),
        }
    }
}

/// Everything that exists only while someone is signed in.
struct Session {
    env: Arc<PageEnv>,
    notifications: NotificationCenter,
    page: Option<ActivePage>,
}

impl Session {
    fn dispose(&mut self) {
        if let Some(mut page) = self.page.take() {
            page.dispose();
        }
        self.notifications.dispose();
    }
}

/// Pulse client core.
///
/// Owns the collaborators, the published view state, the signed-in
/// session and the page being shown. Explicitly constructed and disposed.
///
/// ```ignore
/// let mut app = AppContext::initialize(config, services);
/// app.sign_in("ana@example.com", "secret").await?;
/// app.navigate(Page::Feed).await?;
/// app.feed_mut().unwrap().toggle_like("p1").await?;
///
/// // Apply queued real-time events.
/// app.pump().await?;
///
/// let posts: PostList = app.store().get_as(path::FEED_POSTS).unwrap();
/// ```
pub struct AppContext {
    config: ClientConfig,
    services: Services,
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    session_events: broadcast::Receiver<SessionEvent>,
    session: Option<Session>,
    disposed: bool,
}

impl AppContext {
    pub fn initialize(config: ClientConfig, services: Services) -> Self {
        Self::initialize_with_clock(config, services, Arc::new(SystemClock))
    }

    pub fn initialize_with_clock(
        config: ClientConfig,
        services: Services,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let session_events = services.auth.session_events();
        info!(ai = services.text.is_some(), "app context initialized");
        Self {
            config,
            services,
            store: Arc::new(StateStore::new()),
            clock,
            session_events,
            session: None,
            disposed: false,
        }
    }

    // ====================================================================
    // Accessors
    // ====================================================================

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Published view state.
    pub fn store(&self) -> Arc<StateStore> {
        self.store.clone()
    }

    pub fn assistant(&self) -> Assistant {
        Assistant::new(self.services.text.clone())
    }

    /// The signed-in user.
    pub fn me(&self) -> Option<&User> {
        self.session.as_ref().map(|s| &s.env.me)
    }

    pub fn is_signed_in(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn current_page(&self) -> Option<Page> {
        self.active().map(ActivePage::page)
    }

    pub fn active(&self) -> Option<&ActivePage> {
        self.session.as_ref().and_then(|s| s.page.as_ref())
    }

    pub fn active_mut(&mut self) -> Option<&mut ActivePage> {
        self.session.as_mut().and_then(|s| s.page.as_mut())
    }

    pub fn feed_mut(&mut self) -> Option<&mut FeedPage> {
        match self.active_mut()? {
            ActivePage::Feed(p) => Some(p),
            _ => None,
        }
    }

    pub fn profile_mut(&mut self) -> Option<&mut ProfilePage> {
        match self.active_mut()? {
            ActivePage::Profile(p) => Some(p),
            _ => None,
        }
    }

    pub fn chat_mut(&mut self) -> Option<&mut ChatPage> {
        match self.active_mut()? {
            ActivePage::Chat(p) => Some(p),
            _ => None,
        }
    }

    pub fn shorts_mut(&mut self) -> Option<&mut ShortsPage> {
        match self.active_mut()? {
            ActivePage::Shorts(p) => Some(p),
            _ => None,
        }
    }

    pub fn notifications(&self) -> Option<&NotificationCenter> {
        self.session.as_ref().map(|s| &s.notifications)
    }

    pub fn notifications_mut(&mut self) -> Option<&mut NotificationCenter> {
        self.session.as_mut().map(|s| &mut s.notifications)
    }

    // ====================================================================
    // Session
    // ====================================================================

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            return Err(ClientError::Disposed("app context".into()));
        }
        Ok(())
    }

    pub async fn sign_in(&mut self, email: &str, password: &str) -> Result<User> {
        self.ensure_live()?;
        let session = self.services.auth.sign_in(email, password).await?;
        self.start_session(&session.user_id).await
    }

    /// Resume a session the auth provider already holds.
    pub async fn restore_session(&mut self) -> Result<Option<User>> {
        self.ensure_live()?;
        match self.services.auth.session().await? {
            Some(session) => self.start_session(&session.user_id).await.map(Some),
            None => Ok(None),
        }
    }

    async fn start_session(&mut self, user_id: &str) -> Result<User> {
        self.end_session();
        let me = fetch_user(&*self.services.data, user_id).await?;
        let env = Arc::new(PageEnv {
            services: self.services.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            me: me.clone(),
        });
        let mut notifications = NotificationCenter::new(env.clone());
        if let Err(e) = notifications.load().await {
            warn!(error = %e, "notifications unavailable");
        }
        self.session = Some(Session {
            env,
            notifications,
            page: None,
        });
        self.store.set(AuthState::PATH, AuthState { user: Some(me.clone()) });
        info!(user_id = %me.id, "signed in");
        Ok(me)
    }

    /// Drop every session-owned controller and all published state.
    fn end_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.dispose();
            info!(user_id = %session.env.me.id, "session ended");
        }
        self.store.clear();
    }

    /// Sign out. Local state is cleared even when the provider call fails.
    pub async fn sign_out(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.end_session();
        self.services.auth.sign_out().await
    }

    // ====================================================================
    // Navigation
    // ====================================================================

    /// Dispose the current page and show `page`. A load failure is
    /// published on the new page's state and returned; the page stays
    /// current so it can be reloaded.
    pub async fn navigate(&mut self, page: Page) -> Result<()> {
        self.ensure_live()?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ClientError::Unauthenticated("Sign in first".into()))?;
        if let Some(mut old) = session.page.take() {
            debug!(from = %old.page(), to = %page, "leaving page");
            old.dispose();
        }
        let active = session.page.insert(ActivePage::open(&page, session.env.clone()));
        self.store.set(AppState::PATH, AppState { page: page.clone() });
        info!(%page, "navigated");
        active.load().await
    }

    /// Load the current page again.
    pub async fn reload(&mut self) -> Result<()> {
        self.ensure_live()?;
        match self.active_mut() {
            Some(page) => page.load().await,
            None => Err(ClientError::NotFound("no page is open".into())),
        }
    }

    // ====================================================================
    // Events
    // ====================================================================

    /// Handle session changes, then apply every queued real-time event to
    /// the notifications and the current page. Returns how many events
    /// were applied.
    pub async fn pump(&mut self) -> Result<usize> {
        self.ensure_live()?;
        let mut signed_out = false;
        loop {
            match self.session_events.try_recv() {
                Ok(SessionEvent::SignedOut) => signed_out = true,
                Ok(SessionEvent::TokenRefreshed(_)) => debug!("session token refreshed"),
                Ok(SessionEvent::SignedIn(_)) => signed_out = false,
                Err(TryRecvError::Lagged(n)) => warn!(skipped = n, "session events lagged"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        // A sign-out queued before a later sign-in is stale; ask the provider.
        if signed_out && self.session.is_some() && self.services.auth.session().await?.is_none() {
            info!("signed out by the auth provider");
            self.end_session();
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(0);
        };
        let mut applied = session.notifications.drain_events().await;
        if let Some(page) = session.page.as_mut() {
            applied += page.drain_events().await;
        }
        Ok(applied)
    }

    // ====================================================================
    // Profile
    // ====================================================================

    /// Edit the signed-in user's profile. The own profile page must be
    /// open; on success the session user is refreshed.
    pub async fn edit_profile(&mut self, edit: ProfileEdit) -> Result<Settled> {
        self.ensure_live()?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ClientError::Unauthenticated("Sign in first".into()))?;
        let Some(ActivePage::Profile(profile)) = session.page.as_mut() else {
            return Err(ClientError::Validation("Open your profile to edit it".into()));
        };
        let settled = profile.edit_profile(edit).await?;
        if settled == Settled::Confirmed {
            if let Some(user) = profile.user().cloned() {
                let mut env = (*session.env).clone();
                env.me = user.clone();
                session.env = Arc::new(env);
                self.store.set(AuthState::PATH, AuthState { user: Some(user) });
            }
        }
        Ok(settled)
    }

    // ====================================================================
    // Lifecycle
    // ====================================================================

    /// Release every controller and subscription. Later calls fail with
    /// `DISPOSED`.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.end_session();
        self.disposed = true;
        info!("app context disposed");
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::testing::{profile, t0};
    use crate::state::path;
    use pulse_client::MemoryBackend;
    use pulse_core::ManualClock;

    fn app() -> (Arc<MemoryBackend>, AppContext) {
        let clock = ManualClock::new(t0());
        let backend = Arc::new(MemoryBackend::with_clock(Arc::new(clock.clone())));
        backend.seed(pulse_client::table::PROFILES, [profile("u2", "Bea")]);
        backend
            .create_account("ana@example.com", "pw", profile("me", "Ana"))
            .unwrap();
        let app = AppContext::initialize_with_clock(
            ClientConfig::default(),
            backend.clone().into_services(),
            Arc::new(clock),
        );
        (backend, app)
    }

    #[tokio::test]
    async fn navigate_requires_sign_in() {
        let (_, mut app) = app();
        let err = app.navigate(Page::Feed).await.unwrap_err();
        assert_eq!(err.error_code(), "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn sign_in_publishes_user() {
        let (_, mut app) = app();
        let me = app.sign_in("ana@example.com", "pw").await.unwrap();
        assert_eq!(me.display_name, "Ana");
        let auth: AuthState = app.store().get_as(AuthState::PATH).unwrap();
        assert_eq!(auth.user.unwrap().id, me.id);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let (_, mut app) = app();
        assert!(app.sign_in("ana@example.com", "nope").await.is_err());
        assert!(!app.is_signed_in());
    }

    #[tokio::test]
    async fn navigation_swaps_the_active_page() {
        let (_, mut app) = app();
        app.sign_in("ana@example.com", "pw").await.unwrap();
        app.navigate(Page::Feed).await.unwrap();
        assert!(app.feed_mut().is_some());
        app.navigate(Page::Chat("u2".into())).await.unwrap();
        assert!(app.feed_mut().is_none());
        assert_eq!(app.current_page(), Some(Page::Chat("u2".into())));
        let state: AppState = app.store().get_as(AppState::PATH).unwrap();
        assert_eq!(state.page, Page::Chat("u2".into()));
    }

    #[tokio::test]
    async fn sign_out_clears_published_state() {
        let (_, mut app) = app();
        app.sign_in("ana@example.com", "pw").await.unwrap();
        app.navigate(Page::Feed).await.unwrap();
        assert!(app.store().contains(path::FEED_POSTS));
        app.sign_out().await.unwrap();
        assert!(!app.is_signed_in());
        assert!(app.store().is_empty());
        assert!(app.restore_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_resumes_provider_session() {
        let (backend, mut app) = app();
        backend
            .clone()
            .into_services()
            .auth
            .sign_in("ana@example.com", "pw")
            .await
            .unwrap();
        let me = app.restore_session().await.unwrap().unwrap();
        assert_eq!(me.display_name, "Ana");
    }

    #[tokio::test]
    async fn disposed_context_refuses_work() {
        let (_, mut app) = app();
        app.dispose();
        let err = app.sign_in("ana@example.com", "pw").await.unwrap_err();
        assert_eq!(err.error_code(), "DISPOSED");
    }

    #[tokio::test]
    async fn edit_profile_refreshes_session_user() {
        let (_, mut app) = app();
        let me = app.sign_in("ana@example.com", "pw").await.unwrap();
        app.navigate(Page::Profile(me.id.clone())).await.unwrap();
        let edit = ProfileEdit {
            display_name: Some("Ana L.".into()),
            ..Default::default()
        };
        assert_eq!(app.edit_profile(edit).await.unwrap(), Settled::Confirmed);
        assert_eq!(app.me().unwrap().display_name, "Ana L.");
    }
}
