//! `pulse feed`: read the feed from the hosted backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use pulse_client::{
    AuthProvider, ChatCompletionGenerator, Realtime, RealtimeHub, RealtimeSocket, RestBackend,
    Services, TextGenerator,
};
use pulse_core::ClientConfig;
use pulse_social::state::PostList;
use pulse_social::{path, AppContext, Page};

use super::render;

/// How often queued live changes are applied while watching.
const PUMP_INTERVAL: Duration = Duration::from_millis(500);

pub async fn run(
    config: ClientConfig,
    email: &str,
    password: &str,
    watch_secs: u64,
    json_output: bool,
) -> Result<()> {
    let rest = Arc::new(RestBackend::from_config(&config).context("backend_url and anon_key are required")?);
    let session = rest.sign_in(email, password).await?;

    // Live changes only matter when watching.
    let realtime: Arc<dyn Realtime> = if watch_secs > 0 {
        let socket = RealtimeSocket::connect(rest.base_url(), rest.anon_key(), &session.access_token).await?;
        Arc::new(socket)
    } else {
        Arc::new(RealtimeHub::new())
    };
    let text = ChatCompletionGenerator::from_config(&config).map(|g| Arc::new(g) as Arc<dyn TextGenerator>);
    let services = Services {
        auth: rest.clone(),
        data: rest.clone(),
        realtime,
        storage: rest,
        text,
    };

    let mut app = AppContext::initialize(config, services);
    let me = app
        .restore_session()
        .await?
        .context("signed in, but no session is available")?;
    info!(user = %me.username, "signed in");

    if let Err(e) = app.navigate(Page::Feed).await {
        warn!(error = %e, "feed load failed");
    }
    print(&app, json_output)?;

    if watch_secs > 0 {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(watch_secs);
        let mut ticker = tokio::time::interval(PUMP_INTERVAL);
        while tokio::time::Instant::now() < deadline {
            ticker.tick().await;
            if app.pump().await? > 0 {
                println!();
                print(&app, json_output)?;
            }
        }
    }

    app.dispose();
    Ok(())
}

fn print(app: &AppContext, json_output: bool) -> Result<()> {
    let list: PostList = app
        .store()
        .get_as(path::FEED_POSTS)
        .context("feed not published")?;
    render::posts(&list, json_output)
}
