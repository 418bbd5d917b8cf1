//! `pulse demo`: a scripted session against a seeded in-memory backend.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::info;

use pulse_client::{table, DataStore, MemoryBackend, Op, Row};
use pulse_core::{ClientConfig, ClientError, Clock, ManualClock, SystemClock};
use pulse_social::state::{ChatThread, NotificationList, PostList};
use pulse_social::{path, AppContext, Page, Settled};

use super::render;

const EMAIL: &str = "demo@pulse.local";
const PASSWORD: &str = "demo";

fn at(start: DateTime<Utc>, minutes_ago: i64) -> String {
    (start - Duration::minutes(minutes_ago)).to_rfc3339()
}

fn seed(backend: &MemoryBackend, now: DateTime<Utc>) -> Result<()> {
    backend.create_account(
        EMAIL,
        PASSWORD,
        json!({"id": "me", "username": "demo", "full_name": "Demo User"}),
    )?;
    backend.seed(
        table::PROFILES,
        [
            json!({"id": "u2", "username": "bea", "full_name": "Bea Costa"}),
            json!({"id": "u3", "username": "caio", "full_name": "Caio Reis"}),
        ],
    );
    backend.seed(
        table::POSTS,
        [
            json!({"id": "p1", "user_id": "u2", "content": "Sunrise over the bay", "image_url": "https://cdn.example/bay.jpg", "shares": 2, "created_at": at(now, 90)}),
            json!({"id": "p2", "user_id": "u3", "content": "New track out tonight", "shares": 0, "created_at": at(now, 30)}),
            json!({"id": "p3", "user_id": "me", "content": "Hello, Pulse", "shares": 0, "created_at": at(now, 5)}),
        ],
    );
    let likes: Vec<Row> = (0..15)
        .map(|i| json!({"post_id": "p1", "user_id": format!("fan{}", i)}))
        .collect();
    backend.seed(table::LIKES, likes);
    backend.seed(
        table::COMMENTS,
        [json!({"post_id": "p1", "user_id": "u3", "content": "Wow", "created_at": at(now, 80)})],
    );
    backend.seed(
        table::STORIES,
        [
            json!({"id": "s1", "user_id": "u2", "type": "text", "content": "Coffee first", "background": "#ffb347", "created_at": at(now, 60)}),
            json!({"id": "s2", "user_id": "u2", "type": "image", "content": "https://cdn.example/cup.jpg", "created_at": at(now, 50)}),
            json!({"id": "s3", "user_id": "u3", "type": "text", "content": "Studio day", "created_at": at(now, 20 * 60)}),
        ],
    );
    backend.seed(
        table::MESSAGES,
        [json!({"sender_id": "u2", "receiver_id": "me", "content": "Are you coming tonight?", "created_at": at(now, 15)})],
    );
    backend.seed(
        table::NOTIFICATIONS,
        [json!({"user_id": "me", "actor_id": "u2", "type": "follow", "is_read": false, "created_at": at(now, 100)})],
    );
    Ok(())
}

fn section(title: &str) {
    println!();
    println!("== {} ==", title);
}

fn print_feed(app: &AppContext, json_output: bool) -> Result<()> {
    let list: PostList = app
        .store()
        .get_as(path::FEED_POSTS)
        .context("feed not published")?;
    render::posts(&list, json_output)
}

pub async fn run(config: ClientConfig, json_output: bool) -> Result<()> {
    let clock = ManualClock::new(SystemClock.now());
    let backend = Arc::new(MemoryBackend::with_clock(Arc::new(clock.clone())));
    seed(&backend, clock.now())?;

    let mut app = AppContext::initialize_with_clock(
        config.clone(),
        backend.clone().into_services(),
        Arc::new(clock.clone()),
    );
    let me = app.sign_in(EMAIL, PASSWORD).await?;
    info!(user = %me.username, "demo session started");

    section("Feed");
    app.navigate(Page::Feed).await?;
    print_feed(&app, json_output)?;

    section("Like and comment");
    let feed = app.feed_mut().context("feed is not open")?;
    feed.toggle_like("p1").await?;
    feed.add_comment("p1", "Beautiful!").await?;
    app.pump().await?;
    print_feed(&app, json_output)?;

    section("Like while the backend fails");
    backend.fail_next(Op::Insert, table::LIKES, ClientError::Network("connection reset".into()));
    let feed = app.feed_mut().context("feed is not open")?;
    let settled = feed.toggle_like("p2").await?;
    println!("like on p2: {:?}", settled);
    print_feed(&app, json_output)?;

    section("Someone else likes p1");
    backend
        .insert(table::LIKES, json!({"post_id": "p1", "user_id": "u3"}))
        .await?;
    app.pump().await?;
    print_feed(&app, json_output)?;

    section("Stories");
    let feed = app.feed_mut().context("feed is not open")?;
    render::tray(&feed.tray(), json_output)?;
    feed.open_story(0).await?;
    let step = config.story_duration();
    while feed.viewer().is_some_and(|v| !v.is_finished() && v.current().is_some_and(|s| s.author.id == "u2")) {
        feed.story_tick(step).await?;
    }
    feed.close_story();
    println!("after viewing bea's stories:");
    render::tray(&feed.tray(), json_output)?;
    clock.advance(Duration::hours(5));
    println!("five hours later:");
    render::tray(&feed.tray(), json_output)?;

    section("Chat");
    app.navigate(Page::Chat("u2".into())).await?;
    let chat = app.chat_mut().context("chat is not open")?;
    if chat.send("On my way!").await? != Settled::Confirmed {
        println!("message was not sent");
    }
    clock.advance(Duration::minutes(1));
    backend
        .insert(
            table::MESSAGES,
            json!({"sender_id": "u2", "receiver_id": "me", "content": "See you there"}),
        )
        .await?;
    app.pump().await?;
    let thread: ChatThread = app
        .store()
        .get_as(&path::chat("u2"))
        .context("chat not published")?;
    render::chat(&thread, &me.id, json_output)?;

    section("Notifications");
    let list: NotificationList = app
        .store()
        .get_as(NotificationList::PATH)
        .context("notifications not published")?;
    render::notifications(&list, json_output)?;

    section("Caption help");
    let assistant = app.assistant();
    println!("configured: {}", assistant.is_configured());
    println!("{}", assistant.enhance_caption("sunset walk").await);

    app.sign_out().await?;
    info!("demo session ended");
    Ok(())
}
