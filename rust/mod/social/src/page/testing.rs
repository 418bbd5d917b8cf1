//! Fixtures for controller unit tests.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use pulse_client::row::table;
use pulse_client::{MemoryBackend, Row};
use pulse_core::{ClientConfig, ManualClock};
use pulse_flux::StateStore;

use crate::normalize::user_from_row;
use crate::page::PageEnv;

pub(crate) struct Fixture {
    pub backend: Arc<MemoryBackend>,
    pub clock: ManualClock,
    pub env: Arc<PageEnv>,
}

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub(crate) fn ts(minutes: i64) -> String {
    (t0() + Duration::minutes(minutes)).to_rfc3339()
}

pub(crate) fn profile(id: &str, name: &str) -> Row {
    json!({"id": id, "username": id, "full_name": name})
}

/// Backend with profiles `me`, `u2` and `u3`, signed in as `me`.
pub(crate) fn fixture() -> Fixture {
    let clock = ManualClock::new(t0());
    let backend = Arc::new(MemoryBackend::with_clock(Arc::new(clock.clone())));
    backend.seed(
        table::PROFILES,
        [profile("me", "Me"), profile("u2", "Bea"), profile("u3", "Caio")],
    );
    let me = user_from_row(&profile("me", "Me")).unwrap();
    let env = Arc::new(PageEnv {
        services: backend.clone().into_services(),
        store: Arc::new(StateStore::new()),
        clock: Arc::new(clock.clone()),
        config: ClientConfig::default(),
        me,
    });
    Fixture {
        backend,
        clock,
        env,
    }
}

pub(crate) fn post_row(id: &str, author: &str, minutes: i64) -> Row {
    json!({
        "id": id,
        "user_id": author,
        "content": format!("post {}", id),
        "image_url": null,
        "video_url": null,
        "shares": 0,
        "created_at": ts(minutes),
    })
}

/// `count` likes on `post_id` from distinct non-`me` users.
pub(crate) fn like_rows(post_id: &str, count: usize) -> Vec<Row> {
    (0..count)
        .map(|i| json!({"post_id": post_id, "user_id": format!("fan{}", i)}))
        .collect()
}
