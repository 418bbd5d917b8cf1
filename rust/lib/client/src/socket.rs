//! Websocket adapter for the hosted real-time service.
//!
//! Speaks the channel protocol the service uses: join one channel that
//! carries `postgres_changes` for the public schema, send a heartbeat
//! every 30 seconds, and decode each change frame into a [`ChangeEvent`]
//! published to a local [`RealtimeHub`]. Page subscriptions are served by
//! the hub, so filtering happens client side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use pulse_core::{ClientError, Result};

use crate::collab::{ChangeEvent, ChangeOp, ChannelFilter, EventSink, Realtime, SubscriptionGuard};
use crate::realtime::RealtimeHub;

const CHANNEL_TOPIC: &str = "realtime:pulse";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct RealtimeSocket {
    hub: RealtimeHub,
    tasks: Vec<JoinHandle<()>>,
}

impl RealtimeSocket {
    /// Connect, join the change channel and start the reader, writer and
    /// heartbeat tasks.
    pub async fn connect(base_url: &str, anon_key: &str, access_token: &str) -> Result<Self> {
        let url = socket_url(base_url, anon_key);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Network(format!("realtime connect: {}", e)))?;
        info!(%base_url, "realtime connected");

        let (mut writer, mut reader) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let refs = Arc::new(AtomicU64::new(1));
        let hub = RealtimeHub::new();

        let join = join_frame(refs.fetch_add(1, Ordering::Relaxed), access_token);
        out_tx
            .send(join.to_string())
            .map_err(|_| ClientError::Network("realtime writer closed".into()))?;

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = writer.send(Message::Text(frame.into())).await {
                    warn!(error = %e, "realtime write failed");
                    break;
                }
            }
        });

        let heartbeat_tx = out_tx.clone();
        let heartbeat_refs = refs.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = heartbeat_frame(heartbeat_refs.fetch_add(1, Ordering::Relaxed));
                if heartbeat_tx.send(frame.to_string()).is_err() {
                    break;
                }
            }
        });

        let reader_hub = hub.clone();
        let reader_task = tokio::spawn(async move {
            // Keeps the writer alive for as long as frames keep arriving.
            let _out = out_tx;
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match decode_frame(text.as_str()) {
                        Ok(Some(event)) => {
                            reader_hub.publish(&event);
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "undecodable realtime frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "realtime read failed");
                        break;
                    }
                }
            }
            info!("realtime disconnected");
        });

        Ok(Self {
            hub,
            tasks: vec![writer_task, heartbeat_task, reader_task],
        })
    }

    pub fn hub(&self) -> &RealtimeHub {
        &self.hub
    }
}

impl Realtime for RealtimeSocket {
    fn subscribe(&self, filter: ChannelFilter, sink: EventSink) -> Result<SubscriptionGuard> {
        self.hub.subscribe(filter, sink)
    }
}

impl Drop for RealtimeSocket {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// `https://x.example.co` → `wss://x.example.co/realtime/v1/websocket?...`
pub fn socket_url(base_url: &str, anon_key: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/realtime/v1/websocket?apikey={}&vsn=1.0.0", ws_base, anon_key)
}

pub fn join_frame(msg_ref: u64, access_token: &str) -> Value {
    json!({
        "topic": CHANNEL_TOPIC,
        "event": "phx_join",
        "payload": {
            "config": {
                "postgres_changes": [{ "event": "*", "schema": "public" }]
            },
            "access_token": access_token,
        },
        "ref": msg_ref.to_string(),
    })
}

pub fn heartbeat_frame(msg_ref: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

/// Decode one text frame. Non-change frames (replies, presence, system
/// messages) yield `None`.
pub fn decode_frame(text: &str) -> Result<Option<ChangeEvent>> {
    let frame: Value = serde_json::from_str(text)?;
    match frame.get("event").and_then(Value::as_str) {
        Some("postgres_changes") => {}
        Some("phx_reply") => {
            let status = frame.pointer("/payload/status").and_then(Value::as_str);
            if status == Some("error") {
                warn!(payload = %frame["payload"], "realtime join rejected");
            }
            return Ok(None);
        }
        other => {
            debug!(event = ?other, "ignoring realtime frame");
            return Ok(None);
        }
    }

    let data = frame
        .pointer("/payload/data")
        .ok_or_else(|| ClientError::Decode("postgres_changes without data".into()))?;
    let table = data
        .get("table")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::Decode("change without table".into()))?;
    let op: ChangeOp = serde_json::from_value(data.get("type").cloned().unwrap_or(Value::Null))?;
    let record = data.get("record").cloned().unwrap_or(Value::Null);
    let old = data.get("old_record").cloned().unwrap_or(Value::Null);

    Ok(Some(ChangeEvent {
        table: table.to_string(),
        op,
        new: if op == ChangeOp::Delete { Value::Null } else { record },
        old,
    }))
}
