//! Hosted backend over HTTP.
//!
//! Table access goes through the PostgREST API at `/rest/v1`, password
//! auth through `/auth/v1`, uploads through `/storage/v1`. Every request
//! carries the anon key in `apikey`; the bearer token is the session's
//! access token once signed in, the anon key before that.

use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use pulse_core::{ClientConfig, ClientError, Result};

use crate::collab::{AuthProvider, DataStore, ObjectStorage, Session, SessionEvent};
use crate::query::{filter_params, Filter, Query};
use crate::row::Row;

pub struct RestBackend {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    session: RwLock<Option<Session>>,
    sessions: broadcast::Sender<SessionEvent>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    user: TokenUser,
}

#[derive(Deserialize)]
struct TokenUser {
    id: String,
    email: Option<String>,
}

impl RestBackend {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        let (sessions, _) = broadcast::channel(16);
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            session: RwLock::new(None),
            sessions,
        }
    }

    /// Build from configuration; both backend URL and anon key are required.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        match (&config.backend_url, &config.anon_key) {
            (Some(url), Some(key)) => Ok(Self::new(url.clone(), key.clone())),
            _ => Err(ClientError::Unconfigured("backend".into())),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Public URL of an uploaded object.
    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, bucket, path)
    }

    /// Attach `apikey` and bearer headers.
    async fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = match &*self.session.read().await {
            Some(s) => s.access_token.clone(),
            None => self.anon_key.clone(),
        };
        builder
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .timeout(Duration::from_secs(30))
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = self.authed(builder).await.send().await.map_err(network)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(status_error(status.as_u16(), body))
    }

    async fn parse<R: DeserializeOwned>(resp: reqwest::Response) -> Result<R> {
        resp.json::<R>()
            .await
            .map_err(|e| ClientError::Decode(format!("response body: {}", e)))
    }
}

fn network(e: reqwest::Error) -> ClientError {
    ClientError::Network(e.to_string())
}

fn status_error(status: u16, body: String) -> ClientError {
    // PostgREST and GoTrue both put a human message in one of these keys.
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or(body);
    match status {
        401 | 403 => ClientError::Unauthenticated(message),
        404 => ClientError::NotFound(message),
        400 | 409 | 422 => ClientError::Validation(message),
        _ => ClientError::Backend(format!("HTTP {}: {}", status, message)),
    }
}

// ── DataStore ───────────────────────────────────────────────────────

#[async_trait::async_trait]
impl DataStore for RestBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Row>> {
        let req = self.http.get(self.table_url(&query.table)).query(&query.to_params());
        let resp = self.send(req).await?;
        Self::parse(resp).await
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row> {
        let req = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&row);
        let resp = self.send(req).await?;
        let mut rows: Vec<Row> = Self::parse(resp).await?;
        if rows.is_empty() {
            return Err(ClientError::Decode(format!("{} insert returned no row", table)));
        }
        Ok(rows.swap_remove(0))
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<Vec<Row>> {
        let req = self
            .http
            .patch(self.table_url(table))
            .query(&filter_params(filters))
            .header("Prefer", "return=representation")
            .json(&patch);
        let resp = self.send(req).await?;
        Self::parse(resp).await
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<usize> {
        if filters.is_empty() {
            return Err(ClientError::Validation(format!("refusing unfiltered delete on {}", table)));
        }
        let req = self
            .http
            .delete(self.table_url(table))
            .query(&filter_params(filters))
            .header("Prefer", "return=representation");
        let resp = self.send(req).await?;
        let rows: Vec<Row> = Self::parse(resp).await?;
        Ok(rows.len())
    }
}

// ── AuthProvider ────────────────────────────────────────────────────

#[async_trait::async_trait]
impl AuthProvider for RestBackend {
    async fn session(&self) -> Result<Option<Session>> {
        let guard = self.session.read().await;
        Ok(guard
            .as_ref()
            .filter(|s| s.expires_at.map_or(true, |t| t > Utc::now()))
            .cloned())
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let url = format!("{}/auth/v1/token?grant_type=password", self.base_url);
        let req = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password }));
        let resp = req.send().await.map_err(network)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match status_error(status.as_u16(), body) {
                ClientError::Validation(m) => ClientError::Unauthenticated(m),
                other => other,
            });
        }
        let token: TokenResponse = Self::parse(resp).await?;
        let session = Session {
            user_id: token.user.id,
            email: token.user.email,
            access_token: token.access_token,
            // Expire 30s early so a request never races the server clock.
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs - 30)),
        };
        *self.session.write().await = Some(session.clone());
        info!(user_id = %session.user_id, "signed in");
        let _ = self.sessions.send(SessionEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        let url = format!("{}/auth/v1/logout", self.base_url);
        if let Err(e) = self.send(self.http.post(&url)).await {
            // The local session is dropped regardless.
            warn!(error = %e, "remote sign-out failed");
        }
        *self.session.write().await = None;
        let _ = self.sessions.send(SessionEvent::SignedOut);
        Ok(())
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe()
    }
}

// ── ObjectStorage ───────────────────────────────────────────────────

#[async_trait::async_trait]
impl ObjectStorage for RestBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path);
        debug!(bucket, path, size = bytes.len(), "upload");
        let req = self
            .http
            .post(&url)
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes);
        self.send(req).await?;
        Ok(self.public_url(bucket, path))
    }
}
