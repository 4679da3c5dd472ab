//! HTTP capability for journeys.
//!
//! A [`SessionPool`] hands out cookie-isolated HTTP sessions under a
//! concurrency cap: each acquisition gets a fresh cookie store (one virtual
//! user's cookies never leak into another's) and holds a pool permit that is
//! released on every exit path when the session drops. Every response emits
//! an `http_curl_metrics` message through the journey's context.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::{json, Map, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::context::Context;
use crate::errors::JourneyError;
use crate::messages::{kind, wall_time};

#[derive(Clone)]
pub struct SessionPool {
    semaphore: Arc<Semaphore>,
    request_timeout: Duration,
}

impl SessionPool {
    /// `max_sessions` caps concurrently held sessions across the runner.
    pub fn new(max_sessions: usize, request_timeout: Duration) -> Self {
        SessionPool {
            semaphore: Arc::new(Semaphore::new(max_sessions)),
            request_timeout,
        }
    }

    /// Acquire a session, waiting for a permit if the pool is saturated.
    pub async fn acquire(&self) -> Result<Session, JourneyError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| JourneyError::failure("session pool closed"))?;
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.request_timeout)
            .build()?;
        Ok(Session {
            client,
            _permit: permit,
        })
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        SessionPool::new(1000, Duration::from_secs(30))
    }
}

/// One virtual user's HTTP session: isolated cookies, permit held until drop.
pub struct Session {
    client: reqwest::Client,
    _permit: OwnedSemaphorePermit,
}

/// A fully read response plus its timing, as handed back to journey code.
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    pub total_time: f64,
}

impl HttpResponse {
    /// Domain error carrying `status_code` and `body` fields when the status
    /// is not the expected one.
    pub fn expect_status(&self, expected: u16) -> Result<(), JourneyError> {
        if self.status != expected {
            return Err(JourneyError::error(format!(
                "expected HTTP response code {}, got {}",
                expected, self.status
            ))
            .with_field("status_code", self.status)
            .with_field("body", self.body.clone()));
        }
        Ok(())
    }
}

impl Session {
    pub async fn get(&self, ctx: &Context, url: &str) -> Result<HttpResponse, JourneyError> {
        self.request(ctx, Method::GET, url, None).await
    }

    pub async fn post_json(
        &self,
        ctx: &Context,
        url: &str,
        body: &Value,
    ) -> Result<HttpResponse, JourneyError> {
        self.request(ctx, Method::POST, url, Some(body.clone())).await
    }

    /// Send one request, read the whole body, and emit `http_curl_metrics`
    /// with response timings keyed by CURL-style names.
    ///
    /// The pooled client does not surface connection-phase timings per
    /// request, so the `dns_time`, `connect_time`, `tls_time` and
    /// `transfer_start_time` keys are absent from the frame; consumers key
    /// on presence.
    pub async fn request(
        &self,
        ctx: &Context,
        method: Method,
        url: &str,
        json_body: Option<Value>,
    ) -> Result<HttpResponse, JourneyError> {
        let start_time = wall_time();
        let started = Instant::now();
        let mut builder = self.client.request(method.clone(), url);
        if let Some(body) = json_body {
            builder = builder.json(&body);
        }

        let response = builder.send().await?;
        // Headers are in once send resolves; the body transfer is still ahead.
        let first_byte_time = started.elapsed().as_secs_f64();
        let status = response.status().as_u16();
        let effective_url = response.url().to_string();
        let primary_ip = response.remote_addr().map(|addr| addr.ip().to_string());
        let body = response.text().await?;
        let total_time = started.elapsed().as_secs_f64();

        let mut fields = Map::new();
        fields.insert("start_time".to_string(), json!(start_time));
        fields.insert("effective_url".to_string(), json!(effective_url));
        fields.insert("response_code".to_string(), json!(status));
        fields.insert("first_byte_time".to_string(), json!(first_byte_time));
        fields.insert("total_time".to_string(), json!(total_time));
        if let Some(primary_ip) = primary_ip {
            fields.insert("primary_ip".to_string(), json!(primary_ip));
        }
        fields.insert("method".to_string(), json!(method.as_str()));
        ctx.send(kind::HTTP_CURL_METRICS, fields);

        debug!(url, status, total_time, "http request completed");
        Ok(HttpResponse {
            status,
            body,
            total_time,
        })
    }
}
