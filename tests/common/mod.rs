#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use webhook_delivery::{
    Batching, DeliveryMode, DeliveryRequest, DeliveryServer, EventKey, InMemoryEventRepo,
    InMemoryStateRepo, InMemoryWebhookRepo, RetryConfig, Semantics, ServerConfig, Webhook,
    WebhookEvent, WebhookHttpClient,
};

/// One POST observed by the scripted client.
#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub url: String,
    pub body: Vec<u8>,
    pub at: Instant,
}

impl RecordedPost {
    /// Number of events in the JSON-array body.
    pub fn batch_len(&self) -> usize {
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|value| value.as_array().map(Vec::len))
            .unwrap_or(0)
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP client double: answers from a script, then a fallback status,
/// and records every POST with its timestamp.
///
/// While a POST is open its body counts as active; the high-water mark
/// of identical active bodies tells whether the same dispatch was ever
/// posted twice concurrently.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Option<u16>>>,
    fallback: Option<u16>,
    posts: Mutex<Vec<RecordedPost>>,
    delay: Duration,
    active_bodies: Mutex<HashMap<Vec<u8>, usize>>,
    max_identical: AtomicUsize,
}

impl ScriptedClient {
    pub fn always(status: Option<u16>) -> Arc<Self> {
        Self::scripted(Vec::new(), status)
    }

    pub fn scripted(responses: Vec<Option<u16>>, fallback: Option<u16>) -> Arc<Self> {
        Self::with_delay(responses, fallback, Duration::ZERO)
    }

    /// A non-zero delay keeps every POST open long enough for
    /// overlapping requests to be observable.
    pub fn with_delay(
        responses: Vec<Option<u16>>,
        fallback: Option<u16>,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(responses.into()),
            fallback,
            posts: Mutex::new(Vec::new()),
            delay,
            active_bodies: Mutex::new(HashMap::new()),
            max_identical: AtomicUsize::new(0),
        })
    }

    pub async fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().await.clone()
    }

    pub async fn post_count(&self) -> usize {
        self.posts.lock().await.len()
    }

    /// Highest number of simultaneously open POSTs sharing one body.
    pub fn max_concurrent_identical_posts(&self) -> usize {
        self.max_identical.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebhookHttpClient for ScriptedClient {
    async fn post(&self, request: DeliveryRequest) -> Option<u16> {
        let body = request.body;
        self.posts.lock().await.push(RecordedPost {
            url: request.url,
            body: body.clone(),
            at: Instant::now(),
        });
        {
            let mut active = self.active_bodies.lock().await;
            let count = active.entry(body.clone()).or_insert(0);
            *count += 1;
            self.max_identical.fetch_max(*count, Ordering::SeqCst);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let status = self.script.lock().await.pop_front().unwrap_or(self.fallback);

        {
            let mut active = self.active_bodies.lock().await;
            if let Some(count) = active.get_mut(&body) {
                *count -= 1;
                if *count == 0 {
                    active.remove(&body);
                }
            }
        }
        status
    }
}

/// Shared repositories; servers can be started against them repeatedly
/// to exercise restart and recovery.
pub struct Harness {
    pub webhooks: Arc<InMemoryWebhookRepo>,
    pub events: Arc<InMemoryEventRepo>,
    pub state_repo: Arc<InMemoryStateRepo>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            webhooks: Arc::new(InMemoryWebhookRepo::new()),
            events: Arc::new(InMemoryEventRepo::new()),
            state_repo: Arc::new(InMemoryStateRepo::new()),
        }
    }

    pub async fn start(&self, client: Arc<ScriptedClient>, config: ServerConfig) -> DeliveryServer {
        DeliveryServer::start(
            self.webhooks.clone(),
            self.events.clone(),
            client,
            self.state_repo.clone(),
            config,
        )
        .await
    }
}

pub fn mode(batching: Batching, semantics: Semantics) -> DeliveryMode {
    DeliveryMode::new(batching, semantics)
}

pub fn webhook(id: &str, batching: Batching, semantics: Semantics) -> Webhook {
    Webhook::new(id, format!("http://example.com/hooks/{id}"), mode(batching, semantics))
}

pub fn json_event(webhook_id: &str, event_id: &str, n: u32) -> WebhookEvent {
    WebhookEvent::new(
        EventKey::new(webhook_id, event_id),
        format!("{{\"n\":{n}}}").into_bytes(),
    )
    .with_content_type("application/json")
}

pub fn retry_ms(base: u64, max: u64, timeout: u64) -> RetryConfig {
    RetryConfig::default()
        .with_capacity(16)
        .with_exponential_base(Duration::from_millis(base))
        .with_max_backoff(Duration::from_millis(max))
        .with_timeout(Duration::from_millis(timeout))
}
