use std::sync::Arc;
use std::time::Duration;

use webhook_delivery::{
    Batching, DeliveryMode, DeliveryServer, EventKey, HttpClient, InMemoryEventRepo,
    InMemoryStateRepo, InMemoryWebhookRepo, Semantics, ServerConfig, Webhook, WebhookEvent,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("webhook_delivery=debug").init();

    let webhooks = Arc::new(InMemoryWebhookRepo::new());
    let events = Arc::new(InMemoryEventRepo::new());
    let state = Arc::new(InMemoryStateRepo::new());

    webhooks
        .insert(Webhook::new(
            "orders",
            "https://example.com/hooks/orders",
            DeliveryMode::new(Batching::Batched, Semantics::AtLeastOnce),
        ))
        .await;

    let server = DeliveryServer::start(
        webhooks,
        events.clone(),
        Arc::new(HttpClient::new()),
        state,
        ServerConfig::default().with_batching_capacity(32),
    )
    .await;

    events
        .publish(
            WebhookEvent::new(EventKey::new("orders", "evt_123"), br#"{"id":123}"#.to_vec())
                .with_content_type("application/json"),
        )
        .await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    if let Err(error) = server.shutdown().await {
        eprintln!("shutdown failed: {error}");
    }
}
