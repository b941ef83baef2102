use async_trait::async_trait;

use crate::types::WebhookDispatch;

/// One HTTP request carrying a dispatch.
///
/// The body is a JSON array of the raw event payloads, in dispatch
/// order. Payload schema and authentication are the caller's concern.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl DeliveryRequest {
    pub fn from_dispatch(dispatch: &WebhookDispatch) -> Self {
        let mut body = Vec::with_capacity(
            dispatch.events().iter().map(|e| e.payload.len() + 1).sum::<usize>() + 2,
        );
        body.push(b'[');
        for (index, event) in dispatch.events().iter().enumerate() {
            if index > 0 {
                body.push(b',');
            }
            body.extend_from_slice(&event.payload);
        }
        body.push(b']');

        Self {
            url: dispatch.url().to_string(),
            content_type: dispatch.events().iter().find_map(|e| e.content_type.clone()),
            body,
        }
    }
}

/// Transport used to post dispatches.
///
/// `Some(status)` is the HTTP status of the response; `None` is a
/// transport failure. Success is exactly status 200 — every other
/// outcome is a delivery failure.
#[async_trait]
pub trait WebhookHttpClient: Send + Sync {
    async fn post(&self, request: DeliveryRequest) -> Option<u16>;
}

/// Default client backed by `reqwest`.
#[cfg(feature = "http")]
pub struct HttpClient {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpClient {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[cfg(feature = "http")]
impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl WebhookHttpClient for HttpClient {
    async fn post(&self, request: DeliveryRequest) -> Option<u16> {
        let mut builder = self.client.post(&request.url).body(request.body);
        if let Some(content_type) = request.content_type {
            builder = builder.header("Content-Type", content_type);
        }
        match builder.send().await {
            Ok(response) => Some(response.status().as_u16()),
            Err(error) => {
                tracing::debug!(url = %request.url, %error, "transport failure");
                None
            }
        }
    }
}
