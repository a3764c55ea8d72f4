//! Delivery of event batches to the control plane.

use crate::events::OutputEvent;
use async_trait::async_trait;
use hyper::{client::HttpConnector, Body, Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use tracing::{debug, error, warn};
use uuid::Uuid;

const EVENT_SCHEMA_HEADER: &str = "X-LaunchDarkly-Event-Schema";
const PAYLOAD_ID_HEADER: &str = "X-LaunchDarkly-Payload-ID";
const EVENT_SCHEMA_VERSION: &str = "3";

/// What happened to a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSenderResult {
    Success {
        /// The server's clock in unix ms, when it sent one.
        server_time: Option<u64>,
    },
    /// The batch was dropped but later batches may succeed.
    TransientFailure,
    /// The credentials were rejected; nothing will ever be accepted.
    PermanentFailure,
}

/// Ships event batches; swappable for testing.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send_events(&self, events: Vec<OutputEvent>) -> EventSenderResult;

    async fn send_diagnostic(&self, event: serde_json::Value);
}

/// The production sender: JSON posts over hyper.
pub struct HttpEventSender {
    client: hyper::Client<HttpsConnector<HttpConnector>>,
    bulk_uri: hyper::Uri,
    diagnostic_uri: hyper::Uri,
    token: String,
}

impl HttpEventSender {
    pub fn new(base_url: &str, token: &str) -> Result<Self, http::uri::InvalidUri> {
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client: hyper::Client::builder().build(HttpsConnector::with_native_roots()),
            bulk_uri: format!("{}/bulk", base).parse()?,
            diagnostic_uri: format!("{}/diagnostic", base).parse()?,
            token: token.to_string(),
        })
    }

    async fn post(
        &self,
        uri: &hyper::Uri,
        body: Vec<u8>,
        payload_id: Option<String>,
    ) -> EventSenderResult {
        // one immediate retry on server errors and transport failures
        for attempt in 0..2 {
            if attempt > 0 {
                debug!("retrying event post");
            }
            let mut builder = Request::builder()
                .method(Method::POST)
                .uri(uri.clone())
                .header(http::header::AUTHORIZATION, &self.token)
                .header(http::header::CONTENT_TYPE, "application/json")
                .header(http::header::USER_AGENT, crate::USER_AGENT)
                .header(EVENT_SCHEMA_HEADER, EVENT_SCHEMA_VERSION);
            if let Some(id) = &payload_id {
                builder = builder.header(PAYLOAD_ID_HEADER, id);
            }
            let request = match builder.body(Body::from(body.clone())) {
                Ok(request) => request,
                Err(error) => {
                    error!(%error, "could not build event request");
                    return EventSenderResult::TransientFailure;
                }
            };

            match self.client.request(request).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return EventSenderResult::Success {
                            server_time: server_time_of(&response),
                        };
                    }
                    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                        error!(%status, "event post rejected, giving up on sending events");
                        return EventSenderResult::PermanentFailure;
                    }
                    warn!(%status, "event post failed");
                    if !status.is_server_error() {
                        return EventSenderResult::TransientFailure;
                    }
                }
                Err(error) => {
                    warn!(%error, "event post failed");
                }
            }
        }
        EventSenderResult::TransientFailure
    }
}

fn server_time_of(response: &hyper::Response<Body>) -> Option<u64> {
    response
        .headers()
        .get(http::header::DATE)?
        .to_str()
        .ok()
        .and_then(|date| chrono::DateTime::parse_from_rfc2822(date).ok())
        .map(|date| date.timestamp_millis() as u64)
}

#[async_trait]
impl EventSender for HttpEventSender {
    async fn send_events(&self, events: Vec<OutputEvent>) -> EventSenderResult {
        let body = match serde_json::to_vec(&events) {
            Ok(body) => body,
            Err(error) => {
                error!(%error, "could not serialize events");
                return EventSenderResult::TransientFailure;
            }
        };
        debug!(count = events.len(), "posting event batch");
        // the payload id survives the retry so the server can deduplicate
        let payload_id = Uuid::new_v4().to_string();
        self.post(&self.bulk_uri, body, Some(payload_id)).await
    }

    async fn send_diagnostic(&self, event: serde_json::Value) {
        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(error) => {
                error!(%error, "could not serialize diagnostic event");
                return;
            }
        };
        self.post(&self.diagnostic_uri, body, None).await;
    }
}
