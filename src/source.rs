use crate::message::{InitData, Message, MessageParseError};
use eventsource_client as es;
use futures::{ready, stream::BoxStream, Stream, StreamExt};
use hyper::{client::HttpConnector, Body, Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use pin_project::pin_project;
use std::{
    convert::TryInto,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tracing::{debug, warn};

/// default URL for subscribing to the update stream
pub const DEFAULT_STREAM_BASE_URL: &str = "https://stream.launchdarkly.com/all";

/// default URL for fetching full snapshots when polling
pub const DEFAULT_POLL_BASE_URL: &str = "https://app.launchdarkly.com/sdk/latest-all";

/// Errors produced by a [Source] stream.
///
/// Most errors are transient and the consumer reconnects with backoff; a
/// fatal error (invalid credentials) permanently stops the consumer.
pub trait SourceError: std::fmt::Display {
    fn is_fatal(&self) -> bool {
        false
    }
}

impl SourceError for std::convert::Infallible {}

/// Allows reading a stream of update [Messages](Message)
pub trait Source {
    type Error: SourceError;
    type Stream: Stream<Item = Result<Message, Self::Error>>;

    /// Get the stream of updates
    ///
    /// Whenever a stream returned an error,
    /// this should be called again to get a
    /// fresh stream.
    fn stream(&self) -> Self::Stream;
}

impl<T: Source> Source for Arc<T> {
    type Error = T::Error;
    type Stream = T::Stream;
    fn stream(&self) -> Self::Stream {
        self.as_ref().stream()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreateSourceError {
    #[error("Invalid stream configuration: {0}")]
    Stream(#[from] es::Error),

    #[error("Invalid poll URL: {0}")]
    PollUrl(#[from] http::uri::InvalidUri),
}

/// [Source] for reading from an SSE stream.
///
/// This is the most common protocol LaunchDarkly offers.
pub struct SseSource {
    client: Box<dyn es::Client>,
}

impl SseSource {
    /// Create a [Source] consuming from SSE with an SDK token
    pub fn new<T: AsRef<str>>(base_url: &str, token: T) -> Result<Self, CreateSourceError> {
        let client = es::ClientBuilder::for_url(base_url)?
            .header("Authorization", token.as_ref())?
            .header("User-Agent", crate::USER_AGENT)?
            .build();
        Ok(Self {
            client: Box::new(client),
        })
    }
}

impl Source for SseSource {
    type Error = StreamError;
    type Stream = MessageStream<BoxStream<'static, Result<es::SSE, es::Error>>>;

    fn stream(&self) -> Self::Stream {
        MessageStream(self.client.stream())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Failed to read SSE stream: {0}")]
    Transport(es::Error),

    #[error("Failed to parse event: {0}")]
    Parse(#[from] MessageParseError),
}

impl SourceError for StreamError {
    fn is_fatal(&self) -> bool {
        match self {
            StreamError::Transport(es::Error::UnexpectedResponse(status)) => {
                matches!(status.as_u16(), 401 | 403)
            }
            _ => false,
        }
    }
}

/// [Stream] impl for [SseSource]
#[pin_project]
pub struct MessageStream<S>(#[pin] S);

impl<S> Stream for MessageStream<S>
where
    S: Stream<Item = Result<es::SSE, es::Error>>,
{
    type Item = Result<Message, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            // poll the stream
            let item = match ready!(this.0.as_mut().poll_next(cx))
                .transpose()
                .map_err(StreamError::Transport)?
            {
                Some(item) => item,
                None => return Poll::Ready(None),
            };
            match item {
                // convert the event into an update message
                es::SSE::Event(event) => {
                    let message = event.try_into()?;
                    return Poll::Ready(Some(Ok(message)));
                }
                // comments only keep the connection alive
                _ => continue,
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Polling request was rejected with status {0}, check the SDK key")]
    Unauthorized(u16),

    #[error("Polling request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("Polling request could not be built: {0}")]
    Request(#[from] http::Error),

    #[error("Unexpected polling response status {0}")]
    Status(u16),

    #[error("Failed to parse poll payload: {0}")]
    Parse(#[from] serde_json::Error),
}

impl SourceError for PollError {
    fn is_fatal(&self) -> bool {
        matches!(self, PollError::Unauthorized(_))
    }
}

/// [Source] that fetches the full data set on a fixed interval.
///
/// Every successful fetch surfaces as a fresh [Message::Put]. Transient
/// request failures are logged and retried on the next tick; only an
/// authorization failure ends the stream, fatally.
pub struct PollingSource {
    client: hyper::Client<HttpsConnector<HttpConnector>>,
    uri: hyper::Uri,
    token: String,
    interval: Duration,
}

impl PollingSource {
    pub fn new<T: AsRef<str>>(
        base_url: &str,
        token: T,
        interval: Duration,
    ) -> Result<Self, CreateSourceError> {
        let client = hyper::Client::builder().build(HttpsConnector::with_native_roots());
        Ok(Self {
            client,
            uri: base_url.parse()?,
            token: token.as_ref().to_string(),
            interval,
        })
    }

    async fn fetch_all(
        client: &hyper::Client<HttpsConnector<HttpConnector>>,
        uri: &hyper::Uri,
        token: &str,
    ) -> Result<InitData, PollError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri.clone())
            .header(http::header::AUTHORIZATION, token)
            .header(http::header::USER_AGENT, crate::USER_AGENT)
            .body(Body::empty())?;
        let response = client.request(request).await?;
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(PollError::Unauthorized(status.as_u16()))
            }
            status if !status.is_success() => return Err(PollError::Status(status.as_u16())),
            _ => {}
        }
        let body = hyper::body::to_bytes(response.into_body()).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

enum PollState {
    Initial,
    Delay,
    Stopped,
}

impl Source for PollingSource {
    type Error = PollError;
    type Stream = BoxStream<'static, Result<Message, PollError>>;

    fn stream(&self) -> Self::Stream {
        let client = self.client.clone();
        let uri = self.uri.clone();
        let token = self.token.clone();
        let interval = self.interval;

        futures::stream::unfold(PollState::Initial, move |state| {
            let client = client.clone();
            let uri = uri.clone();
            let token = token.clone();
            async move {
                match state {
                    PollState::Stopped => return None,
                    PollState::Initial => {}
                    PollState::Delay => tokio::time::sleep(interval).await,
                }
                loop {
                    match Self::fetch_all(&client, &uri, &token).await {
                        Ok(data) => {
                            debug!(
                                num_flags = data.flags.len(),
                                num_segments = data.segments.len(),
                                "fetched full data set"
                            );
                            return Some((Ok(Message::Put(data)), PollState::Delay));
                        }
                        Err(error) if error.is_fatal() => {
                            return Some((Err(error), PollState::Stopped));
                        }
                        Err(error) => {
                            // retried on the next tick
                            warn!(%error, "polling request failed");
                            tokio::time::sleep(interval).await;
                        }
                    }
                }
            }
        })
        .boxed()
    }
}
