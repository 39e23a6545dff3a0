use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;

use super::auth::CredentialProvider;
use super::error::{
    ApiError, ApiResult, DecodeSnafu, HttpStatusSnafu, InvalidUrlSnafu, RejectedSnafu,
    RequestSnafu, UnauthorizedSnafu,
};
use super::events::{
    BoxFuture, ErrorCause, ExchangeEvent, ExchangeEventSender, ExchangeStreamHandle,
    ExchangeWorker, make_event_stream,
};
use super::ids::{ChatId, ValidationId};
use super::sse::SseStreamParser;
use super::types::{Chat, ExchangeRequest, Message, ValidationOutcome};
use super::{ChatDirectory, ExchangeTransport, MessagePersistence, ValidationService};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
    /// Applies to plain JSON requests; streaming bodies are bounded by the session idle window.
    pub request_timeout: Duration,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

/// `reqwest` implementation of every backend collaborator.
#[derive(Clone)]
pub struct HttpBackend {
    base_url: Url,
    request_timeout: Duration,
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpBackend {
    pub fn new(
        config: BackendConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> ApiResult<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|_| ApiError::InvalidUrl {
            stage: "http-backend-new",
            raw: config.base_url.clone(),
        })?;
        ensure!(
            matches!(base_url.scheme(), "http" | "https") && !base_url.cannot_be_a_base(),
            InvalidUrlSnafu {
                stage: "http-backend-new",
                raw: config.base_url.clone(),
            }
        );

        // No client-wide timeout: it would also cut long-lived event streams.
        let client = Client::builder().build().context(RequestSnafu {
            stage: "build-client",
        })?;

        Ok(Self {
            base_url,
            request_timeout: config.request_timeout,
            client,
            credentials,
        })
    }

    pub fn endpoint(&self, segments: &[&str]) -> ApiResult<Url> {
        let mut url = self.base_url.clone();
        {
            let Ok(mut path) = url.path_segments_mut() else {
                return InvalidUrlSnafu {
                    stage: "build-endpoint",
                    raw: self.base_url.to_string(),
                }
                .fail();
            };
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    async fn execute(
        &self,
        stage: &'static str,
        method: Method,
        url: Url,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> ApiResult<Response> {
        let token = self.credentials.bearer_token().await?;
        let response = self
            .build_request(method.clone(), url.clone(), body, token.as_deref(), timeout)
            .send()
            .await
            .context(RequestSnafu { stage })?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            tracing::debug!("backend returned 401 at {stage}; refreshing credentials once");
            let refreshed = self.credentials.refresh().await?;
            self.build_request(method, url, body, refreshed.as_deref(), timeout)
                .send()
                .await
                .context(RequestSnafu { stage })?
        } else {
            response
        };

        let status = response.status();
        ensure!(status != StatusCode::UNAUTHORIZED, UnauthorizedSnafu { stage });
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return HttpStatusSnafu {
                stage,
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        Ok(response)
    }

    fn build_request(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        token: Option<&str>,
        timeout: Option<Duration>,
    ) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }

    async fn send_json<T>(
        &self,
        stage: &'static str,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        let response = self
            .execute(stage, method, url, body, Some(self.request_timeout))
            .await?;
        let payload = response.text().await.context(RequestSnafu { stage })?;
        serde_json::from_str(&payload).context(DecodeSnafu { stage })
    }

    async fn send_empty(
        &self,
        stage: &'static str,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> ApiResult<()> {
        self.execute(stage, method, url, body, Some(self.request_timeout))
            .await
            .map(|_| ())
    }

    async fn open_exchange_response(&self, request: &ExchangeRequest) -> ApiResult<Response> {
        let url = self.endpoint(&["chats", request.chat_id.as_str(), "messages"])?;
        let body = serde_json::to_value(request).context(DecodeSnafu {
            stage: "encode-exchange-request",
        })?;
        self.execute("open-exchange-stream", Method::POST, url, Some(&body), None)
            .await
    }

    fn emit_error_event(event_tx: &ExchangeEventSender, cause: ErrorCause, message: String) {
        let _ = event_tx.send(ExchangeEvent::Error { cause, message });
    }

    async fn run_exchange_worker(
        self,
        request: ExchangeRequest,
        event_tx: ExchangeEventSender,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let chat_id = request.chat_id.clone();
        let response = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!("exchange on chat {chat_id} cancelled before response headers");
                return;
            }
            response = self.open_exchange_response(&request) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::error!("failed to open exchange stream on chat {chat_id}: {error}");
                Self::emit_error_event(&event_tx, stream_cause(&error), error.to_string());
                return;
            }
        };

        let mut bytes = response.bytes_stream();
        let mut parser = SseStreamParser::default();

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Dropping the body stream closes the connection so the backend sees the abort.
                    tracing::debug!("exchange stream on chat {chat_id} cancelled");
                    return;
                }
                chunk = bytes.next() => {
                    match chunk {
                        Some(Ok(chunk)) => {
                            for event in parser.feed(&chunk) {
                                let terminal = event.is_terminal();
                                if event_tx.send(event).is_err() || terminal {
                                    return;
                                }
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!("exchange stream chunk on chat {chat_id} failed: {source}");
                            Self::emit_error_event(&event_tx, ErrorCause::Transport, source.to_string());
                            return;
                        }
                        // Closing without a terminal frame is reported by the session reader.
                        None => return,
                    }
                }
            }
        }
    }
}

fn stream_cause(error: &ApiError) -> ErrorCause {
    match error {
        ApiError::Unauthorized { .. } | ApiError::Credentials { .. } => ErrorCause::Unauthorized,
        ApiError::HttpStatus { status, .. } => ErrorCause::HttpStatus(*status),
        ApiError::Decode { .. } => ErrorCause::Decode,
        ApiError::Request { .. }
        | ApiError::InvalidUrl { .. }
        | ApiError::NotFound { .. }
        | ApiError::Rejected { .. } => ErrorCause::Transport,
    }
}

impl ChatDirectory for HttpBackend {
    fn list_chats<'a>(&'a self) -> BoxFuture<'a, ApiResult<Vec<Chat>>> {
        Box::pin(async move {
            let url = self.endpoint(&["chats"])?;
            self.send_json("list-chats", Method::GET, url, None).await
        })
    }

    fn create_chat<'a>(&'a self) -> BoxFuture<'a, ApiResult<Chat>> {
        Box::pin(async move {
            let url = self.endpoint(&["chats"])?;
            self.send_json("create-chat", Method::POST, url, Some(&json!({})))
                .await
        })
    }

    fn delete_chat<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(async move {
            let url = self.endpoint(&["chats", chat_id.as_str()])?;
            self.send_empty("delete-chat", Method::DELETE, url, None)
                .await
        })
    }
}

impl MessagePersistence for HttpBackend {
    fn list_messages<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, ApiResult<Vec<Message>>> {
        Box::pin(async move {
            let url = self.endpoint(&["chats", chat_id.as_str(), "messages"])?;
            self.send_json("list-messages", Method::GET, url, None)
                .await
        })
    }
}

impl ExchangeTransport for HttpBackend {
    fn open_exchange(&self, request: ExchangeRequest) -> ApiResult<ExchangeStreamHandle> {
        ensure!(
            !request.content.trim().is_empty(),
            RejectedSnafu {
                stage: "open-exchange",
                details: "exchange content is empty".to_string(),
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ExchangeWorker =
            Box::pin(self.clone().run_exchange_worker(request, event_tx, cancel_rx));

        Ok(ExchangeStreamHandle { stream, worker })
    }

    fn abandon_exchange<'a>(&'a self, chat_id: &'a ChatId) -> BoxFuture<'a, ApiResult<()>> {
        Box::pin(async move {
            let url = self.endpoint(&["chats", chat_id.as_str(), "stop"])?;
            self.send_empty("abandon-exchange", Method::POST, url, None)
                .await
        })
    }
}

impl ValidationService for HttpBackend {
    fn approve<'a>(
        &'a self,
        validation_id: &'a ValidationId,
        always_allow: bool,
    ) -> BoxFuture<'a, ApiResult<ValidationOutcome>> {
        Box::pin(async move {
            let url = self.endpoint(&["validations", validation_id.as_str(), "approve"])?;
            let body = json!({ "always_allow": always_allow });
            self.send_json("approve-validation", Method::POST, url, Some(&body))
                .await
        })
    }

    fn reject<'a>(
        &'a self,
        validation_id: &'a ValidationId,
        reason: Option<String>,
    ) -> BoxFuture<'a, ApiResult<ValidationOutcome>> {
        Box::pin(async move {
            let url = self.endpoint(&["validations", validation_id.as_str(), "reject"])?;
            let body = json!({ "reason": reason });
            self.send_json("reject-validation", Method::POST, url, Some(&body))
                .await
        })
    }

    fn feedback<'a>(
        &'a self,
        validation_id: &'a ValidationId,
        text: String,
    ) -> BoxFuture<'a, ApiResult<ValidationOutcome>> {
        Box::pin(async move {
            let url = self.endpoint(&["validations", validation_id.as_str(), "feedback"])?;
            let body = json!({ "feedback": text });
            self.send_json("feedback-validation", Method::POST, url, Some(&body))
                .await
        })
    }
}
