use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

use super::ids::ValidationId;
use super::types::{Source, ValidationRequest};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ExchangeWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ExchangeEventSender = mpsc::UnboundedSender<ExchangeEvent>;

/// Machine-readable reason attached to a terminal stream failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCause {
    /// Error code reported by the backend inside the stream.
    Backend(String),
    Unauthorized,
    HttpStatus(u16),
    Transport,
    Decode,
    /// No event arrived inside the configured idle window.
    IdleTimeout,
    /// The channel closed without a terminal event.
    ClosedEarly,
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(code) => write!(formatter, "backend:{code}"),
            Self::Unauthorized => formatter.write_str("unauthorized"),
            Self::HttpStatus(status) => write!(formatter, "http:{status}"),
            Self::Transport => formatter.write_str("transport"),
            Self::Decode => formatter.write_str("decode"),
            Self::IdleTimeout => formatter.write_str("idle_timeout"),
            Self::ClosedEarly => formatter.write_str("closed_early"),
        }
    }
}

/// One inbound event of a streaming exchange, in backend emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeEvent {
    Token(String),
    Source(Source),
    ValidationRequested(ValidationRequest),
    ValidationResolved(ValidationId),
    Done,
    Error { cause: ErrorCause, message: String },
}

impl ExchangeEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/// Receiving half of one exchange.
///
/// Dropping the stream signals cancellation to the transport worker.
pub struct ExchangeEventStream {
    events: mpsc::UnboundedReceiver<ExchangeEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ExchangeStreamHandle {
    pub stream: ExchangeEventStream,
    pub worker: ExchangeWorker,
}

impl ExchangeEventStream {
    fn new(events: mpsc::UnboundedReceiver<ExchangeEvent>, cancel_tx: oneshot::Sender<()>) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<ExchangeEvent> {
        self.events.recv().await
    }
}

impl Drop for ExchangeEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Creates the channel triple shared by every transport implementation.
pub fn make_event_stream() -> (ExchangeEventSender, ExchangeEventStream, oneshot::Receiver<()>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ExchangeEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_stream_signals_worker_cancellation() {
        let (event_tx, stream, cancel_rx) = make_event_stream();
        drop(stream);

        assert!(cancel_rx.await.is_ok());
        assert!(event_tx.send(ExchangeEvent::Done).is_err());
    }

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let (event_tx, mut stream, _cancel_rx) = make_event_stream();
        for chunk in ["a", "b", "c"] {
            event_tx
                .send(ExchangeEvent::Token(chunk.to_string()))
                .expect("receiver alive");
        }
        event_tx.send(ExchangeEvent::Done).expect("receiver alive");

        let mut received = Vec::new();
        while let Some(event) = stream.recv().await {
            let terminal = event.is_terminal();
            received.push(event);
            if terminal {
                break;
            }
        }

        assert_eq!(
            received,
            vec![
                ExchangeEvent::Token("a".to_string()),
                ExchangeEvent::Token("b".to_string()),
                ExchangeEvent::Token("c".to_string()),
                ExchangeEvent::Done,
            ]
        );
    }
}
