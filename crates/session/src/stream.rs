use std::fmt;

use parley_api::{ErrorCause, ExchangeEvent, Source, ValidationId, ValidationRequest};

/// Identity of one exchange; events carrying an older identity are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandleId(u64);

impl StreamHandleId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamHandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an exchange is between opening and its terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Streaming,
    /// Terminal event seen; waiting on the durable refresh before release.
    Finalizing,
}

/// What the reader must do after one event was folded into the projection.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderStep {
    Continue,
    ValidationRequested(ValidationRequest),
    ValidationResolved(ValidationId),
    Completed,
    Failed { cause: ErrorCause, message: String },
}

/// Provisional assistant output accumulated from exchange events.
///
/// Tokens that arrive while paused on a validation are held back and released on resume.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamProjection {
    text: String,
    held: String,
    sources: Vec<Source>,
    paused: bool,
}

impl StreamProjection {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn held(&self) -> &str {
        &self.held
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn apply(&mut self, event: ExchangeEvent) -> ReaderStep {
        match event {
            ExchangeEvent::Token(token) => {
                if self.paused {
                    self.held.push_str(&token);
                } else {
                    self.text.push_str(&token);
                }
                ReaderStep::Continue
            }
            ExchangeEvent::Source(source) => {
                let duplicate = self.sources.iter().any(|known| match (&known.id, &source.id) {
                    (Some(known_id), Some(id)) => known_id == id,
                    _ => *known == source,
                });
                if !duplicate {
                    self.sources.push(source);
                }
                ReaderStep::Continue
            }
            ExchangeEvent::ValidationRequested(request) => ReaderStep::ValidationRequested(request),
            ExchangeEvent::ValidationResolved(validation_id) => {
                ReaderStep::ValidationResolved(validation_id)
            }
            ExchangeEvent::Done => {
                self.resume();
                ReaderStep::Completed
            }
            ExchangeEvent::Error { cause, message } => ReaderStep::Failed { cause, message },
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        if paused {
            self.paused = true;
        } else {
            self.resume();
        }
    }

    fn resume(&mut self) {
        self.paused = false;
        if !self.held.is_empty() {
            let held = std::mem::take(&mut self.held);
            self.text.push_str(&held);
        }
    }

    pub fn into_parts(self) -> (String, Vec<Source>) {
        let mut text = self.text;
        text.push_str(&self.held);
        (text, self.sources)
    }
}
