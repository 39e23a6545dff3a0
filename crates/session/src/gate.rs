use std::collections::VecDeque;

use parley_api::{ValidationId, ValidationRequest};

/// How the user answered a validation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Approve { always_allow: bool },
    Reject { reason: Option<String> },
    Feedback { text: String },
}

impl Resolution {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Approve { .. } => "approve",
            Self::Reject { .. } => "reject",
            Self::Feedback { .. } => "feedback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum GateState {
    #[default]
    Idle,
    Pending(ValidationRequest),
    /// A resolving call is in flight; the request stays visible but cannot be claimed again.
    Resolving {
        request: ValidationRequest,
        resolution: Resolution,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
    AlreadyResolving,
    NotPending,
}

/// Pause point of one exchange: at most one request is surfaced, later ones queue behind it.
#[derive(Debug, Default)]
pub struct ValidationGate {
    state: GateState,
    queued: VecDeque<ValidationRequest>,
}

impl ValidationGate {
    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn is_blocking(&self) -> bool {
        !matches!(self.state, GateState::Idle)
    }

    pub fn is_resolving(&self) -> bool {
        matches!(self.state, GateState::Resolving { .. })
    }

    pub fn current(&self) -> Option<&ValidationRequest> {
        match &self.state {
            GateState::Idle => None,
            GateState::Pending(request) | GateState::Resolving { request, .. } => Some(request),
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn contains(&self, validation_id: &ValidationId) -> bool {
        self.current().is_some_and(|request| &request.id == validation_id)
            || self.queued.iter().any(|request| &request.id == validation_id)
    }

    /// Returns `true` when the request became the surfaced one.
    pub fn request(&mut self, request: ValidationRequest) -> bool {
        if self.contains(&request.id) {
            return false;
        }
        if self.is_blocking() {
            self.queued.push_back(request);
            return false;
        }
        self.state = GateState::Pending(request);
        true
    }

    /// Claims the surfaced request for one resolving call.
    pub fn begin(
        &mut self,
        validation_id: &ValidationId,
        resolution: Resolution,
    ) -> Result<ValidationRequest, GateRejection> {
        match &self.state {
            GateState::Pending(request) if &request.id == validation_id => {
                let request = request.clone();
                self.state = GateState::Resolving {
                    request: request.clone(),
                    resolution,
                };
                Ok(request)
            }
            GateState::Resolving { request, .. } if &request.id == validation_id => {
                Err(GateRejection::AlreadyResolving)
            }
            _ => Err(GateRejection::NotPending),
        }
    }

    /// Finishes a claimed resolution; the next queued request, if any, is surfaced and returned.
    pub fn complete(&mut self, validation_id: &ValidationId) -> Option<ValidationRequest> {
        let resolving = matches!(
            &self.state,
            GateState::Resolving { request, .. } if &request.id == validation_id
        );
        if !resolving {
            return None;
        }
        self.advance()
    }

    /// Puts a failed claim back to pending so it can be resolved again.
    pub fn abort(&mut self, validation_id: &ValidationId) -> bool {
        match std::mem::take(&mut self.state) {
            GateState::Resolving { request, .. } if &request.id == validation_id => {
                self.state = GateState::Pending(request);
                true
            }
            state => {
                self.state = state;
                false
            }
        }
    }

    /// The backend reported the request resolved; drop it wherever it sits.
    pub fn resolved_remotely(&mut self, validation_id: &ValidationId) -> Option<ValidationRequest> {
        if self.current().is_some_and(|request| &request.id == validation_id) {
            return self.advance();
        }
        self.queued.retain(|request| &request.id != validation_id);
        None
    }

    fn advance(&mut self) -> Option<ValidationRequest> {
        match self.queued.pop_front() {
            Some(next) => {
                self.state = GateState::Pending(next.clone());
                Some(next)
            }
            None => {
                self.state = GateState::Idle;
                None
            }
        }
    }
}
