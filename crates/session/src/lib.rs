mod controller;
pub mod error;
pub mod gate;
pub mod overlay;
pub mod settings;
pub mod snapshot;
mod state;
pub mod store;
pub mod stream;

pub use controller::{
    Collaborators, ExchangeOutcome, ExchangeTicket, SendRequest, SessionController,
};
pub use error::{ConflictReason, ErrorKind, SessionError, SessionResult};
pub use gate::{GateState, Resolution, ValidationGate};
pub use overlay::{OptimisticOverlay, OverlayEntry};
pub use settings::{BackendSettings, SessionSettings, SettingsError, SettingsStore};
pub use snapshot::{Notification, NotificationKind, SessionSnapshot, StreamView};
pub use store::{MessageStore, RefreshGeneration};
pub use stream::{ReaderStep, StreamHandleId, StreamPhase, StreamProjection};
