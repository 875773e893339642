#![forbid(unsafe_code)]

pub mod backend;
pub mod classify;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod loader;
pub mod player;
pub mod quality;
pub mod recovery;
pub mod session;
pub mod transport;
pub mod webhook;

pub use backend::{BackendError, RecordingClient, SourceKind, StreamDescriptor, StreamSource};
pub use classify::{classify, RequestKind, StreamReference};
pub use config::PlayerConfig;
pub use directory::{DirectoryError, SignedUrlDirectory, TierLabel};
pub use engine::{EngineEvent, EngineStatus, EventHub, HeadlessEngine, PlaybackEngine, Subscription};
pub use error::SessionError;
pub use loader::{
    substitute, HttpLoader, LoadError, LoadRequest, LoadResponse, Loader, SessionGuard,
    SubstitutingLoader, Substitution,
};
pub use player::{headless_factory, EngineFactory, Player, PlayerCommand, PlayerHandle};
pub use quality::{QualityTier, QualityTierManager, TierMenu, TierOption, TierSelection};
pub use recovery::{Fault, FaultKind, FaultRecord, FaultRecoveryController, RecoveryAction};
pub use session::{PlaybackSession, SessionSnapshot, SessionState, SourceInfo};
pub use transport::{format_time, Control, HeadlessSurface, MediaSurface, Transport};
pub use webhook::{
    notification_channel, Notification, WebhookConfig, WebhookDispatcher, WebhookPayload,
};
