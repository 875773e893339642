//! Background worker that owns a [`PlaybackSession`] and drives its engine.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::StreamSource;
use crate::config::PlayerConfig;
use crate::engine::{EngineStatus, HeadlessEngine, PlaybackEngine};
use crate::error::SessionError;
use crate::loader::Loader;
use crate::quality::{TierMenu, TierSelection};
use crate::session::{PlaybackSession, SessionSnapshot};
use crate::transport::{Control, HeadlessSurface, Transport};

const COMMAND_CAPACITY: usize = 32;

/// Builds the engine for each new session.
pub type EngineFactory =
    Arc<dyn Fn(Arc<dyn Loader>, &PlayerConfig) -> Box<dyn PlaybackEngine> + Send + Sync>;

pub fn headless_factory() -> EngineFactory {
    Arc::new(
        |loader: Arc<dyn Loader>, config: &PlayerConfig| -> Box<dyn PlaybackEngine> {
            Box::new(HeadlessEngine::new(loader, config))
        },
    )
}

pub enum PlayerCommand {
    RequestTier {
        selection: TierSelection,
        generation: Option<u64>,
        reply: oneshot::Sender<Result<TierMenu, SessionError>>,
    },
    Control {
        control: Control,
        reply: oneshot::Sender<Result<Transport, SessionError>>,
    },
    ChangeSource {
        source: StreamSource,
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Stop {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Cheap handle to a running player.
#[derive(Clone)]
pub struct PlayerHandle {
    id: String,
    tx: mpsc::Sender<PlayerCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl PlayerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, command: PlayerCommand) -> Result<(), SessionError> {
        self.tx.send(command).await.map_err(|_| SessionError::Closed)
    }

    pub async fn request_tier(
        &self,
        selection: TierSelection,
        generation: Option<u64>,
    ) -> Result<TierMenu, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(PlayerCommand::RequestTier {
            selection,
            generation,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn control(&self, control: Control) -> Result<Transport, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(PlayerCommand::Control { control, reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Replace the stream. The current session is fully torn down first.
    pub async fn change_source(
        &self,
        source: StreamSource,
    ) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(PlayerCommand::ChangeSource { source, reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn stop(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(PlayerCommand::Stop { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

enum Step {
    Command(PlayerCommand),
    Ticked(EngineStatus),
    Poll,
    Disconnected,
}

/// Runs one session per playback surface; commands are applied between
/// engine steps.
pub struct Player {
    session: PlaybackSession,
    rx: mpsc::Receiver<PlayerCommand>,
    snapshots: watch::Sender<SessionSnapshot>,
    fetch: Arc<dyn Loader>,
    factory: EngineFactory,
}

impl Player {
    pub fn spawn(
        session: PlaybackSession,
        fetch: Arc<dyn Loader>,
        factory: EngineFactory,
    ) -> (PlayerHandle, JoinHandle<SessionSnapshot>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        let handle = PlayerHandle {
            id: session.id().to_string(),
            tx,
            snapshots: snapshot_rx,
        };
        let player = Self {
            session,
            rx,
            snapshots: snapshot_tx,
            fetch,
            factory,
        };
        (handle, tokio::spawn(player.run()))
    }

    async fn run(mut self) -> SessionSnapshot {
        info!(session_id = %self.session.id(), "Player started");
        let mut idle = false;

        loop {
            let step = if idle || !self.session.is_running() {
                let wait = self.session.config().idle_poll_interval;
                match tokio::time::timeout(wait, self.rx.recv()).await {
                    Ok(Some(command)) => Step::Command(command),
                    Ok(None) => Step::Disconnected,
                    Err(_) => Step::Poll,
                }
            } else {
                tokio::select! {
                    biased;
                    command = self.rx.recv() => match command {
                        Some(command) => Step::Command(command),
                        None => Step::Disconnected,
                    },
                    status = self.session.tick() => Step::Ticked(status),
                }
            };

            match step {
                Step::Command(command) => {
                    idle = false;
                    if self.apply(command) {
                        break;
                    }
                }
                Step::Ticked(status) => {
                    idle = status != EngineStatus::Busy;
                    self.publish();
                    if !idle {
                        tokio::task::yield_now().await;
                    }
                }
                Step::Poll => idle = false,
                Step::Disconnected => {
                    debug!(session_id = %self.session.id(), "All handles dropped");
                    self.session.close();
                    self.publish();
                    break;
                }
            }
        }

        info!(session_id = %self.session.id(), "Player stopped");
        self.session.snapshot()
    }

    /// Returns true when the player should exit.
    fn apply(&mut self, command: PlayerCommand) -> bool {
        match command {
            PlayerCommand::RequestTier {
                selection,
                generation,
                reply,
            } => {
                let _ = reply.send(self.session.request_tier(selection, generation));
            }
            PlayerCommand::Control { control, reply } => {
                let _ = reply.send(self.session.control(control));
            }
            PlayerCommand::ChangeSource { source, reply } => {
                self.change_source(source);
                let _ = reply.send(self.session.snapshot());
            }
            PlayerCommand::Stop { reply } => {
                self.session.close();
                self.publish();
                let _ = reply.send(self.session.snapshot());
                return true;
            }
        }
        self.publish();
        false
    }

    fn change_source(&mut self, source: StreamSource) {
        let id = self.session.id().to_string();
        self.session.close();
        info!(session_id = %id, url = %source.url(), "Changing stream source");

        let factory = Arc::clone(&self.factory);
        let next = PlaybackSession::start(
            source,
            self.session.config().clone(),
            Box::new(HeadlessSurface::new()),
            Arc::clone(&self.fetch),
            |loader, config| factory(loader, config),
        )
        .with_id(id)
        .with_notifier(self.session.notifier().cloned());
        self.session = next;
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.session.snapshot());
    }
}
