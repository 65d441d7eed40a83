//! Public facade. One actor task owns the [`Coordinator`]; transport callbacks and
//! application calls are both posted into its channel and applied one at a time.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::coordinator::{Command, Coordinator, Event, Notification};
use crate::delegate::{BrowserDelegate, DataDelegate, StateDelegate};
use crate::discovery::{HandlerState, Role};
use crate::error::CommsError;
use crate::peer::PeerInfo;
use crate::protocol::Payload;
use crate::transport::{EventSink, Transport};

/// Application observers. Any of them may be left out.
#[derive(Clone, Default)]
pub struct Delegates {
    pub browser: Option<Arc<dyn BrowserDelegate>>,
    pub state: Option<Arc<dyn StateDelegate>>,
    pub data: Option<Arc<dyn DataDelegate>>,
}

impl Delegates {
    fn dispatch(&self, notification: &Notification) {
        match notification {
            Notification::PeerFound(peer) => {
                if let Some(d) = &self.browser {
                    d.peer_found(peer);
                }
            }
            Notification::PeerLost(peer) => {
                if let Some(d) = &self.browser {
                    d.peer_lost(peer);
                }
            }
            Notification::Error(message) => {
                if let Some(d) = &self.browser {
                    d.error(message);
                }
            }
            Notification::StateChanged(peer) => {
                if let Some(d) = &self.state {
                    d.state_changed(peer);
                }
            }
            Notification::DataReceived {
                descriptor,
                payload,
                from,
            } => {
                if let Some(d) = &self.data {
                    d.data_received(descriptor, payload.as_ref(), from);
                }
            }
        }
    }
}

/// Handle to a running engine. Cheap to clone; the engine stops once every handle is dropped.
///
/// `connect`, `disconnect`, `send` and `reset` never wait on the network: outcomes arrive
/// through the delegates. Delegates run on the engine task and may call any of those four
/// methods, but must not await the query methods. A delegate owned by the engine keeps a
/// [`WeakCommsService`] instead, or the engine would never see its last handle go.
#[derive(Clone)]
pub struct CommsService {
    tx: mpsc::UnboundedSender<Event>,
}

impl CommsService {
    /// Bind `transport` and spawn the engine task on the current tokio runtime.
    pub fn spawn(
        role: Role,
        service: impl Into<String>,
        mut transport: Box<dyn Transport>,
        delegates: Delegates,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.bind(EventSink::new(&tx));
        let core = Coordinator::new(role, service, transport);
        tokio::spawn(run(core, rx, delegates));
        Self { tx }
    }

    pub fn downgrade(&self) -> WeakCommsService {
        WeakCommsService {
            tx: self.tx.downgrade(),
        }
    }

    fn post(&self, command: Command) -> Result<(), CommsError> {
        self.tx
            .send(Event::Command(command))
            .map_err(|_| CommsError::ServiceStopped)
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, CommsError> {
        let (reply, answer) = oneshot::channel();
        self.post(make(reply))?;
        answer.await.map_err(|_| CommsError::ServiceStopped)
    }

    /// Start advertising (host) or browsing (client).
    pub async fn start(&self) -> Result<(), CommsError> {
        self.ask(Command::Start).await?
    }

    /// End every session and return to not-started. Safe to call repeatedly.
    pub async fn stop(&self) {
        if self.ask(Command::Stop).await.is_err() {
            debug!("stop after service task ended");
        }
    }

    pub fn reset(&self) {
        self.fire(Command::Reset);
    }

    pub fn connect(
        &self,
        peer: impl Into<String>,
        player_identity: Option<&str>,
        player_name: Option<&str>,
        reconnect: bool,
    ) {
        self.fire(Command::Connect {
            peer: peer.into(),
            player_identity: player_identity.map(str::to_owned),
            player_name: player_name.map(str::to_owned),
            reconnect,
        });
    }

    pub fn disconnect(&self, peer: impl Into<String>, reason: Option<&str>, reconnect: bool) {
        self.fire(Command::Disconnect {
            peer: peer.into(),
            reason: reason.map(str::to_owned),
            reconnect,
        });
    }

    /// Send to `to`, or broadcast to connected peers whose player identity matches
    /// `match_player` (all of them without a filter).
    pub fn send(
        &self,
        descriptor: impl Into<String>,
        payload: Option<Payload>,
        to: Option<&str>,
        match_player: Option<&str>,
    ) {
        self.fire(Command::Send {
            descriptor: descriptor.into(),
            payload,
            to: to.map(str::to_owned),
            match_player: match_player.map(str::to_owned),
        });
    }

    pub async fn connection_count(&self) -> Result<usize, CommsError> {
        self.ask(Command::ConnectionCount).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, CommsError> {
        self.ask(Command::Peers).await
    }

    pub async fn state(&self) -> Result<HandlerState, CommsError> {
        self.ask(Command::State).await
    }

    fn fire(&self, command: Command) {
        if let Err(e) = self.post(command) {
            debug!(error = %e, "command dropped");
        }
    }
}

/// Handle that does not keep the engine running.
#[derive(Clone)]
pub struct WeakCommsService {
    tx: mpsc::WeakUnboundedSender<Event>,
}

impl WeakCommsService {
    /// `None` once every [`CommsService`] is gone.
    pub fn upgrade(&self) -> Option<CommsService> {
        self.tx.upgrade().map(|tx| CommsService { tx })
    }
}

async fn run(mut core: Coordinator, mut rx: mpsc::UnboundedReceiver<Event>, delegates: Delegates) {
    debug!(role = ?core.role(), "service task started");
    while let Some(event) = rx.recv().await {
        for notification in core.handle(event) {
            delegates.dispatch(&notification);
        }
    }
    for notification in core.stop() {
        delegates.dispatch(&notification);
    }
    debug!("service task finished");
}
