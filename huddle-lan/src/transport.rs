//! LAN transport: beacons for discovery, one TCP stream per session with a small
//! handshake, then length-prefixed data frames.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use huddle_core::{
    EventSink, PeerHandle, SessionId, SessionRef, SessionState, Transport, TransportError,
    TransportEvent, TransportSession, PROTOCOL_VERSION,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::discovery::{self, with_book, AddressBook, SharedBook, Sightings};
use crate::wire::{self, Beacon, Handshake, LanWireError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error(transparent)]
    Wire(#[from] LanWireError),
    #[error("handshake timed out")]
    Timeout,
    #[error("invitation rejected by host")]
    Rejected,
    #[error("unexpected handshake message")]
    Unexpected,
}

#[derive(Debug)]
enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// One TCP session. Writes are queued to the connection task in order; `close`
/// takes effect after everything queued before it.
#[derive(Debug)]
pub struct LanSession {
    id: SessionId,
    tx: mpsc::UnboundedSender<Outgoing>,
    closing: AtomicBool,
}

impl TransportSession for LanSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(Outgoing::Frame(bytes.to_vec()))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Outgoing::Close);
        }
    }
}

fn new_session(ids: &AtomicU64) -> (Arc<LanSession>, mpsc::UnboundedReceiver<Outgoing>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Arc::new(LanSession {
        id: ids.fetch_add(1, Ordering::SeqCst) + 1,
        tx,
        closing: AtomicBool::new(false),
    });
    (session, rx)
}

fn report(sink: &EventSink, handle: &PeerHandle, session: &Arc<LanSession>, state: SessionState) {
    sink.emit(TransportEvent::SessionStateChanged {
        handle: handle.clone(),
        session: session.clone(),
        state,
    });
}

pub struct LanTransport {
    device_name: String,
    discovery_port: u16,
    transport_port: u16,
    peer_timeout: Duration,
    instance: Uuid,
    sink: Option<EventSink>,
    book: SharedBook,
    session_ids: Arc<AtomicU64>,
    advertiser: Vec<JoinHandle<()>>,
    browser: Option<JoinHandle<()>>,
}

impl LanTransport {
    pub fn new(cfg: &Config) -> Self {
        Self {
            device_name: cfg.device_name.clone(),
            discovery_port: cfg.discovery_port,
            transport_port: cfg.transport_port,
            peer_timeout: cfg.peer_timeout(),
            instance: Uuid::new_v4(),
            sink: None,
            book: SharedBook::default(),
            session_ids: Arc::default(),
            advertiser: Vec::new(),
            browser: None,
        }
    }

    /// Start a browse from nothing: the previous browse's tokens are dropped with it.
    fn fresh_sightings(&self, service: &str) -> Sightings {
        with_book(&self.book, AddressBook::clear);
        Sightings::new(service, self.instance)
    }

    fn sink(&self) -> Result<EventSink, TransportError> {
        self.sink
            .clone()
            .ok_or_else(|| TransportError::Unavailable("transport not bound".into()))
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        self.stop_advertising();
        self.stop_browsing();
    }
}

impl Transport for LanTransport {
    fn bind(&mut self, events: EventSink) {
        self.sink = Some(events);
    }

    fn advertise(&mut self, service: &str) -> Result<(), TransportError> {
        let sink = self.sink()?;
        self.stop_advertising();
        let listener = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.transport_port))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let socket = discovery::beacon_socket()?;
        let beacon = Beacon::new(service, self.instance, &self.device_name, self.transport_port);
        self.advertiser = vec![
            tokio::spawn(discovery::beacon_loop(socket, beacon, self.discovery_port)),
            tokio::spawn(accept_loop(
                listener,
                self.device_name.clone(),
                self.session_ids.clone(),
                sink,
            )),
        ];
        Ok(())
    }

    fn stop_advertising(&mut self) {
        if self.advertiser.is_empty() {
            return;
        }
        for task in self.advertiser.drain(..) {
            task.abort();
        }
        info!("advertising stopped");
    }

    fn browse(&mut self, service: &str) -> Result<(), TransportError> {
        let sink = self.sink()?;
        self.stop_browsing();
        let socket = discovery::browse_socket(self.discovery_port)?;
        let sightings = self.fresh_sightings(service);
        self.browser = Some(tokio::spawn(discovery::browse_loop(
            socket,
            sightings,
            self.peer_timeout,
            self.book.clone(),
            sink,
        )));
        info!(service, "browsing");
        Ok(())
    }

    fn stop_browsing(&mut self) {
        if let Some(task) = self.browser.take() {
            task.abort();
            debug!("browsing stopped");
        }
    }

    fn open_session(
        &mut self,
        peer: &PeerHandle,
        context: Option<Vec<u8>>,
    ) -> Result<SessionRef, TransportError> {
        let sink = self.sink()?;
        let addr = with_book(&self.book, |b| b.get(peer.token()))
            .ok_or_else(|| TransportError::Unreachable(peer.name().to_owned()))?;
        let (session, outgoing) = new_session(&self.session_ids);
        report(&sink, peer, &session, SessionState::Connecting);
        let hello = Handshake::Hello {
            version: PROTOCOL_VERSION,
            device_name: self.device_name.clone(),
            context,
        };
        tokio::spawn(dial(addr, hello, peer.clone(), session.clone(), outgoing, sink));
        Ok(session)
    }
}

async fn dial(
    addr: SocketAddr,
    hello: Handshake,
    handle: PeerHandle,
    session: Arc<LanSession>,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    sink: EventSink,
) {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake_dial(addr, &hello)).await {
        Ok(Ok(stream)) => {
            info!(peer = handle.name(), %addr, "session established");
            report(&sink, &handle, &session, SessionState::Connected);
            run_connection(stream, handle, session, outgoing, sink).await;
        }
        Ok(Err(e)) => {
            warn!(peer = handle.name(), %addr, error = %e, "session failed");
            report(&sink, &handle, &session, SessionState::NotConnected);
        }
        Err(_) => {
            warn!(peer = handle.name(), %addr, error = %SessionError::Timeout, "session failed");
            report(&sink, &handle, &session, SessionState::NotConnected);
        }
    }
}

async fn handshake_dial(addr: SocketAddr, hello: &Handshake) -> Result<TcpStream, SessionError> {
    let mut stream = TcpStream::connect(addr).await.map_err(LanWireError::from)?;
    wire::write_message(&mut stream, hello).await?;
    match wire::read_message::<_, Handshake>(&mut stream).await? {
        Handshake::Welcome { device_name } => {
            debug!(host = %device_name, "welcomed");
            Ok(stream)
        }
        Handshake::Reject => Err(SessionError::Rejected),
        Handshake::Hello { .. } => Err(SessionError::Unexpected),
    }
}

async fn accept_loop(listener: TcpListener, device_name: String, ids: Arc<AtomicU64>, sink: EventSink) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let (session, outgoing) = new_session(&ids);
                tokio::spawn(answer(
                    stream,
                    from,
                    device_name.clone(),
                    session,
                    outgoing,
                    sink.clone(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "accept failed; no longer taking sessions");
                break;
            }
        }
    }
}

async fn answer(
    mut stream: TcpStream,
    from: SocketAddr,
    device_name: String,
    session: Arc<LanSession>,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    sink: EventSink,
) {
    let hello = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        wire::read_message::<_, Handshake>(&mut stream),
    )
    .await;
    let (peer_name, context) = match hello {
        Ok(Ok(Handshake::Hello {
            version,
            device_name,
            context,
        })) if version == PROTOCOL_VERSION => (device_name, context),
        Ok(Ok(other)) => {
            debug!(%from, ?other, "unexpected handshake");
            let _ = wire::write_message(&mut stream, &Handshake::Reject).await;
            return;
        }
        Ok(Err(e)) => {
            debug!(%from, error = %e, "handshake failed");
            return;
        }
        Err(_) => {
            debug!(%from, "handshake timed out");
            return;
        }
    };

    let handle = PeerHandle::new(peer_name, session.id);
    let (reply, decision) = oneshot::channel();
    let posted = sink.emit(TransportEvent::Invitation {
        handle: handle.clone(),
        context,
        session: session.clone(),
        reply,
    });
    if !posted || !decision.await.unwrap_or(false) {
        info!(peer = handle.name(), %from, "invitation declined");
        let _ = wire::write_message(&mut stream, &Handshake::Reject).await;
        return;
    }
    if let Err(e) = wire::write_message(&mut stream, &Handshake::Welcome { device_name }).await {
        warn!(peer = handle.name(), error = %e, "handshake reply failed");
        report(&sink, &handle, &session, SessionState::NotConnected);
        return;
    }
    info!(peer = handle.name(), %from, "session established");
    report(&sink, &handle, &session, SessionState::Connecting);
    report(&sink, &handle, &session, SessionState::Connected);
    run_connection(stream, handle, session, outgoing, sink).await;
}

/// Pump frames both ways until either side ends, then report the session closed once.
async fn run_connection(
    stream: TcpStream,
    handle: PeerHandle,
    session: Arc<LanSession>,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    sink: EventSink,
) {
    let (reader, writer) = stream.into_split();
    tokio::select! {
        ended = pump_in(reader, &handle, session.id, &sink) => {
            if let Some(e) = ended {
                debug!(peer = handle.name(), error = %e, "read side ended");
            }
        }
        ended = pump_out(writer, outgoing) => {
            if let Err(e) = ended {
                debug!(peer = handle.name(), error = %e, "write side ended");
            }
        }
    }
    session.closing.store(true, Ordering::SeqCst);
    info!(peer = handle.name(), session = session.id, "session closed");
    report(&sink, &handle, &session, SessionState::NotConnected);
}

/// Returns the error that ended reading, or `None` once the engine is gone.
async fn pump_in(
    mut reader: OwnedReadHalf,
    handle: &PeerHandle,
    session: SessionId,
    sink: &EventSink,
) -> Option<LanWireError> {
    loop {
        match wire::read_frame(&mut reader).await {
            Ok(bytes) => {
                let delivered = sink.emit(TransportEvent::DataReceived {
                    handle: handle.clone(),
                    session,
                    bytes,
                });
                if !delivered {
                    return None;
                }
            }
            Err(e) => return Some(e),
        }
    }
}

async fn pump_out(
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) -> Result<(), LanWireError> {
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Frame(bytes) => wire::write_frame(&mut writer, &bytes).await?,
            Outgoing::Close => break,
        }
    }
    writer.shutdown().await?;
    Ok(())
}
