//! LAN discovery: UDP multicast beacons while advertising; a browser listens, tracks
//! who it has seen, and reports peers that fall silent as lost.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use huddle_core::{EventSink, PeerHandle, TransportEvent, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::wire::{self, Beacon};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(3);

/// Session addresses of browsed peers, keyed by the token handed out in [`PeerHandle`]s.
#[derive(Debug, Default)]
pub struct AddressBook {
    next: u64,
    by_token: HashMap<u64, SocketAddr>,
}

impl AddressBook {
    pub(crate) fn insert(&mut self, addr: SocketAddr) -> u64 {
        self.next += 1;
        self.by_token.insert(self.next, addr);
        self.next
    }

    fn remove(&mut self, token: u64) {
        self.by_token.remove(&token);
    }

    /// Forget every address. Tokens keep counting up, so old handles never resolve again.
    pub fn clear(&mut self) {
        self.by_token.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn get(&self, token: u64) -> Option<SocketAddr> {
        self.by_token.get(&token).copied()
    }
}

pub type SharedBook = Arc<Mutex<AddressBook>>;

pub fn with_book<T>(book: &SharedBook, f: impl FnOnce(&mut AddressBook) -> T) -> T {
    f(&mut book.lock().unwrap_or_else(PoisonError::into_inner))
}

struct Sighting {
    token: u64,
    instance: Uuid,
    addr: SocketAddr,
    last_seen: Instant,
}

/// Browser-side view of the beacons heard so far.
pub struct Sightings {
    service: String,
    own_instance: Uuid,
    peers: HashMap<String, Sighting>,
}

impl Sightings {
    pub fn new(service: &str, own_instance: Uuid) -> Self {
        Self {
            service: service.to_owned(),
            own_instance,
            peers: HashMap::new(),
        }
    }

    /// Record a beacon. Returns a handle to report when the peer is new, or came back
    /// under a new instance or address.
    pub fn observe(
        &mut self,
        beacon: &Beacon,
        from: SocketAddr,
        now: Instant,
        book: &SharedBook,
    ) -> Option<PeerHandle> {
        if beacon.version != PROTOCOL_VERSION
            || beacon.service != self.service
            || beacon.instance == self.own_instance
        {
            return None;
        }
        let addr = SocketAddr::new(from.ip(), beacon.listen_port);
        if let Some(seen) = self.peers.get_mut(&beacon.device_name) {
            if seen.instance == beacon.instance && seen.addr == addr {
                seen.last_seen = now;
                return None;
            }
            with_book(book, |b| b.remove(seen.token));
        }
        let token = with_book(book, |b| b.insert(addr));
        self.peers.insert(
            beacon.device_name.clone(),
            Sighting {
                token,
                instance: beacon.instance,
                addr,
                last_seen: now,
            },
        );
        Some(PeerHandle::new(beacon.device_name.clone(), token))
    }

    /// Drop peers silent for at least `timeout`; returns their handles.
    pub fn expire(&mut self, now: Instant, timeout: Duration, book: &SharedBook) -> Vec<PeerHandle> {
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) >= timeout)
            .map(|(name, _)| name.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|name| {
                let seen = self.peers.remove(&name)?;
                with_book(book, |b| b.remove(seen.token));
                Some(PeerHandle::new(name, seen.token))
            })
            .collect()
    }
}

/// Socket for sending beacons. Ephemeral port, so advertisers never hold the discovery port.
pub fn beacon_socket() -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Socket for hearing beacons: the discovery port, joined to the multicast group.
pub fn browse_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

pub async fn beacon_loop(socket: UdpSocket, beacon: Beacon, discovery_port: u16) {
    let frame = match wire::encode(&beacon) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "cannot encode beacon; not advertising");
            return;
        }
    };
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));
    info!(service = %beacon.service, device = %beacon.device_name, "advertising");
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

pub async fn browse_loop(
    socket: UdpSocket,
    mut sightings: Sightings,
    timeout: Duration,
    book: SharedBook,
    sink: EventSink,
) {
    let mut buf = vec![0u8; 65536];
    let mut sweep = tokio::time::interval((timeout / 4).max(Duration::from_millis(250)));
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "discovery socket failed; browsing stopped");
                        return;
                    }
                };
                let beacon = match wire::decode::<Beacon>(&buf[..n]) {
                    Ok(b) => b,
                    Err(e) => {
                        debug!(%from, error = %e, "ignoring malformed beacon");
                        continue;
                    }
                };
                if let Some(handle) = sightings.observe(&beacon, from, Instant::now(), &book) {
                    debug!(peer = handle.name(), %from, "peer found");
                    if !sink.emit(TransportEvent::PeerFound(handle)) {
                        return;
                    }
                }
            }
            _ = sweep.tick() => {
                for handle in sightings.expire(Instant::now(), timeout, &book) {
                    debug!(peer = handle.name(), "peer timed out");
                    if !sink.emit(TransportEvent::PeerLost(handle)) {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, last], 50000))
    }

    #[test]
    fn sightings_filter_and_track() {
        let me = Uuid::new_v4();
        let book = SharedBook::default();
        let mut s = Sightings::new("huddle", me);
        let now = Instant::now();

        let own = Beacon::new("huddle", me, "self", 45681);
        assert!(s.observe(&own, addr(1), now, &book).is_none());
        let other_service = Beacon::new("poker", Uuid::new_v4(), "poker-table", 45681);
        assert!(s.observe(&other_service, addr(2), now, &book).is_none());

        let host = Beacon::new("huddle", Uuid::new_v4(), "table", 45681);
        let handle = s.observe(&host, addr(3), now, &book).unwrap();
        assert_eq!(handle.name(), "table");
        assert_eq!(
            with_book(&book, |b| b.get(handle.token())),
            Some(SocketAddr::from(([192, 168, 1, 3], 45681)))
        );
        assert!(s.observe(&host, addr(3), now, &book).is_none());

        // Restarted host: same name, new instance, new handle.
        let restarted = Beacon::new("huddle", Uuid::new_v4(), "table", 45681);
        let again = s.observe(&restarted, addr(3), now, &book).unwrap();
        assert_ne!(again.token(), handle.token());
        assert!(with_book(&book, |b| b.get(handle.token())).is_none());
    }

    #[test]
    fn cleared_book_never_reuses_tokens() {
        let book = SharedBook::default();
        let old = with_book(&book, |b| b.insert(addr(3)));
        with_book(&book, AddressBook::clear);
        assert!(with_book(&book, |b| b.get(old)).is_none());
        let new = with_book(&book, |b| b.insert(addr(3)));
        assert_ne!(new, old);
        assert_eq!(with_book(&book, |b| b.len()), 1);
    }

    #[test]
    fn silent_peers_expire() {
        let book = SharedBook::default();
        let mut s = Sightings::new("huddle", Uuid::new_v4());
        let t0 = Instant::now();
        let beacon = Beacon::new("huddle", Uuid::new_v4(), "table", 45681);
        let handle = s.observe(&beacon, addr(3), t0, &book).unwrap();

        let timeout = Duration::from_secs(12);
        assert!(s.expire(t0 + Duration::from_secs(5), timeout, &book).is_empty());
        assert_eq!(s.expire(t0 + timeout, timeout, &book), vec![handle.clone()]);
        assert!(with_book(&book, |b| b.get(handle.token())).is_none());
        // Heard again: reported as new.
        assert!(s.observe(&beacon, addr(3), t0 + timeout, &book).is_some());
    }
}
