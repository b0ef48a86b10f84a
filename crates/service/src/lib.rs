//! The broker routing core.
//!
//! [`Service`] owns the four process-wide tables: the session registry, the
//! service directory, the link table, and the pending-request table. The
//! transport layer registers every handshaken peer together with the sending
//! half of its writer queue; from then on the router moves encoded frames
//! between queues and the tables mutate only on registration, close, or an
//! explicit link/lock request.
//!
//! Everything here is transport-agnostic: tests drive it with bare channels,
//! the server drives it with sockets.

pub mod error;
pub mod links;
pub mod message;
pub mod pending;
pub mod router;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};

use codec::Backend;

use self::{
    error::Fault,
    links::LinkTable,
    message::{error_frame, prompt_frame},
    pending::PendingTable,
    session::{CloseReason, Peer, RegisterError, Registration, Role},
};

pub use router::RouteOutcome;

/// Callbacks from the routing core into the embedding binary.
///
/// Lifecycle notifications default to no-ops; the credential queries back
/// the `users_table.*` / `hostnames_table.*` admin attributes and default to
/// an empty backend.
#[allow(unused_variables)]
pub trait ServiceHandler: Clone + Send + Sync + 'static {
    fn on_register(&self, address: &SocketAddr, role: Role, name: &str) {}

    fn on_close(&self, address: &SocketAddr, role: Role, name: &str) {}

    fn on_link(&self, client: &SocketAddr, service: &str) {}

    fn on_unlink(&self, client: &SocketAddr, service: &str) {}

    /// An authorized peer accepted `shutdown_manager`; the embedding server
    /// is expected to begin draining.
    fn on_shutdown(&self) {}

    async fn is_user_registered(&self, username: &str) -> bool {
        false
    }

    async fn usernames(&self) -> Vec<String> {
        Vec::new()
    }

    async fn hostnames(&self) -> Vec<String> {
        Vec::new()
    }
}

pub struct ServiceOptions<T> {
    /// Software tag advertised in the manager identity.
    pub software: String,
    /// Wire JSON backend; every outbound frame is encoded through it.
    pub backend: Backend,
    /// Optional deadline applied to every forwarded request.
    pub request_timeout: Option<Duration>,
    pub handler: T,
}

struct Inner<T> {
    software: String,
    backend: Backend,
    request_timeout: Option<Duration>,
    handler: T,
    sessions: RwLock<AHashMap<SocketAddr, Peer>>,
    directory: RwLock<AHashMap<String, SocketAddr>>,
    links: Mutex<LinkTable>,
    pending: Mutex<PendingTable>,
    draining: AtomicBool,
}

/// The shared routing core; cheap to clone.
pub struct Service<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Service<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Service<T>
where
    T: ServiceHandler,
{
    pub fn new(options: ServiceOptions<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                software: options.software,
                backend: options.backend,
                request_timeout: options.request_timeout,
                handler: options.handler,
                sessions: RwLock::new(AHashMap::with_capacity(64)),
                directory: RwLock::new(AHashMap::with_capacity(64)),
                links: Mutex::new(LinkTable::default()),
                pending: Mutex::new(PendingTable::default()),
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn handler(&self) -> &T {
        &self.inner.handler
    }

    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    /// Admit a handshaken peer into the registry.
    ///
    /// Service names are unique among ready services; a duplicate
    /// registration is refused and the newcomer must be closed.
    pub fn register(&self, registration: Registration) -> Result<(), RegisterError> {
        if self.is_draining() {
            return Err(RegisterError::Draining);
        }

        let address = registration.address;
        let role = registration.role;
        let name = registration.name.clone();

        if role == Role::Service {
            let mut directory = self.inner.directory.write();
            if directory.contains_key(&name) {
                return Err(RegisterError::DuplicateServiceName(name));
            }
            directory.insert(name.clone(), address);
        }

        self.inner
            .sessions
            .write()
            .insert(address, registration.into_peer());

        self.inner.handler.on_register(&address, role, &name);
        Ok(())
    }

    /// Remove a session and settle everything it owes.
    ///
    /// The directory, link table, and pending table are purged before any
    /// synthetic error leaves, so no later frame can route through the dead
    /// session.
    pub fn unregister(&self, address: &SocketAddr, reason: CloseReason) {
        let Some(peer) = self.inner.sessions.write().remove(address) else {
            return;
        };

        let mut gone_clients = Vec::new();
        if peer.role == Role::Service {
            self.inner.directory.write().remove(&peer.name);
            gone_clients = self.inner.links.lock().purge_service(&peer.name);
        }
        self.inner.links.lock().purge_client(address);

        let (_as_client, as_target) = self.inner.pending.lock().purge_peer(address);

        // Only the pending-table settlement distinguishes a kick from a
        // natural death; the link cascade below always reports
        // service-gone.
        let kind = match reason {
            CloseReason::Disconnected => error::ErrorKind::ServiceGone,
            CloseReason::Kicked => error::ErrorKind::PeerDisconnected,
        };

        for entry in as_target {
            let fault = Fault::new(
                kind,
                format!("service {:?} closed before replying", entry.service),
            );
            self.send_fault(&entry.client, &fault, &entry.uid);
        }

        // Clients linked to a dying service learn about it even when they
        // had nothing in flight.
        for client in gone_clients {
            let frame = json!({
                "error": false,
                "service": peer.name,
                "result": {"event": error::ErrorKind::ServiceGone.label()},
                "uid": message::NOTIFICATION_UID,
            });
            self.send_value(&client, &frame);
        }

        self.inner.handler.on_close(address, peer.role, &peer.name);
    }

    /// Force-close one session; its counterparts get *peer-disconnected*.
    pub fn kick(&self, address: &SocketAddr) -> bool {
        let known = {
            let sessions = self.inner.sessions.read();
            match sessions.get(address) {
                Some(peer) => {
                    peer.close();
                    true
                }
                None => false,
            }
        };

        if known {
            self.unregister(address, CloseReason::Kicked);
        }

        known
    }

    /// Stop accepting new work; in-flight requests may still settle.
    pub fn drain(&self) {
        self.inner.draining.store(true, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// True when no request is waiting on a reply.
    pub fn pending_settled(&self) -> bool {
        self.inner.pending.lock().is_empty()
    }

    /// Number of ready sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Ask every connection to shut its socket.
    pub fn close_all(&self) {
        for peer in self.inner.sessions.read().values() {
            peer.close();
        }
    }

    /// Expire overdue pending requests; driven by a server timer.
    pub fn sweep_deadlines(&self) {
        let expired = self.inner.pending.lock().expired(Instant::now());

        for entry in expired {
            log::warn!(
                "pending request expired: client={:?}, service={:?}, uid={:?}",
                entry.client,
                entry.service,
                entry.uid
            );

            let frame = error_frame(
                &format!(
                    "request-timeout: no reply from {:?} within the deadline",
                    entry.service
                ),
                &entry.client.to_string(),
                &entry.uid,
            );
            self.send_value(&entry.client, &frame);
        }
    }

    /// The manager's own identity object.
    pub fn manager_identity(&self) -> Value {
        json!({
            "type": "manager",
            "language": "rust",
            "os": std::env::consts::OS,
            "software": self.inner.software,
            "attributes": {
                "identity": "() -> identity",
                "link": "(service: str) -> identity",
                "unlink": "(service: str) -> bool",
                "lock": "(service: str, mode: str) -> bool",
                "unlock": "(service: str) -> bool",
                "list_services": "() -> {name: identity}",
                "cancel_request": "(uid: str) -> bool",
                "shutdown_manager": "() -> null",
                "kick": "(address: str) -> bool",
                "users_table.is_user_registered": "(username: str) -> bool",
                "users_table.usernames": "() -> [str]",
                "hostnames_table.hostnames": "() -> [str]",
            },
        })
    }

    /// Snapshot of the directory for admin and identity requests.
    pub fn list_services(&self) -> Value {
        let addresses: Vec<(String, SocketAddr)> = self
            .inner
            .directory
            .read()
            .iter()
            .map(|(name, address)| (name.clone(), *address))
            .collect();

        let sessions = self.inner.sessions.read();
        let mut snapshot = serde_json::Map::new();
        for (name, address) in addresses {
            if let Some(peer) = sessions.get(&address) {
                snapshot.insert(name, peer.identity.clone());
            }
        }

        Value::Object(snapshot)
    }

    /// The identity request sent to every connecting peer.
    pub fn identity_prompt(&self, manager_address: &SocketAddr) -> Value {
        prompt_frame("identity", &manager_address.to_string())
    }

    /// Encode a frame and queue it on a peer's writer.
    pub(crate) fn send_value(&self, address: &SocketAddr, value: &Value) {
        let bytes = match codec::encode_frame(&self.inner.backend, value) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("frame encode failed: addr={:?}, err={}", address, e);
                return;
            }
        };

        let sessions = self.inner.sessions.read();
        if let Some(peer) = sessions.get(address) {
            if !peer.send(bytes) {
                log::warn!("outbound queue closed: addr={:?}", address);
            }
        }
    }

    /// Queue an error frame on a peer's writer; the transport layer uses
    /// this for faults it detects below the routing layer (bad framing,
    /// invalid terminal lines).
    pub fn send_fault(&self, address: &SocketAddr, fault: &Fault, uid: &str) {
        let frame = error_frame(&fault.message(), &address.to_string(), uid);
        self.send_value(address, &frame);
    }

    pub(crate) fn inner(&self) -> &Inner<T> {
        &self.inner
    }
}

impl<T> Inner<T> {
    pub(crate) fn sessions(&self) -> &RwLock<AHashMap<SocketAddr, Peer>> {
        &self.sessions
    }

    pub(crate) fn directory(&self) -> &RwLock<AHashMap<String, SocketAddr>> {
        &self.directory
    }

    pub(crate) fn links(&self) -> &Mutex<LinkTable> {
        &self.links
    }

    pub(crate) fn pending(&self) -> &Mutex<PendingTable> {
        &self.pending
    }

    pub(crate) fn handler(&self) -> &T {
        &self.handler
    }

    pub(crate) fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
}
