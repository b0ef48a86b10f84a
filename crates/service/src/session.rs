//! Ready-peer bookkeeping.
//!
//! A peer enters the registry once its handshake completes; everything the
//! router needs afterwards lives here. The outbound half of every session is
//! an unbounded channel drained by the connection's writer task, which is
//! what gives the per-pair FIFO guarantee: one queue, one drainer.

use std::net::SocketAddr;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Service,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Service => "service",
        })
    }
}

/// Items travelling to a session's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Bytes),
    Close,
}

/// One registered session.
pub struct Peer {
    pub address: SocketAddr,
    pub role: Role,
    pub name: String,
    pub identity: Value,
    /// Client cap for services; -1 disables the limit.
    pub max_clients: i64,
    pub admin: bool,
    /// Terminal-mode clients skip the link requirement and may use the
    /// shortcut request grammar.
    pub terminal: bool,
    sender: UnboundedSender<Outbound>,
}

impl Peer {
    /// Queue an encoded frame; false when the writer is gone.
    pub fn send(&self, bytes: Bytes) -> bool {
        self.sender.send(Outbound::Frame(bytes)).is_ok()
    }

    /// Ask the connection task to shut the socket.
    pub fn close(&self) {
        let _ = self.sender.send(Outbound::Close);
    }
}

/// Everything the connection layer knows about a peer when it registers.
pub struct Registration {
    pub address: SocketAddr,
    pub role: Role,
    pub name: String,
    pub identity: Value,
    pub max_clients: i64,
    pub admin: bool,
    pub terminal: bool,
    pub sender: UnboundedSender<Outbound>,
}

impl Registration {
    pub fn into_peer(self) -> Peer {
        Peer {
            address: self.address,
            role: self.role,
            name: self.name,
            identity: self.identity,
            max_clients: self.max_clients,
            admin: self.admin,
            terminal: self.terminal,
            sender: self.sender,
        }
    }
}

#[derive(Debug)]
pub enum RegisterError {
    /// A ready service already owns the advertised name.
    DuplicateServiceName(String),
    /// The manager is draining and admits no new sessions.
    Draining,
}

impl std::error::Error for RegisterError {}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateServiceName(name) => {
                write!(f, "a service named {:?} is already registered", name)
            }
            Self::Draining => f.write_str("the manager is shutting down"),
        }
    }
}

/// Why a session left the registry; decides the synthetic error its
/// counterparts receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Disconnected,
    Kicked,
}
