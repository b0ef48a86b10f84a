//! The broker error taxonomy.
//!
//! Every fault surfaced to a peer travels as an error frame whose `message`
//! starts with one of these labels. Fatal kinds end the offending session;
//! the rest are answered and the session survives.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed JSON, wrong frame shape, or an oversized frame.
    Protocol,
    /// The handshake did not complete cleanly.
    Identity,
    /// Credentials rejected.
    Auth,
    /// Routing target is not a registered service.
    NoSuchService,
    /// Linking would exceed the service's client cap.
    MaxClientsReached,
    /// An exclusive lock held by another client refused the operation.
    LockedExclusive,
    /// The client has no active link to the target service.
    NotLinked,
    /// A non-admin peer attempted a privileged manager method.
    PermissionDenied,
    /// The manager is shutting down and refuses new requests.
    Draining,
    /// The request reused a uid that is still in flight.
    DuplicateUid,
    /// The request used the reserved notification uid.
    ReservedUid,
    /// The target service vanished while the request was in flight.
    ServiceGone,
    /// The counterpart session was forcibly closed.
    PeerDisconnected,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Protocol => "protocol-error",
            Self::Identity => "identity-error",
            Self::Auth => "auth-error",
            Self::NoSuchService => "no-such-service",
            Self::MaxClientsReached => "max-clients-reached",
            Self::LockedExclusive => "locked-exclusive",
            Self::NotLinked => "not-linked",
            Self::PermissionDenied => "permission-denied",
            Self::Draining => "draining",
            Self::DuplicateUid => "duplicate-uid",
            Self::ReservedUid => "reserved-uid",
            Self::ServiceGone => "service-gone",
            Self::PeerDisconnected => "peer-disconnected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A classified fault plus its human-readable detail.
#[derive(Debug, Clone)]
pub struct Fault {
    pub kind: ErrorKind,
    pub detail: String,
}

impl Fault {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// The `message` field of the resulting error frame.
    pub fn message(&self) -> String {
        if self.detail.is_empty() {
            self.kind.label().to_string()
        } else {
            format!("{}: {}", self.kind.label(), self.detail)
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for Fault {}
