use std::net::SocketAddr;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The type of information passed in the statistics channel.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(usize),
    SendBytes(usize),
    ReceivedFrames(usize),
    SendFrames(usize),
    ErrorFrames(usize),
}

/// Per-session counters.
#[derive(Default)]
pub struct Counts {
    pub received_bytes: AtomicUsize,
    pub send_bytes: AtomicUsize,
    pub received_frames: AtomicUsize,
    pub send_frames: AtomicUsize,
    pub error_frames: AtomicUsize,
}

impl Counts {
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.fetch_add(*v, Ordering::Relaxed),
            Stats::SendBytes(v) => self.send_bytes.fetch_add(*v, Ordering::Relaxed),
            Stats::ReceivedFrames(v) => self.received_frames.fetch_add(*v, Ordering::Relaxed),
            Stats::SendFrames(v) => self.send_frames.fetch_add(*v, Ordering::Relaxed),
            Stats::ErrorFrames(v) => self.error_frames.fetch_add(*v, Ordering::Relaxed),
        };
    }
}

/// Session statistics table.
#[derive(Clone)]
pub struct Statistics {
    table: Arc<RwLock<AHashMap<SocketAddr, Arc<Counts>>>>,
    total: Arc<Counts>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            table: Arc::new(RwLock::new(AHashMap::with_capacity(64))),
            total: Arc::new(Counts::default()),
        }
    }
}

impl Statistics {
    /// Add a session to the watch list and get its reporter.
    pub fn register(&self, address: SocketAddr) -> Reporter {
        let counts = Arc::new(Counts::default());
        self.table.write().insert(address, counts.clone());

        Reporter {
            session: counts,
            total: self.total.clone(),
        }
    }

    /// Remove a session from the watch list.
    pub fn unregister(&self, address: &SocketAddr) {
        self.table.write().remove(address);
    }

    pub fn total_received_frames(&self) -> usize {
        self.total.received_frames.load(Ordering::Relaxed)
    }

    pub fn total_send_frames(&self) -> usize {
        self.total.send_frames.load(Ordering::Relaxed)
    }
}

/// Held by each connection task; updates its own session counters and the
/// process totals in one call.
#[derive(Clone)]
pub struct Reporter {
    session: Arc<Counts>,
    total: Arc<Counts>,
}

impl Reporter {
    pub fn send(&self, reports: &[Stats]) {
        for report in reports {
            self.session.add(report);
            self.total.add(report);
        }
    }
}
