//! In-flight request correlation.
//!
//! A forwarded request leaves a pending entry keyed on the originating
//! client address plus the client-chosen uid. The matching reply (or a
//! synthetic error when a session dies first) settles the entry. Keys only
//! need to be unique within one client session; reusing a uid that is still
//! in flight is refused so the first caller's reply can never be orphaned.

use std::net::SocketAddr;
use std::time::Instant;

use ahash::AHashMap;

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub client: SocketAddr,
    /// Name of the addressed service, kept for error messages.
    pub service: String,
    /// Session address of the service the request was forwarded to.
    pub target: SocketAddr,
    pub uid: String,
    pub enqueued: Instant,
    pub deadline: Option<Instant>,
}

#[derive(Default)]
pub struct PendingTable {
    entries: AHashMap<(SocketAddr, String), PendingRequest>,
}

impl PendingTable {
    /// Record a freshly forwarded request. Fails when the uid is already in
    /// flight for this client.
    pub fn insert(&mut self, request: PendingRequest) -> Result<(), PendingRequest> {
        let key = (request.client, request.uid.clone());
        if self.entries.contains_key(&key) {
            return Err(request);
        }

        self.entries.insert(key, request);
        Ok(())
    }

    /// Settle by correlation key; used for reply routing and cancellation.
    pub fn settle(&mut self, client: &SocketAddr, uid: &str) -> Option<PendingRequest> {
        self.entries.remove(&(*client, uid.to_string()))
    }

    /// Drop every entry touching a closing session.
    ///
    /// Returns the entries the session originated and the entries that were
    /// waiting on it as the target, so the caller can notify whichever side
    /// is still alive.
    pub fn purge_peer(
        &mut self,
        address: &SocketAddr,
    ) -> (Vec<PendingRequest>, Vec<PendingRequest>) {
        let mut as_client = Vec::new();
        let mut as_target = Vec::new();

        self.entries.retain(|_, entry| {
            if entry.client == *address {
                as_client.push(entry.clone());
                false
            } else if entry.target == *address {
                as_target.push(entry.clone());
                false
            } else {
                true
            }
        });

        (as_client, as_target)
    }

    /// Remove entries whose deadline has passed.
    pub fn expired(&mut self, now: Instant) -> Vec<PendingRequest> {
        let mut expired = Vec::new();

        self.entries.retain(|_, entry| match entry.deadline {
            Some(deadline) if deadline <= now => {
                expired.push(entry.clone());
                false
            }
            _ => true,
        });

        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn request(client: SocketAddr, target: SocketAddr, uid: &str) -> PendingRequest {
        PendingRequest {
            client,
            service: "S".to_string(),
            target,
            uid: uid.to_string(),
            enqueued: Instant::now(),
            deadline: None,
        }
    }

    #[test]
    fn settles_by_client_and_uid() {
        let mut table = PendingTable::default();
        let (client, target) = (addr(1), addr(9));

        table.insert(request(client, target, "u1")).unwrap();
        table.insert(request(client, target, "u2")).unwrap();

        assert!(table.settle(&client, "u1").is_some());
        assert!(table.settle(&client, "u1").is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn same_uid_from_different_clients_do_not_collide() {
        let mut table = PendingTable::default();
        let target = addr(9);

        table.insert(request(addr(1), target, "u")).unwrap();
        table.insert(request(addr(2), target, "u")).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn duplicate_in_flight_uid_is_refused() {
        let mut table = PendingTable::default();
        let (client, target) = (addr(1), addr(9));

        table.insert(request(client, target, "u")).unwrap();
        assert!(table.insert(request(client, target, "u")).is_err());

        // Settling frees the uid for reuse.
        table.settle(&client, "u").unwrap();
        table.insert(request(client, target, "u")).unwrap();
    }

    #[test]
    fn purge_separates_both_directions() {
        let mut table = PendingTable::default();
        let (a, b, service) = (addr(1), addr(2), addr(9));

        table.insert(request(a, service, "u1")).unwrap();
        table.insert(request(b, service, "u2")).unwrap();

        // The service dies: both entries were waiting on it.
        let (as_client, as_target) = table.purge_peer(&service);
        assert!(as_client.is_empty());
        assert_eq!(as_target.len(), 2);
        assert!(table.is_empty());

        // A client dies: only its own entry goes.
        table.insert(request(a, service, "u3")).unwrap();
        table.insert(request(b, service, "u4")).unwrap();
        let (as_client, as_target) = table.purge_peer(&a);
        assert_eq!(as_client.len(), 1);
        assert!(as_target.is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn deadline_sweep() {
        let mut table = PendingTable::default();
        let (client, target) = (addr(1), addr(9));

        let now = Instant::now();
        let mut timed = request(client, target, "u1");
        timed.deadline = Some(now);
        table.insert(timed).unwrap();
        table.insert(request(client, target, "u2")).unwrap();

        let expired = table.expired(now + Duration::from_millis(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].uid, "u1");
        assert_eq!(table.len(), 1);
    }
}
