//! The client-to-service link table.
//!
//! A link is the permission a client holds to send requests to one service.
//! Links can carry a lock: an exclusive lock demands sole occupancy of the
//! service, a shared lock only forbids a later exclusive one. All operations
//! run under the owning mutex, so racing requests serialize in arrival order
//! and the later loser gets a precise refusal.

use std::net::SocketAddr;

use ahash::AHashMap;

use crate::error::{ErrorKind, Fault};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    None,
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "shared" => Some(Self::Shared),
            "exclusive" => Some(Self::Exclusive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LinkEntry {
    client: SocketAddr,
    mode: LockMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRefused {
    MaxClientsReached { cap: i64 },
    LockedExclusive,
    NotLinked,
}

impl LinkRefused {
    pub fn into_fault(self, service: &str) -> Fault {
        match self {
            Self::MaxClientsReached { cap } => Fault::new(
                ErrorKind::MaxClientsReached,
                format!("service {:?} accepts at most {} linked clients", service, cap),
            ),
            Self::LockedExclusive => Fault::new(
                ErrorKind::LockedExclusive,
                format!("service {:?} is locked by another client", service),
            ),
            Self::NotLinked => Fault::new(
                ErrorKind::NotLinked,
                format!("no active link to service {:?}", service),
            ),
        }
    }
}

#[derive(Default)]
pub struct LinkTable {
    entries: AHashMap<String, Vec<LinkEntry>>,
}

impl LinkTable {
    /// Link a client to a service. Idempotent for an existing link.
    ///
    /// `cap` is the service's advertised max_clients; -1 disables the cap.
    pub fn link(
        &mut self,
        client: SocketAddr,
        service: &str,
        cap: i64,
    ) -> Result<(), LinkRefused> {
        let entries = self.entries.entry(service.to_string()).or_default();

        if entries.iter().any(|entry| entry.client == client) {
            return Ok(());
        }

        if entries.iter().any(|entry| entry.mode == LockMode::Exclusive) {
            return Err(LinkRefused::LockedExclusive);
        }

        if cap >= 0 && entries.len() as i64 >= cap {
            return Err(LinkRefused::MaxClientsReached { cap });
        }

        entries.push(LinkEntry {
            client,
            mode: LockMode::None,
        });

        Ok(())
    }

    /// Drop a client's link, releasing any lock it held. Idempotent.
    pub fn unlink(&mut self, client: &SocketAddr, service: &str) {
        if let Some(entries) = self.entries.get_mut(service) {
            entries.retain(|entry| entry.client != *client);
            if entries.is_empty() {
                self.entries.remove(service);
            }
        }
    }

    /// Place or change a lock on an existing link.
    ///
    /// Exclusive requires being the only linked client and shared requires
    /// that no exclusive lock exists. Re-requesting a held mode succeeds.
    pub fn lock(
        &mut self,
        client: &SocketAddr,
        service: &str,
        mode: LockMode,
    ) -> Result<(), LinkRefused> {
        let Some(entries) = self.entries.get_mut(service) else {
            return Err(LinkRefused::NotLinked);
        };

        if !entries.iter().any(|entry| entry.client == *client) {
            return Err(LinkRefused::NotLinked);
        }

        match mode {
            LockMode::None => {}
            LockMode::Exclusive => {
                if entries.len() > 1 {
                    return Err(LinkRefused::LockedExclusive);
                }
            }
            LockMode::Shared => {
                let blocked = entries
                    .iter()
                    .any(|entry| entry.client != *client && entry.mode == LockMode::Exclusive);
                if blocked {
                    return Err(LinkRefused::LockedExclusive);
                }
            }
        }

        for entry in entries.iter_mut() {
            if entry.client == *client {
                entry.mode = mode;
            }
        }

        Ok(())
    }

    /// Release a lock without dropping the link. Idempotent.
    pub fn unlock(&mut self, client: &SocketAddr, service: &str) {
        let _ = self.lock(client, service, LockMode::None);
    }

    pub fn is_linked(&self, client: &SocketAddr, service: &str) -> bool {
        self.entries
            .get(service)
            .map(|entries| entries.iter().any(|entry| entry.client == *client))
            .unwrap_or(false)
    }

    /// Linked clients in link order.
    pub fn linked_clients(&self, service: &str) -> Vec<SocketAddr> {
        self.entries
            .get(service)
            .map(|entries| entries.iter().map(|entry| entry.client).collect())
            .unwrap_or_default()
    }

    /// Remove every link a closing client holds; returns the services that
    /// lost a link.
    pub fn purge_client(&mut self, client: &SocketAddr) -> Vec<String> {
        let mut affected = Vec::new();

        self.entries.retain(|service, entries| {
            let before = entries.len();
            entries.retain(|entry| entry.client != *client);
            if entries.len() != before {
                affected.push(service.clone());
            }
            !entries.is_empty()
        });

        affected
    }

    /// Remove a dying service's links; returns the clients that were linked.
    pub fn purge_service(&mut self, service: &str) -> Vec<SocketAddr> {
        self.entries
            .remove(service)
            .map(|entries| entries.into_iter().map(|entry| entry.client).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn cap_is_enforced_and_released() {
        let mut table = LinkTable::default();
        let (a, b) = (addr(1), addr(2));

        table.link(a, "S", 1).unwrap();
        assert_eq!(
            table.link(b, "S", 1),
            Err(LinkRefused::MaxClientsReached { cap: 1 })
        );

        table.purge_client(&a);
        table.link(b, "S", 1).unwrap();
    }

    #[test]
    fn unbounded_cap() {
        let mut table = LinkTable::default();
        for port in 1..100 {
            table.link(addr(port), "S", -1).unwrap();
        }
        assert_eq!(table.linked_clients("S").len(), 99);
    }

    #[test]
    fn link_then_unlink_restores_table() {
        let mut table = LinkTable::default();
        let a = addr(1);

        table.link(a, "S", -1).unwrap();
        table.unlink(&a, "S");

        assert!(!table.is_linked(&a, "S"));
        assert!(table.linked_clients("S").is_empty());
    }

    #[test]
    fn exclusive_lock_requires_sole_occupancy() {
        let mut table = LinkTable::default();
        let (a, b) = (addr(1), addr(2));

        table.link(a, "S", -1).unwrap();
        table.link(b, "S", -1).unwrap();
        assert_eq!(
            table.lock(&a, "S", LockMode::Exclusive),
            Err(LinkRefused::LockedExclusive)
        );

        table.unlink(&b, "S");
        table.lock(&a, "S", LockMode::Exclusive).unwrap();

        // And a lock bars later links entirely.
        assert_eq!(table.link(b, "S", -1), Err(LinkRefused::LockedExclusive));
    }

    #[test]
    fn shared_lock_is_idempotent_and_blocks_exclusive() {
        let mut table = LinkTable::default();
        let (a, b) = (addr(1), addr(2));

        table.link(a, "S", -1).unwrap();
        table.link(b, "S", -1).unwrap();

        table.lock(&a, "S", LockMode::Shared).unwrap();
        table.lock(&a, "S", LockMode::Shared).unwrap();
        table.lock(&b, "S", LockMode::Shared).unwrap();

        assert_eq!(
            table.lock(&b, "S", LockMode::Exclusive),
            Err(LinkRefused::LockedExclusive)
        );
    }

    #[test]
    fn locks_die_with_the_link() {
        let mut table = LinkTable::default();
        let (a, b) = (addr(1), addr(2));

        table.link(a, "S", -1).unwrap();
        table.lock(&a, "S", LockMode::Exclusive).unwrap();

        table.unlink(&a, "S");
        table.link(b, "S", -1).unwrap();
        table.lock(&b, "S", LockMode::Exclusive).unwrap();
    }

    #[test]
    fn lock_on_missing_link_is_refused() {
        let mut table = LinkTable::default();
        assert_eq!(
            table.lock(&addr(1), "S", LockMode::Shared),
            Err(LinkRefused::NotLinked)
        );
    }

    #[test]
    fn service_death_reports_linked_clients() {
        let mut table = LinkTable::default();
        let (a, b) = (addr(1), addr(2));

        table.link(a, "S", -1).unwrap();
        table.link(b, "S", -1).unwrap();

        let clients = table.purge_service("S");
        assert_eq!(clients, vec![a, b]);
        assert!(table.linked_clients("S").is_empty());
    }
}
