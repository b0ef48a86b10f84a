use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Notify;

use service::{ServiceHandler, session::Role};

use crate::{config::Config, credentials::CredentialStore};

/// The routing core's view of the server: lifecycle logging, the shutdown
/// signal, and the credential queries behind the `users_table.*` /
/// `hostnames_table.*` admin attributes.
#[derive(Clone)]
pub struct Observer {
    config: Arc<Config>,
    store: CredentialStore,
    shutdown: Arc<Notify>,
}

impl Observer {
    pub fn new(config: Arc<Config>, store: CredentialStore, shutdown: Arc<Notify>) -> Self {
        Self {
            config,
            store,
            shutdown,
        }
    }
}

impl ServiceHandler for Observer {
    fn on_register(&self, address: &SocketAddr, role: Role, name: &str) {
        log::info!("session ready: addr={:?}, role={}, name={:?}", address, role, name);
    }

    fn on_close(&self, address: &SocketAddr, role: Role, name: &str) {
        log::info!("session closed: addr={:?}, role={}, name={:?}", address, role, name);
    }

    fn on_link(&self, client: &SocketAddr, service: &str) {
        log::info!("link: client={:?}, service={:?}", client, service);
    }

    fn on_unlink(&self, client: &SocketAddr, service: &str) {
        log::info!("unlink: client={:?}, service={:?}", client, service);
    }

    fn on_shutdown(&self) {
        self.shutdown.notify_one();
    }

    async fn is_user_registered(&self, username: &str) -> bool {
        self.store
            .is_user_registered(username)
            .await
            .unwrap_or_else(|e| {
                log::error!("credential store query failed: err={}", e);
                false
            })
    }

    async fn usernames(&self) -> Vec<String> {
        self.store.usernames().await.unwrap_or_else(|e| {
            log::error!("credential store query failed: err={}", e);
            Vec::new()
        })
    }

    async fn hostnames(&self) -> Vec<String> {
        let mut hostnames = self.store.hostnames().await.unwrap_or_else(|e| {
            log::error!("credential store query failed: err={}", e);
            Vec::new()
        });

        for hostname in &self.config.auth.hostnames {
            if !hostnames.contains(hostname) {
                hostnames.push(hostname.clone());
            }
        }

        hostnames
    }
}
