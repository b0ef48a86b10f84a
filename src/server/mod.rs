//! Manager lifecycle: bind, accept, drain, stop.

pub mod connection;
pub mod terminal;
pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};

use codec::Backend;
use service::{Service, ServiceOptions};

use crate::SOFTWARE;
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::observer::Observer;
use crate::statistics::Statistics;

use self::connection::ConnectionOptions;

/// A bound manager, not yet serving.
///
/// Splitting construction from [`Server::run`] lets callers (tests most of
/// all) bind port 0 and read the real address back before peers connect.
pub struct Server {
    config: Arc<Config>,
    service: Service<Observer>,
    statistics: Statistics,
    store: CredentialStore,
    listener: TcpListener,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
    shutdown: Arc<Notify>,
}

impl Server {
    /// Bind the listener, open the credential store, and build the TLS
    /// context. A failure here aborts startup.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let store = CredentialStore::open(&config.database.path).await?;
        let statistics = Statistics::default();
        let shutdown = Arc::new(Notify::new());

        let observer = Observer::new(config.clone(), store.clone(), shutdown.clone());

        let service = Service::new(ServiceOptions {
            software: SOFTWARE.to_string(),
            backend: Backend::from_env(),
            request_timeout: config.limits.request_timeout.map(Duration::from_secs),
            handler: observer,
        });

        let acceptor = tls::acceptor(&config)?;
        let listener = TcpListener::bind(config.listen()).await?;

        log::info!(
            "manager listening: listen={}, tls={}, auth={:?}",
            listener.local_addr()?,
            acceptor.is_some(),
            config.auth.mode,
        );

        Ok(Self {
            config,
            service,
            statistics,
            store,
            listener,
            acceptor,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn service(&self) -> &Service<Observer> {
        &self.service
    }

    /// Handle used to trigger a shutdown from outside (tests, embedding).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Serve until a signal or an admin `shutdown_manager`, then drain.
    pub async fn run(self) -> Result<()> {
        let Server {
            config,
            service,
            statistics,
            store,
            listener,
            acceptor,
            shutdown,
        } = self;

        let local_addr = listener.local_addr()?;

        let accept = {
            let options = ConnectionOptions {
                config: config.clone(),
                service: service.clone(),
                statistics: statistics.clone(),
                store: store.clone(),
                acceptor: acceptor.clone(),
                local_addr,
            };

            tokio::spawn(async move {
                while let Ok((socket, address)) = listener.accept().await {
                    log::info!(
                        "tcp socket accept: addr={:?}, interface={:?}",
                        address,
                        local_addr,
                    );

                    tokio::spawn(connection::handle(options.clone(), socket, address));
                }
            })
        };

        let sweeper = {
            let service = service.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    service.sweep_deadlines();
                }
            })
        };

        wait_for_shutdown(&shutdown).await;
        log::info!("manager draining: interface={:?}", local_addr);

        // Stop accepting, refuse new requests, let in-flight work settle.
        accept.abort();
        service.drain();

        let grace = Instant::now() + Duration::from_secs(config.limits.shutdown_grace);
        while !service.pending_settled() && Instant::now() < grace {
            sleep(Duration::from_millis(100)).await;
        }

        service.close_all();
        sweeper.abort();

        // Give the connection tasks a moment to flush their queues and
        // deregister.
        let closed = Instant::now() + Duration::from_secs(3);
        while service.session_count() > 0 && Instant::now() < closed {
            sleep(Duration::from_millis(50)).await;
        }

        log::info!("manager stopped: interface={:?}", local_addr);
        Ok(())
    }
}

/// Block until SIGINT/SIGTERM or an internal shutdown request.
async fn wait_for_shutdown(shutdown: &Notify) {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    log::error!("sigterm handler failed: err={}", e);
                    shutdown.notified().await;
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("received SIGINT"),
            _ = sigterm.recv() => log::info!("received SIGTERM"),
            _ = shutdown.notified() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("received ctrl-c"),
            _ = shutdown.notified() => {},
        }
    }
}
