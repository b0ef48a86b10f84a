pub mod cli;
pub mod config;
pub mod credentials;
pub mod logger;
pub mod observer;
pub mod pki;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use self::config::Config;

pub use self::server::Server;

#[rustfmt::skip]
pub(crate) static SOFTWARE: &str = concat!(
    "broker-server.",
    env!("CARGO_PKG_VERSION")
);

/// Bind the manager and serve until a signal or an admin shutdown request.
///
/// Integration tests build a [`Server`] directly so they can read the bound
/// address back; this wrapper is what the binary runs.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let server = Server::new(config).await?;
    server.run().await
}
