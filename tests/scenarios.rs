//! End-to-end scenarios over real sockets.
//!
//! Every test binds a manager on an ephemeral port, connects peers through
//! the SDK, and watches the frames that come back.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use broker_server::Server;
use broker_server::config::{AuthMode, Config};
use broker_server::credentials::CredentialStore;

use client::{ClientBuilder, HandlerResult, ServiceBuilder, TlsOptions};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "broker-scenario-{}-{}",
        hex_suffix(),
        name
    ))
}

fn hex_suffix() -> String {
    format!("{:08x}", rand::random::<u32>())
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".parse().unwrap();
    config.server.port = 0;
    config.tls.disabled = true;
    config.database.path = temp_path("db3");
    config.limits.handshake_timeout = 5;
    config.limits.shutdown_grace = 2;
    config
}

async fn start_manager(config: Config) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let server = Server::new(Arc::new(config)).await?;
    let address = server.local_addr()?;
    Ok((address, tokio::spawn(server.run())))
}

fn echo_service() -> ServiceBuilder {
    ServiceBuilder::new("Echo").with_attribute("echo", "(*args, **kwargs)", |args, kwargs| {
        HandlerResult::Reply(json!([args, kwargs]))
    })
}

#[tokio::test]
async fn echo_round_trip() -> Result<()> {
    let (address, _server) = start_manager(test_config()).await?;
    let address = address.to_string();

    let _echo = echo_service().serve(&address).await?;
    let client = ClientBuilder::new("tester").connect(&address).await?;

    client.link("Echo").await?;
    let result = client
        .request("Echo", "echo", vec![json!("hello")], Map::new())
        .await?;

    assert_eq!(result, json!([["hello"], {}]));
    Ok(())
}

#[tokio::test]
async fn unknown_service_reports_its_name() -> Result<()> {
    let (address, _server) = start_manager(test_config()).await?;

    let client = ClientBuilder::new("tester")
        .connect(&address.to_string())
        .await?;

    let error = client
        .request("Nope", "anything", Vec::new(), Map::new())
        .await
        .unwrap_err();

    assert!(error.to_string().contains("Nope"));
    Ok(())
}

#[tokio::test]
async fn max_clients_slot_frees_on_disconnect() -> Result<()> {
    let (address, _server) = start_manager(test_config()).await?;
    let address = address.to_string();

    let _solo = ServiceBuilder::new("Solo")
        .with_max_clients(1)
        .with_attribute("ping", "()", |_, _| HandlerResult::Reply(json!("pong")))
        .serve(&address)
        .await?;

    let first = ClientBuilder::new("first").connect(&address).await?;
    let second = ClientBuilder::new("second").connect(&address).await?;

    first.link("Solo").await?;

    let refused = second.link("Solo").await.unwrap_err();
    assert!(refused.to_string().starts_with("max-clients-reached"));

    // The slot opens once the first client disconnects.
    first.close();

    let mut linked = false;
    for _ in 0..50 {
        if second.link("Solo").await.is_ok() {
            linked = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    assert!(linked, "the freed slot was never granted");
    Ok(())
}

#[tokio::test]
async fn notifications_fan_out_exactly_once() -> Result<()> {
    let (address, _server) = start_manager(test_config()).await?;
    let address = address.to_string();

    let ticker = ServiceBuilder::new("Ticker").serve(&address).await?;

    let linked_a = ClientBuilder::new("a").connect(&address).await?;
    let linked_b = ClientBuilder::new("b").connect(&address).await?;
    let bystander = ClientBuilder::new("c").connect(&address).await?;

    linked_a.link("Ticker").await?;
    linked_b.link("Ticker").await?;

    let mut stream_a = linked_a.notifications();
    let mut stream_b = linked_b.notifications();
    let mut stream_c = bystander.notifications();

    ticker.notify(json!([[1], {"t": "a"}])).await?;

    let frame_a = timeout(Duration::from_secs(5), stream_a.recv()).await??;
    let frame_b = timeout(Duration::from_secs(5), stream_b.recv()).await??;

    assert_eq!(frame_a, frame_b);
    assert_eq!(frame_a["service"], "Ticker");
    assert_eq!(frame_a["uid"], "notification");
    assert_eq!(frame_a["result"], json!([[1], {"t": "a"}]));

    // Exactly once for the linked, nothing for the unlinked.
    assert!(timeout(Duration::from_millis(300), stream_a.recv()).await.is_err());
    assert!(timeout(Duration::from_millis(300), stream_c.recv()).await.is_err());
    Ok(())
}

#[tokio::test]
async fn service_death_settles_in_flight_requests() -> Result<()> {
    let (address, _server) = start_manager(test_config()).await?;
    let address = address.to_string();

    // A service that receives requests and never answers them.
    let slow = ServiceBuilder::new("Slow")
        .with_attribute("wait", "()", |_, _| HandlerResult::NoReply)
        .serve(&address)
        .await?;

    let client = Arc::new(ClientBuilder::new("tester").connect(&address).await?);
    client.link("Slow").await?;

    let waiting = {
        let client = client.clone();
        tokio::spawn(async move { client.request("Slow", "wait", Vec::new(), Map::new()).await })
    };

    sleep(Duration::from_millis(300)).await;
    slow.close();

    let error = timeout(Duration::from_secs(5), waiting).await??.unwrap_err();
    assert!(error.to_string().starts_with("service-gone"));
    Ok(())
}

#[tokio::test]
async fn graceful_shutdown_drains_and_exits() -> Result<()> {
    let mut config = test_config();
    config.auth.mode = AuthMode::Login;

    let store = CredentialStore::open(&config.database.path).await?;
    store.add_user("root", "rootpw", true).await?;
    store.add_user("peon", "peonpw", false).await?;

    let (address, server) = start_manager(config).await?;
    let address = address.to_string();

    let _slow = ServiceBuilder::new("Slow")
        .with_credentials("peon", "peonpw")
        .with_attribute("wait", "()", |_, _| HandlerResult::NoReply)
        .serve(&address)
        .await?;

    let plain = Arc::new(
        ClientBuilder::new("plain")
            .with_credentials("peon", "peonpw")
            .connect(&address)
            .await?,
    );
    let admin = ClientBuilder::new("admin")
        .with_credentials("root", "rootpw")
        .connect(&address)
        .await?;

    plain.link("Slow").await?;

    // Leave one request in flight, then ask for the shutdown.
    let waiting = {
        let plain = plain.clone();
        tokio::spawn(async move { plain.request("Slow", "wait", Vec::new(), Map::new()).await })
    };
    sleep(Duration::from_millis(200)).await;

    let denied = plain
        .request("Manager", "shutdown_manager", Vec::new(), Map::new())
        .await
        .unwrap_err();
    assert!(denied.to_string().starts_with("permission-denied"));

    admin
        .request("Manager", "shutdown_manager", Vec::new(), Map::new())
        .await?;

    // Give the server a beat to flip into draining.
    sleep(Duration::from_millis(300)).await;

    // Draining: new requests are refused while the grace period runs.
    let refused = plain
        .request("Slow", "wait2", Vec::new(), Map::new())
        .await
        .unwrap_err();
    assert!(refused.to_string().starts_with("draining"));

    // The manager closes every socket and exits; the in-flight request can
    // no longer settle and surfaces as a closed connection.
    assert!(timeout(Duration::from_secs(10), waiting).await??.is_err());
    timeout(Duration::from_secs(10), server).await???;
    Ok(())
}

#[tokio::test]
async fn login_rejects_unknown_credentials() -> Result<()> {
    let mut config = test_config();
    config.auth.mode = AuthMode::Login;

    let store = CredentialStore::open(&config.database.path).await?;
    store.add_user("root", "rootpw", true).await?;

    let (address, _server) = start_manager(config).await?;

    let refused = ClientBuilder::new("intruder")
        .with_credentials("root", "wrong")
        .connect(&address.to_string())
        .await;

    assert!(refused.is_err());
    Ok(())
}

#[tokio::test]
async fn hostname_auth_gates_connections() -> Result<()> {
    let mut config = test_config();
    config.auth.mode = AuthMode::Hostname;
    config.auth.hostnames = vec!["localhost".to_string()];

    let (address, _server) = start_manager(config).await?;
    let client = ClientBuilder::new("local")
        .connect(&address.to_string())
        .await?;
    assert_eq!(client.manager_identity().await?["type"], "manager");

    // An empty allow-list refuses everyone, but only after the identity
    // exchange has completed.
    let mut config = test_config();
    config.auth.mode = AuthMode::Hostname;

    let (address, _server) = start_manager(config).await?;
    let refused = ClientBuilder::new("stranger")
        .connect(&address.to_string())
        .await
        .unwrap_err();
    assert!(refused.to_string().starts_with("auth-error"));
    Ok(())
}

#[tokio::test]
async fn certificate_auth_checks_the_fingerprint() -> Result<()> {
    use broker_server::pki;

    let client_cert = temp_path("client-cert.pem");
    let client_key = temp_path("client-key.pem");
    pki::generate_certificate(&client_cert, &client_key, "trusted-peer", None)?;
    let fingerprint = pki::fingerprint(&pki::load_certificates(&client_cert)?[0]);

    let mut config = test_config();
    config.tls.disabled = false;
    config.tls.cert_file = temp_path("server-cert.pem");
    config.tls.key_file = temp_path("server-key.pem");
    config.auth.mode = AuthMode::Certificate;
    config.auth.certificates = vec![fingerprint];

    let (address, _server) = start_manager(config).await?;
    let address = address.to_string();

    let trusted = TlsOptions {
        insecure: true,
        identity: Some((client_cert, client_key)),
        ..Default::default()
    };
    let client = ClientBuilder::new("trusted")
        .with_tls(trusted)
        .connect(&address)
        .await?;
    assert_eq!(client.manager_identity().await?["type"], "manager");

    // A peer presenting a certificate outside the allow-list is refused
    // after the identity exchange.
    let other_cert = temp_path("other-cert.pem");
    let other_key = temp_path("other-key.pem");
    pki::generate_certificate(&other_cert, &other_key, "untrusted-peer", None)?;

    let untrusted = TlsOptions {
        insecure: true,
        identity: Some((other_cert, other_key)),
        ..Default::default()
    };
    let refused = ClientBuilder::new("untrusted")
        .with_tls(untrusted)
        .connect(&address)
        .await
        .unwrap_err();
    assert!(refused.to_string().starts_with("auth-error"));
    Ok(())
}

#[tokio::test]
async fn tls_round_trip_with_generated_certificate() -> Result<()> {
    let mut config = test_config();
    config.tls.disabled = false;
    config.tls.cert_file = temp_path("cert.pem");
    config.tls.key_file = temp_path("key.pem");

    let (address, _server) = start_manager(config).await?;
    let address = address.to_string();

    let tls = TlsOptions {
        insecure: true,
        ..Default::default()
    };

    let _echo = echo_service().with_tls(tls.clone()).serve(&address).await?;
    let client = ClientBuilder::new("tester")
        .with_tls(tls)
        .connect(&address)
        .await?;

    client.link("Echo").await?;
    let result = client
        .request("Echo", "echo", vec![json!(1), json!(2)], Map::new())
        .await?;

    assert_eq!(result, json!([[1, 2], {}]));
    Ok(())
}

#[tokio::test]
async fn terminal_session_speaks_plain_lines() -> Result<()> {
    let (address, _server) = start_manager(test_config()).await?;

    let _echo = echo_service().serve(&address.to_string()).await?;

    async fn read_frame(
        socket: &mut tokio::net::TcpStream,
        buffer: &mut Vec<u8>,
    ) -> Result<Value> {
        loop {
            if let Some(end) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..end + 1).collect();
                let payload = line
                    .strip_suffix(b"\r\n")
                    .unwrap_or(&line[..line.len() - 1]);
                return Ok(serde_json::from_slice(payload)?);
            }

            let mut chunk = [0u8; 1024];
            let size = socket.read(&mut chunk).await?;
            anyhow::ensure!(size > 0, "connection closed");
            buffer.extend_from_slice(&chunk[..size]);
        }
    }

    let mut socket = tokio::net::TcpStream::connect(address).await?;
    let mut buffer = Vec::new();

    // The manager asks who we are; answer with the terminal literal.
    let prompt = read_frame(&mut socket, &mut buffer).await?;
    assert_eq!(prompt["attribute"], "identity");
    socket.write_all(b"client term\r\n").await?;

    // Terminal sessions skip linking entirely.
    socket.write_all(b"Echo echo hello k=1\r\n").await?;
    let reply = timeout(Duration::from_secs(5), read_frame(&mut socket, &mut buffer)).await??;
    assert_eq!(reply["error"], false);
    assert_eq!(reply["result"], json!([["hello"], {"k": 1}]));

    // The admin shortcut reaches the manager.
    socket.write_all(b"identity\r\n").await?;
    let identity = timeout(Duration::from_secs(5), read_frame(&mut socket, &mut buffer)).await??;
    assert_eq!(identity["result"]["type"], "manager");

    socket.write_all(b"exit\r\n").await?;
    Ok(())
}
