//! One task per accepted socket.
//!
//! The connection walks the handshake states in straight-line code: TLS (in
//! [`handle`]), identify, optional authentication, register. Once ready it
//! enters a select loop that reads frames into the router and drains the
//! session's writer queue, so exactly one task ever touches the socket and
//! one queue feeds it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, error::TryRecvError, unbounded_channel};
use tokio_rustls::TlsAcceptor;

use codec::{Backend, FrameReader};
use service::{
    RouteOutcome, Service,
    error::{ErrorKind, Fault},
    message::{self, Identity},
    session::{CloseReason, Outbound, Registration, Role},
};

use crate::config::{AuthMode, Config};
use crate::credentials::CredentialStore;
use crate::observer::Observer;
use crate::server::{terminal, tls};
use crate::statistics::{Reporter, Statistics, Stats};

#[derive(Clone)]
pub struct ConnectionOptions {
    pub config: Arc<Config>,
    pub service: Service<Observer>,
    pub statistics: Statistics,
    pub store: CredentialStore,
    pub acceptor: Option<TlsAcceptor>,
    pub local_addr: SocketAddr,
}

/// Everything the handshake learned about the peer.
struct Handshake {
    role: Role,
    name: String,
    identity: Value,
    max_clients: i64,
    terminal: bool,
    admin: bool,
}

enum Flow {
    Continue,
    Close,
}

/// Drive one accepted connection to completion.
pub async fn handle(options: ConnectionOptions, socket: TcpStream, address: SocketAddr) {
    // Disable the Nagle algorithm; request/reply traffic wants latency over
    // throughput.
    if let Err(e) = socket.set_nodelay(true) {
        log::error!("socket set nodelay failed: addr={:?}, err={}", address, e);
    }

    match options.acceptor.clone() {
        Some(acceptor) => {
            let timeout = Duration::from_secs(options.config.limits.handshake_timeout);
            let stream = match tokio::time::timeout(timeout, acceptor.accept(socket)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    log::warn!("tls handshake failed: addr={:?}, err={}", address, e);
                    return;
                }
                Err(_) => {
                    log::warn!("tls handshake timed out: addr={:?}", address);
                    return;
                }
            };

            // Keep the leaf fingerprint around; the auth-pending step runs
            // only after the identity exchange, when the stream is already
            // behind the generic session driver.
            let fingerprint = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certificates| certificates.first())
                .map(tls::fingerprint);

            session(stream, options, address, fingerprint).await;
        }
        None => session(socket, options, address, None).await,
    }
}

fn certificate_allowed(
    options: &ConnectionOptions,
    fingerprint: Option<&str>,
    address: &SocketAddr,
) -> bool {
    let Some(fingerprint) = fingerprint else {
        log::warn!("no peer certificate presented: addr={:?}", address);
        return false;
    };

    let allowed = options
        .config
        .auth
        .certificates
        .iter()
        .any(|allow| allow.eq_ignore_ascii_case(fingerprint));

    if !allowed {
        log::warn!(
            "certificate rejected: addr={:?}, fingerprint={}",
            address,
            fingerprint
        );
    }

    allowed
}

async fn session<S>(
    mut stream: S,
    options: ConnectionOptions,
    address: SocketAddr,
    fingerprint: Option<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let backend = *options.service.backend();
    let timeout = Duration::from_secs(options.config.limits.handshake_timeout);
    let mut reader = FrameReader::new(options.config.limits.max_frame_size);

    // Identify: the manager asks, the peer has one deadline to answer.
    let prompt = options.service.identity_prompt(&options.local_addr);
    if write_frame(&mut stream, &backend, &prompt).await.is_err() {
        return;
    }

    let raw = match read_frame(&mut stream, &mut reader, timeout).await {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("identify failed: addr={:?}, err={}", address, e);
            fail(&mut stream, &backend, ErrorKind::Identity, &e.to_string(), &address).await;
            return;
        }
    };

    let Some(mut handshake) = parse_identity(&backend, &raw, address) else {
        log::warn!("malformed identity: addr={:?}", address);
        fail(
            &mut stream,
            &backend,
            ErrorKind::Identity,
            "the identity reply is malformed",
            &address,
        )
        .await;
        return;
    };

    // The identity exchange is settled; now the configured auth mode
    // decides whether the peer stays.
    match options.config.auth.mode {
        AuthMode::None => {}
        AuthMode::Certificate => {
            if !certificate_allowed(&options, fingerprint.as_deref(), &address) {
                fail(
                    &mut stream,
                    &backend,
                    ErrorKind::Auth,
                    "certificate fingerprint is not allow-listed",
                    &address,
                )
                .await;
                return;
            }
        }
        AuthMode::Hostname => {
            if !hostname_allowed(&options, &address).await {
                log::warn!("hostname rejected: addr={:?}", address);
                fail(
                    &mut stream,
                    &backend,
                    ErrorKind::Auth,
                    "peer hostname is not allow-listed",
                    &address,
                )
                .await;
                return;
            }
        }
        AuthMode::Login => match login(&mut stream, &mut reader, &options, address, timeout).await {
            Ok(admin) => handshake.admin = admin,
            Err(()) => {
                fail(
                    &mut stream,
                    &backend,
                    ErrorKind::Auth,
                    "credentials rejected",
                    &address,
                )
                .await;
                return;
            }
        },
    }

    let (sender, mut receiver) = unbounded_channel();
    let registration = Registration {
        address,
        role: handshake.role,
        name: handshake.name.clone(),
        identity: handshake.identity.clone(),
        max_clients: handshake.max_clients,
        admin: handshake.admin,
        terminal: handshake.terminal,
        sender,
    };

    if let Err(e) = options.service.register(registration) {
        log::warn!("registration refused: addr={:?}, err={}", address, e);
        fail(&mut stream, &backend, ErrorKind::Identity, &e.to_string(), &address).await;
        return;
    }

    let reporter = options.statistics.register(address);
    let mut terminal_uid = 0u64;
    let mut buffer = vec![0u8; 4096];

    'session: loop {
        // Route whatever is already buffered first; frames can arrive
        // piggybacked on the handshake bytes, and the select below only
        // wakes on fresh socket data.
        loop {
            match reader.next_frame() {
                Ok(Some(frame)) => {
                    reporter.send(&[Stats::ReceivedFrames(1)]);

                    let flow = handle_frame(
                        &options,
                        address,
                        handshake.terminal,
                        &backend,
                        &frame,
                        &mut terminal_uid,
                        &reporter,
                    )
                    .await;

                    if let Flow::Close = flow {
                        // Let the answer (and anything queued before it)
                        // reach the wire before closing.
                        flush_outbound(&mut stream, &mut receiver, &reporter).await;
                        break 'session;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("framing failed: addr={:?}, err={}", address, e);
                    reporter.send(&[Stats::ErrorFrames(1)]);
                    let fault = Fault::new(ErrorKind::Protocol, e.to_string());
                    let frame = message::error_frame(&fault.message(), &address.to_string(), "");
                    let _ = write_frame(&mut stream, &backend, &frame).await;
                    break 'session;
                }
            }
        }

        tokio::select! {
            result = stream.read(&mut buffer) => {
                match result {
                    Ok(0) | Err(_) => break 'session,
                    Ok(size) => {
                        reporter.send(&[Stats::ReceivedBytes(size)]);
                        reader.extend(&buffer[..size]);
                    }
                }
            }
            item = receiver.recv() => {
                match item {
                    Some(Outbound::Frame(bytes)) => {
                        if stream.write_all(&bytes).await.is_err() {
                            break 'session;
                        }
                        reporter.send(&[Stats::SendBytes(bytes.len()), Stats::SendFrames(1)]);
                    }
                    Some(Outbound::Close) | None => break 'session,
                }
            }
        }
    }

    options.service.unregister(&address, CloseReason::Disconnected);
    options.statistics.unregister(&address);
    let _ = stream.shutdown().await;

    log::info!("socket disconnect: addr={:?}", address);
}

/// Decode (or translate) one inbound frame and hand it to the router.
async fn handle_frame(
    options: &ConnectionOptions,
    address: SocketAddr,
    terminal: bool,
    backend: &Backend,
    frame: &[u8],
    counter: &mut u64,
    reporter: &Reporter,
) -> Flow {
    let is_json = frame
        .iter()
        .find(|byte| !byte.is_ascii_whitespace())
        .map(|byte| *byte == b'{')
        .unwrap_or(false);

    let value = if terminal && !is_json {
        let Ok(line) = std::str::from_utf8(frame) else {
            options.service.send_fault(
                &address,
                &Fault::new(ErrorKind::Protocol, "terminal line is not valid UTF-8"),
                "",
            );
            return Flow::Continue;
        };

        match terminal::translate(line, counter) {
            terminal::Translation::Request(value) => value,
            terminal::Translation::Invalid(detail) => {
                options
                    .service
                    .send_fault(&address, &Fault::new(ErrorKind::Protocol, detail), "");
                return Flow::Continue;
            }
            terminal::Translation::Disconnect => return Flow::Close,
            terminal::Translation::Empty => return Flow::Continue,
        }
    } else {
        match codec::decode_frame(backend, frame) {
            Ok(value) => value,
            Err(e) => {
                // Undecodable bytes leave the stream in an unknown state;
                // answer and end the session.
                log::warn!("malformed frame: addr={:?}, err={}", address, e);
                reporter.send(&[Stats::ErrorFrames(1)]);
                options.service.send_fault(
                    &address,
                    &Fault::new(ErrorKind::Protocol, e.to_string()),
                    "",
                );
                return Flow::Close;
            }
        }
    };

    match options.service.route(address, value).await {
        RouteOutcome::Continue => Flow::Continue,
        RouteOutcome::CloseSession => Flow::Close,
    }
}

/// Write everything already sitting in the outbound queue.
async fn flush_outbound<S>(
    stream: &mut S,
    receiver: &mut UnboundedReceiver<Outbound>,
    reporter: &Reporter,
) where
    S: AsyncWrite + Unpin,
{
    loop {
        match receiver.try_recv() {
            Ok(Outbound::Frame(bytes)) => {
                if stream.write_all(&bytes).await.is_err() {
                    return;
                }
                reporter.send(&[Stats::SendBytes(bytes.len()), Stats::SendFrames(1)]);
            }
            Ok(Outbound::Close) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
        }
    }
}

/// Run the three-attempt username/password exchange; returns whether the
/// authenticated user is an admin.
async fn login<S>(
    stream: &mut S,
    reader: &mut FrameReader,
    options: &ConnectionOptions,
    address: SocketAddr,
    timeout: Duration,
) -> Result<bool, ()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let backend = *options.service.backend();

    for _ in 0..3 {
        let Ok(username) =
            prompt_for(stream, reader, &backend, "username", &options.local_addr, timeout).await
        else {
            return Err(());
        };
        let Ok(password) =
            prompt_for(stream, reader, &backend, "password", &options.local_addr, timeout).await
        else {
            return Err(());
        };

        match options.store.verify_user(&username, &password).await {
            Ok(Some(record)) => {
                log::info!("login ok: addr={:?}, username={:?}", address, username);
                return Ok(record.admin);
            }
            Ok(None) => {
                log::warn!("login rejected: addr={:?}, username={:?}", address, username);
            }
            Err(e) => {
                log::error!("credential store lookup failed: err={}", e);
            }
        }
    }

    Err(())
}

/// Send one manager prompt and read the `{result: <string>}` answer.
async fn prompt_for<S>(
    stream: &mut S,
    reader: &mut FrameReader,
    backend: &Backend,
    attribute: &str,
    manager_address: &SocketAddr,
    timeout: Duration,
) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let prompt = message::prompt_frame(attribute, &manager_address.to_string());
    write_frame(stream, backend, &prompt).await?;

    let raw = read_frame(stream, reader, timeout).await?;
    let value = codec::decode_frame(backend, &raw)?;

    value
        .get("result")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("the {} reply carried no string result", attribute))
}

/// Parse the identity reply: a JSON identity, a `{result: identity}`
/// wrapper, or one of the terminal literals.
fn parse_identity(backend: &Backend, raw: &[u8], address: SocketAddr) -> Option<Handshake> {
    let text = std::str::from_utf8(raw).ok()?.trim();

    if !text.starts_with('{') {
        return match text.split_whitespace().next()? {
            "client" => {
                let rest = text["client".len()..].trim();
                let name = if rest.is_empty() {
                    address.to_string()
                } else {
                    rest.to_string()
                };

                Some(Handshake {
                    role: Role::Client,
                    identity: json!({"type": "client", "name": name}),
                    name,
                    max_clients: -1,
                    terminal: true,
                    admin: false,
                })
            }
            "service" => {
                let name = text["service".len()..].trim();
                if name.is_empty() {
                    return None;
                }

                Some(Handshake {
                    role: Role::Service,
                    identity: json!({"type": "service", "name": name, "attributes": {}}),
                    name: name.to_string(),
                    max_clients: -1,
                    terminal: true,
                    admin: false,
                })
            }
            _ => None,
        };
    }

    let value = codec::decode_frame(backend, text.as_bytes()).ok()?;
    let identity_value = value.get("result").cloned().unwrap_or(value);
    let identity = serde_json::from_value::<Identity>(identity_value.clone()).ok()?;

    match identity {
        Identity::Client { name, .. } => Some(Handshake {
            role: Role::Client,
            name: name.unwrap_or_else(|| address.to_string()),
            identity: identity_value,
            max_clients: -1,
            terminal: false,
            admin: false,
        }),
        Identity::Service {
            name, max_clients, ..
        } => Some(Handshake {
            role: Role::Service,
            name,
            identity: identity_value,
            max_clients,
            terminal: false,
            admin: false,
        }),
        // The manager is the one party that never connects to itself.
        Identity::Manager { .. } => None,
    }
}

/// Resolve the allow-listed hostnames and match the peer's address against
/// them.
async fn hostname_allowed(options: &ConnectionOptions, peer: &SocketAddr) -> bool {
    let mut hostnames = options.store.hostnames().await.unwrap_or_else(|e| {
        log::error!("credential store lookup failed: err={}", e);
        Vec::new()
    });
    hostnames.extend(options.config.auth.hostnames.iter().cloned());

    for hostname in hostnames {
        match tokio::net::lookup_host((hostname.as_str(), 0)).await {
            Ok(mut addresses) => {
                if addresses.any(|address| address.ip() == peer.ip()) {
                    return true;
                }
            }
            Err(e) => {
                log::debug!("hostname lookup failed: hostname={:?}, err={}", hostname, e);
            }
        }
    }

    false
}

async fn write_frame<S>(stream: &mut S, backend: &Backend, value: &Value) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = codec::encode_frame(backend, value)?;
    stream.write_all(&bytes).await?;
    Ok(())
}

/// Read whole frames until one completes or the deadline passes.
async fn read_frame<S>(
    stream: &mut S,
    reader: &mut FrameReader,
    timeout: Duration,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buffer = vec![0u8; 4096];

    loop {
        if let Some(frame) = reader.next_frame()? {
            return Ok(frame);
        }

        let size = tokio::time::timeout_at(deadline, stream.read(&mut buffer))
            .await
            .map_err(|_| anyhow::anyhow!("no reply within the handshake deadline"))??;

        if size == 0 {
            anyhow::bail!("connection closed during the handshake");
        }

        reader.extend(&buffer[..size]);
    }
}

/// Answer a pre-registration fault and shut the socket.
async fn fail<S>(
    stream: &mut S,
    backend: &Backend,
    kind: ErrorKind,
    detail: &str,
    address: &SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let fault = Fault::new(kind, detail);
    let frame = message::error_frame(&fault.message(), &address.to_string(), "");
    let _ = write_frame(stream, backend, &frame).await;
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn parse(raw: &[u8]) -> Option<Handshake> {
        parse_identity(&Backend::Standard, raw, addr())
    }

    #[test]
    fn terminal_literals() {
        let client = parse(b"client").unwrap();
        assert_eq!(client.role, Role::Client);
        assert_eq!(client.name, addr().to_string());
        assert!(client.terminal);

        let named = parse(b"client lab terminal").unwrap();
        assert_eq!(named.name, "lab terminal");

        let service = parse(b"service Echo").unwrap();
        assert_eq!(service.role, Role::Service);
        assert_eq!(service.name, "Echo");
        assert_eq!(service.max_clients, -1);

        assert!(parse(b"service").is_none());
        assert!(parse(b"nonsense").is_none());
    }

    #[test]
    fn json_identity_plain_and_result_wrapped() {
        let identity = json!({
            "type": "service",
            "name": "Echo",
            "attributes": {"echo": "(*args, **kwargs)"},
            "max_clients": 2,
        });

        let plain = parse(&serde_json::to_vec(&identity).unwrap()).unwrap();
        assert_eq!(plain.role, Role::Service);
        assert_eq!(plain.name, "Echo");
        assert_eq!(plain.max_clients, 2);
        assert!(!plain.terminal);

        let wrapped = parse(&serde_json::to_vec(&json!({"result": identity})).unwrap()).unwrap();
        assert_eq!(wrapped.name, "Echo");
        assert_eq!(wrapped.max_clients, 2);
    }

    #[test]
    fn nameless_client_takes_its_address() {
        let client = parse(br#"{"type": "client"}"#).unwrap();
        assert_eq!(client.role, Role::Client);
        assert_eq!(client.name, addr().to_string());
        assert!(!client.terminal);
    }

    #[test]
    fn manager_identity_is_rejected() {
        assert!(parse(br#"{"type": "manager", "language": "rust", "os": "linux"}"#).is_none());
        assert!(parse(b"{not json").is_none());
    }
}
