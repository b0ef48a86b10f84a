//! Peer SDK for the broker.
//!
//! [`ClientBuilder`] connects a requesting peer: it answers the manager's
//! handshake prompts, correlates replies by uid, and surfaces notifications
//! on a broadcast channel. [`ServiceBuilder`] registers a service as a table
//! of `name -> handler` attributes; the manager never introspects the
//! service, it only forwards JSON, so the table is the whole contract.

mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use codec::FrameReader;

pub use transport::TlsOptions;

use self::transport::{BoxRead, Connection, read_value};

/// How long a handshake prompt may take before the connect fails.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// What a service handler may answer.
pub enum HandlerResult {
    Reply(Value),
    /// Swallow the request; the caller keeps waiting. Used by services that
    /// answer out of band or intentionally never.
    NoReply,
    /// Turned into an error frame with the message in its traceback.
    Error(String),
}

type Handler = Arc<dyn Fn(&[Value], &Map<String, Value>) -> HandlerResult + Send + Sync>;

// ---------------------------------------------------------------- client --

pub struct ClientBuilder {
    name: String,
    tls: Option<TlsOptions>,
    credentials: Option<Credentials>,
}

impl ClientBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tls: None,
            credentials: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Connect and finish the handshake.
    pub async fn connect(self, address: &str) -> Result<Client> {
        let identity = json!({
            "type": "client",
            "name": self.name,
            "language": "rust",
            "os": std::env::consts::OS,
        });

        let connection = Connection::open(address, self.tls.as_ref()).await?;
        let (mut read, mut reader, writer) = connection.into_parts();

        handshake(
            &mut read,
            &mut reader,
            &writer,
            &identity,
            self.credentials.as_ref(),
        )
        .await?;

        let inner = Arc::new(ClientInner {
            writer,
            pending: Mutex::new(HashMap::new()),
            notifications: broadcast::channel(64).0,
            uid: AtomicU64::new(0),
            identity,
            credentials: self.credentials,
        });

        let task = tokio::spawn(client_loop(inner.clone(), read, reader));

        Ok(Client { inner, task })
    }
}

struct ClientInner {
    writer: transport::Writer,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    notifications: broadcast::Sender<Value>,
    uid: AtomicU64,
    identity: Value,
    credentials: Option<Credentials>,
}

/// A connected requesting peer.
pub struct Client {
    inner: Arc<ClientInner>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Issue one request and wait for the correlated reply.
    ///
    /// Error frames surface as `Err` carrying the frame's message.
    pub async fn request(
        &self,
        service: &str,
        attribute: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        let uid = format!("rust-{}", self.inner.uid.fetch_add(1, Ordering::Relaxed) + 1);

        let (sender, receiver) = oneshot::channel();
        self.inner.pending.lock().insert(uid.clone(), sender);

        let frame = json!({
            "error": false,
            "service": service,
            "attribute": attribute,
            "args": args,
            "kwargs": kwargs,
            "uid": uid,
        });

        if let Err(e) = self.inner.writer.write(&frame).await {
            self.inner.pending.lock().remove(&uid);
            return Err(e);
        }

        let reply = receiver
            .await
            .map_err(|_| anyhow!("connection closed before a reply arrived"))?;

        if reply.get("error").and_then(Value::as_bool).unwrap_or(false) {
            bail!(
                "{}",
                reply
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
            );
        }

        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    /// `Manager.link`: permission to send requests to a service. Returns
    /// the service's identity.
    pub async fn link(&self, service: &str) -> Result<Value> {
        self.request("Manager", "link", vec![json!(service)], Map::new())
            .await
    }

    pub async fn unlink(&self, service: &str) -> Result<Value> {
        self.request("Manager", "unlink", vec![json!(service)], Map::new())
            .await
    }

    pub async fn lock(&self, service: &str, mode: &str) -> Result<Value> {
        self.request(
            "Manager",
            "lock",
            vec![json!(service), json!(mode)],
            Map::new(),
        )
        .await
    }

    pub async fn unlock(&self, service: &str) -> Result<Value> {
        self.request("Manager", "unlock", vec![json!(service)], Map::new())
            .await
    }

    pub async fn manager_identity(&self) -> Result<Value> {
        self.request("Manager", "identity", Vec::new(), Map::new())
            .await
    }

    /// Subscribe to notification frames from every linked service.
    pub fn notifications(&self) -> broadcast::Receiver<Value> {
        self.inner.notifications.subscribe()
    }

    /// Drop the connection without ceremony.
    pub fn close(&self) {
        self.task.abort();
        self.inner.writer.shut();
        self.inner.pending.lock().clear();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn client_loop(inner: Arc<ClientInner>, mut read: BoxRead, mut reader: FrameReader) {
    let backend = *inner.writer.backend();

    loop {
        let value = match read_value(&mut read, &mut reader, &backend).await {
            Ok(Some(value)) => value,
            Ok(None) | Err(_) => break,
        };

        // Manager prompts carry an attribute but no service: identity
        // refreshes and login retries are answered in place.
        if value.get("service").is_none() {
            if let Some(attribute) = value.get("attribute").and_then(Value::as_str) {
                let reply = match attribute {
                    "identity" => Some(inner.identity.clone()),
                    "username" => inner
                        .credentials
                        .as_ref()
                        .map(|credentials| json!(credentials.username)),
                    "password" => inner
                        .credentials
                        .as_ref()
                        .map(|credentials| json!(credentials.password)),
                    _ => None,
                };

                if let Some(reply) = reply {
                    let _ = inner.writer.write(&json!({"result": reply})).await;
                    continue;
                }
            }
        }

        let uid = value.get("uid").and_then(Value::as_str).unwrap_or_default();

        if uid == "notification" {
            let _ = inner.notifications.send(value);
            continue;
        }

        match inner.pending.lock().remove(uid) {
            Some(sender) => {
                let _ = sender.send(value);
            }
            None => {
                log::warn!("unmatched frame: uid={:?}", uid);
            }
        }
    }

    // Dropping the senders wakes every waiting request with a closed error.
    inner.pending.lock().clear();
}

// --------------------------------------------------------------- service --

pub struct ServiceBuilder {
    name: String,
    max_clients: i64,
    attributes: Vec<(String, String, Handler)>,
    tls: Option<TlsOptions>,
    credentials: Option<Credentials>,
}

impl ServiceBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            max_clients: -1,
            attributes: Vec::new(),
            tls: None,
            credentials: None,
        }
    }

    pub fn with_max_clients(mut self, max_clients: i64) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Expose one named attribute.
    pub fn with_attribute<F>(mut self, name: &str, signature: &str, handler: F) -> Self
    where
        F: Fn(&[Value], &Map<String, Value>) -> HandlerResult + Send + Sync + 'static,
    {
        self.attributes
            .push((name.to_string(), signature.to_string(), Arc::new(handler)));
        self
    }

    /// Connect, register under the service name, and start serving.
    pub async fn serve(self, address: &str) -> Result<ServiceHandle> {
        let mut signatures = Map::new();
        for (name, signature, _) in &self.attributes {
            signatures.insert(name.clone(), json!(signature));
        }

        let identity = json!({
            "type": "service",
            "name": self.name,
            "language": "rust",
            "os": std::env::consts::OS,
            "attributes": signatures,
            "max_clients": self.max_clients,
        });

        let connection = Connection::open(address, self.tls.as_ref()).await?;
        let (mut read, mut reader, writer) = connection.into_parts();

        handshake(
            &mut read,
            &mut reader,
            &writer,
            &identity,
            self.credentials.as_ref(),
        )
        .await?;

        let handlers: HashMap<String, Handler> = self
            .attributes
            .into_iter()
            .map(|(name, _, handler)| (name, handler))
            .collect();

        let inner = Arc::new(ServiceInner {
            name: self.name,
            writer,
            identity,
            credentials: self.credentials,
            handlers,
        });

        let task = tokio::spawn(service_loop(inner.clone(), read, reader));

        Ok(ServiceHandle { inner, task })
    }
}

struct ServiceInner {
    name: String,
    writer: transport::Writer,
    identity: Value,
    credentials: Option<Credentials>,
    handlers: HashMap<String, Handler>,
}

/// A running service peer.
pub struct ServiceHandle {
    inner: Arc<ServiceInner>,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    /// Broadcast a notification to every client linked to this service.
    pub async fn notify(&self, result: Value) -> Result<()> {
        self.inner
            .writer
            .write(&json!({
                "error": false,
                "service": self.inner.name,
                "result": result,
                "uid": "notification",
            }))
            .await
    }

    /// Drop the connection without ceremony, leaving any received requests
    /// unanswered.
    pub fn close(&self) {
        self.task.abort();
        self.inner.writer.shut();
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn service_loop(inner: Arc<ServiceInner>, mut read: BoxRead, mut reader: FrameReader) {
    let backend = *inner.writer.backend();

    loop {
        let value = match read_value(&mut read, &mut reader, &backend).await {
            Ok(Some(value)) => value,
            Ok(None) | Err(_) => break,
        };

        let Some(attribute) = value.get("attribute").and_then(Value::as_str) else {
            continue;
        };

        // Manager prompts have no service field.
        if value.get("service").is_none() {
            let reply = match attribute {
                "identity" => Some(inner.identity.clone()),
                "username" => inner
                    .credentials
                    .as_ref()
                    .map(|credentials| json!(credentials.username)),
                "password" => inner
                    .credentials
                    .as_ref()
                    .map(|credentials| json!(credentials.password)),
                _ => None,
            };

            if let Some(reply) = reply {
                let _ = inner.writer.write(&json!({"result": reply})).await;
            }
            continue;
        }

        let requester = value
            .get("requester")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let uid = value
            .get("uid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let args = value
            .get("args")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let kwargs = value
            .get("kwargs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let outcome = if attribute == "identity" {
            HandlerResult::Reply(inner.identity.clone())
        } else {
            match inner.handlers.get(attribute) {
                Some(handler) => handler(&args, &kwargs),
                None => HandlerResult::Error(format!(
                    "service {:?} has no attribute {:?}",
                    inner.name, attribute
                )),
            }
        };

        let frame = match outcome {
            HandlerResult::NoReply => continue,
            HandlerResult::Reply(result) => json!({
                "error": false,
                "result": result,
                "requester": requester,
                "uid": uid,
            }),
            HandlerResult::Error(message) => json!({
                "error": true,
                "message": message,
                "traceback": [message],
                "result": null,
                "requester": requester,
                "uid": uid,
            }),
        };

        if inner.writer.write(&frame).await.is_err() {
            break;
        }
    }
}

// ------------------------------------------------------------- handshake --

/// Answer the manager's prompts until the identity (and, with credentials,
/// one login round) is delivered, then probe the manager to learn whether
/// the session was actually admitted.
///
/// The wire protocol has no explicit "ready" frame, so the probe is what
/// turns a rejected login or a duplicate service name into an error here
/// instead of a dead connection later.
async fn handshake(
    read: &mut BoxRead,
    reader: &mut FrameReader,
    writer: &transport::Writer,
    identity: &Value,
    credentials: Option<&Credentials>,
) -> Result<()> {
    let backend = *writer.backend();
    let expect = |attribute: &'static str| {
        format!("expected the manager's {:?} prompt", attribute)
    };

    let prompt = next_prompt(read, reader, &backend)
        .await
        .context(expect("identity"))?;
    if prompt != "identity" {
        bail!("unexpected handshake prompt {:?}", prompt);
    }
    writer.write(&json!({"result": identity})).await?;

    if let Some(credentials) = credentials {
        let prompt = next_prompt(read, reader, &backend)
            .await
            .context(expect("username"))?;
        if prompt != "username" {
            bail!("unexpected handshake prompt {:?}", prompt);
        }
        writer.write(&json!({"result": credentials.username})).await?;

        let prompt = next_prompt(read, reader, &backend)
            .await
            .context(expect("password"))?;
        if prompt != "password" {
            bail!("unexpected handshake prompt {:?}", prompt);
        }
        writer.write(&json!({"result": credentials.password})).await?;
    }

    writer
        .write(&json!({
            "error": false,
            "service": "Manager",
            "attribute": "identity",
            "args": [],
            "kwargs": {},
            "uid": "handshake",
        }))
        .await?;

    loop {
        let value = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_value(read, reader, &backend))
            .await
            .map_err(|_| anyhow!("handshake timed out"))??
            .ok_or_else(|| anyhow!("connection closed during the handshake"))?;

        if value.get("error").and_then(Value::as_bool).unwrap_or(false) {
            bail!(
                "{}",
                value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("handshake refused")
            );
        }

        // A second username prompt means the credentials were rejected;
        // there is no point answering with the same pair again.
        if value.get("attribute").and_then(Value::as_str) == Some("username") {
            bail!("credentials rejected");
        }

        if value.get("uid").and_then(Value::as_str) == Some("handshake") {
            return Ok(());
        }
    }
}

async fn next_prompt(
    read: &mut BoxRead,
    reader: &mut FrameReader,
    backend: &codec::Backend,
) -> Result<String> {
    let value = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_value(read, reader, backend))
        .await
        .map_err(|_| anyhow!("handshake timed out"))??
        .ok_or_else(|| anyhow!("connection closed during the handshake"))?;

    // An error frame here is the manager refusing us (auth failure,
    // duplicate service name); surface its message.
    if value.get("error").and_then(Value::as_bool).unwrap_or(false) {
        bail!(
            "{}",
            value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("handshake refused")
        );
    }

    value
        .get("attribute")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("handshake frame carried no attribute"))
}
