use std::fs::read_to_string;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    /// manager listen address
    ///
    /// The address the TCP listener binds to. The wildcard address accepts
    /// peers on every interface.
    #[serde(default = "Server::host")]
    pub host: IpAddr,

    /// manager listen port
    #[serde(default = "Server::port")]
    pub port: u16,
}

impl Server {
    fn host() -> IpAddr {
        "0.0.0.0".parse().unwrap()
    }

    fn port() -> u16 {
        1875
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: Self::host(),
            port: Self::port(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Tls {
    /// Serve plain TCP instead of TLS.
    #[serde(default)]
    pub disabled: bool,

    /// PEM certificate chain presented to connecting peers.
    ///
    /// Generated on first start when the file does not exist yet.
    #[serde(default = "Tls::cert_file")]
    pub cert_file: PathBuf,

    /// PEM private key matching the certificate.
    #[serde(default = "Tls::key_file")]
    pub key_file: PathBuf,

    /// Passphrase of the private key when it is stored encrypted.
    #[serde(default)]
    pub key_file_password: Option<String>,
}

impl Tls {
    fn cert_file() -> PathBuf {
        PathBuf::from("broker-server-cert.pem")
    }

    fn key_file() -> PathBuf {
        PathBuf::from("broker-server-key.pem")
    }
}

impl Default for Tls {
    fn default() -> Self {
        Self {
            disabled: false,
            cert_file: Self::cert_file(),
            key_file: Self::key_file(),
            key_file_password: None,
        }
    }
}

/// At most one authentication mode is active per manager instance.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    /// The TLS peer certificate's SHA-256 fingerprint must be allow-listed.
    Certificate,
    /// The peer must connect from an allow-listed hostname.
    Hostname,
    /// The peer must answer the username/password prompts.
    Login,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Auth {
    #[serde(default)]
    pub mode: AuthMode,

    /// Allow-listed peer certificate fingerprints (hex SHA-256 of the DER
    /// certificate) for the certificate mode. Static, config-only.
    #[serde(default)]
    pub certificates: Vec<String>,

    /// Static additions to the hostname allow-list; the credential store
    /// contributes the persistent entries.
    #[serde(default)]
    pub hostnames: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Limits {
    /// Largest accepted frame in bytes.
    #[serde(default = "Limits::max_frame_size")]
    pub max_frame_size: usize,

    /// Seconds a connecting peer gets to finish the handshake.
    #[serde(default = "Limits::handshake_timeout")]
    pub handshake_timeout: u64,

    /// Seconds in-flight requests get to settle during shutdown.
    #[serde(default = "Limits::shutdown_grace")]
    pub shutdown_grace: u64,

    /// Optional per-request deadline in seconds; unset requests wait
    /// indefinitely.
    #[serde(default)]
    pub request_timeout: Option<u64>,
}

impl Limits {
    fn max_frame_size() -> usize {
        codec::DEFAULT_MAX_FRAME_SIZE
    }

    fn handshake_timeout() -> u64 {
        10
    }

    fn shutdown_grace() -> u64 {
        30
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_size: Self::max_frame_size(),
            handshake_timeout: Self::handshake_timeout(),
            shutdown_grace: Self::shutdown_grace(),
            request_timeout: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_filter(&self) -> log::LevelFilter {
        match *self {
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    #[serde(default)]
    pub level: LogLevel,

    /// Mirror log lines into this file in addition to stdout.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Database {
    /// Credential store location. The file is created on first use.
    #[serde(default = "Database::path")]
    pub path: PathBuf,
}

impl Database {
    fn path() -> PathBuf {
        PathBuf::from("broker-server.db3")
    }
}

impl Default for Database {
    fn default() -> Self {
        Self { path: Self::path() }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub database: Database,
}

impl Config {
    /// Load the optional TOML configuration file, then apply the command
    /// line overrides on top.
    pub fn load(args: &StartArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => toml::from_str::<Self>(&read_to_string(path)?)?,
            None => Self::default(),
        };

        if let Some(host) = args.host {
            config.server.host = host;
        }

        if let Some(port) = args.port {
            config.server.port = port;
        }

        if args.disable_tls {
            config.tls.disabled = true;
        }

        if let Some(cert_file) = &args.cert_file {
            config.tls.cert_file = cert_file.clone();
        }

        if let Some(key_file) = &args.key_file {
            config.tls.key_file = key_file.clone();
        }

        if let Some(password) = &args.key_file_password {
            config.tls.key_file_password = Some(password.clone());
        }

        if args.auth_cert {
            config.auth.mode = AuthMode::Certificate;
        }

        if args.auth_hostname {
            config.auth.mode = AuthMode::Hostname;
        }

        if args.auth_login {
            config.auth.mode = AuthMode::Login;
        }

        if let Some(level) = args.log_level {
            config.log.level = level;
        }

        if let Some(file) = &args.log_file {
            config.log.file = Some(file.clone());
        }

        if let Some(database) = &args.database {
            config.database.path = database.clone();
        }

        if config.auth.mode == AuthMode::Certificate && config.tls.disabled {
            anyhow::bail!("certificate authentication requires tls");
        }

        Ok(config)
    }

    pub fn listen(&self) -> SocketAddr {
        SocketAddr::new(self.server.host, self.server.port)
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the manager.
    Start(StartArgs),
    /// Generate a self-signed certificate and matching private key.
    Certgen(CertgenArgs),
    /// Generate a private key.
    Keygen(KeygenArgs),
    /// Print the details of a PEM certificate.
    Certdump(CertdumpArgs),
    /// Manage login users in the credential store.
    User(UserArgs),
    /// Manage the hostname allow-list in the credential store.
    Hostname(HostnameArgs),
    /// Delete the credential store and TLS key material.
    Delete(DeleteArgs),
}

#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Configuration file path; flags below override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listen address.
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Listen port.
    #[arg(long)]
    pub port: Option<u16>,

    /// PEM certificate chain file.
    #[arg(long)]
    pub cert_file: Option<PathBuf>,

    /// PEM private key file.
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Passphrase of an encrypted private key.
    #[arg(long)]
    pub key_file_password: Option<String>,

    /// Serve plain TCP instead of TLS.
    #[arg(long)]
    pub disable_tls: bool,

    /// Require an allow-listed peer certificate fingerprint.
    #[arg(long)]
    pub auth_cert: bool,

    /// Require an allow-listed peer hostname.
    #[arg(long)]
    pub auth_hostname: bool,

    /// Require a username/password login.
    #[arg(long)]
    pub auth_login: bool,

    /// Logger verbosity: error, warn, info, debug, or trace.
    #[arg(long)]
    pub log_level: Option<LogLevel>,

    /// Mirror log lines into this file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Credential store location.
    #[arg(long)]
    pub database: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CertgenArgs {
    /// Where to write the certificate.
    #[arg(long, default_value = "broker-server-cert.pem")]
    pub cert_file: PathBuf,

    /// Where to write the private key.
    #[arg(long, default_value = "broker-server-key.pem")]
    pub key_file: PathBuf,

    /// Passphrase to encrypt the private key with.
    #[arg(long)]
    pub key_file_password: Option<String>,

    /// Certificate common name.
    #[arg(long, default_value = "localhost")]
    pub common_name: String,
}

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Where to write the private key.
    #[arg(long, default_value = "broker-server-key.pem")]
    pub key_file: PathBuf,

    /// Passphrase to encrypt the private key with.
    #[arg(long)]
    pub key_file_password: Option<String>,
}

#[derive(Args, Debug)]
pub struct CertdumpArgs {
    /// The PEM certificate to inspect.
    #[arg(long)]
    pub cert_file: PathBuf,
}

#[derive(Args, Debug)]
pub struct UserArgs {
    #[command(subcommand)]
    pub action: UserAction,

    /// Credential store location.
    #[arg(long, default_value = "broker-server.db3")]
    pub database: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum UserAction {
    /// Insert or update a login user.
    Add {
        username: String,
        password: String,
        /// Grant the manager's privileged methods to this user.
        #[arg(long)]
        admin: bool,
    },
    /// Remove a login user.
    Remove { username: String },
    /// List registered usernames.
    List,
}

#[derive(Args, Debug)]
pub struct HostnameArgs {
    #[command(subcommand)]
    pub action: HostnameAction,

    /// Credential store location.
    #[arg(long, default_value = "broker-server.db3")]
    pub database: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum HostnameAction {
    /// Allow-list a hostname.
    Add { hostname: String },
    /// Remove a hostname from the allow-list.
    Remove { hostname: String },
    /// List allow-listed hostnames.
    List,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Credential store location.
    #[arg(long, default_value = "broker-server.db3")]
    pub database: PathBuf,

    /// Certificate file to remove.
    #[arg(long, default_value = "broker-server-cert.pem")]
    pub cert_file: PathBuf,

    /// Private key file to remove.
    #[arg(long, default_value = "broker-server-key.pem")]
    pub key_file: PathBuf,
}
