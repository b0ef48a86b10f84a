//! Socket plumbing shared by the client and service peers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, split};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{WebPkiSupportedAlgorithms, aws_lc_rs, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};

use codec::{Backend, FrameReader};

pub type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Extra PEM root to trust, typically the manager's self-signed
    /// certificate.
    pub ca_file: Option<PathBuf>,

    /// Skip certificate verification entirely. Test setups only.
    pub insecure: bool,

    /// Name presented for SNI and verification; defaults to "localhost".
    pub server_name: Option<String>,

    /// PEM client certificate and key, presented when the manager runs
    /// certificate authentication.
    pub identity: Option<(PathBuf, PathBuf)>,
}

pub struct Connection {
    read: BoxRead,
    write: BoxWrite,
    backend: Backend,
}

impl Connection {
    pub async fn open(address: &str, tls: Option<&TlsOptions>) -> Result<Self> {
        let socket = TcpStream::connect(address).await?;
        socket.set_nodelay(true)?;

        let backend = Backend::from_env();

        let (read, write): (BoxRead, BoxWrite) = match tls {
            None => {
                let (read, write) = split(socket);
                (Box::new(read), Box::new(write))
            }
            Some(options) => {
                let connector = TlsConnector::from(Arc::new(client_config(options)?));
                let name = options
                    .server_name
                    .clone()
                    .unwrap_or_else(|| "localhost".to_string());
                let stream = connector
                    .connect(ServerName::try_from(name)?, socket)
                    .await?;

                let (read, write) = split(stream);
                (Box::new(read), Box::new(write))
            }
        };

        Ok(Self {
            read,
            write,
            backend,
        })
    }

    pub fn into_parts(self) -> (BoxRead, FrameReader, Writer) {
        (
            self.read,
            FrameReader::default(),
            Writer {
                backend: self.backend,
                write: Arc::new(tokio::sync::Mutex::new(Some(self.write))),
            },
        )
    }
}

/// The sending half: serialized writes behind one async mutex.
#[derive(Clone)]
pub struct Writer {
    backend: Backend,
    write: Arc<tokio::sync::Mutex<Option<BoxWrite>>>,
}

impl Writer {
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub async fn write(&self, value: &Value) -> Result<()> {
        let bytes = codec::encode_frame(&self.backend, value)?;

        let mut guard = self.write.lock().await;
        let Some(write) = guard.as_mut() else {
            return Err(anyhow!("connection is closed"));
        };

        write.write_all(&bytes).await?;
        Ok(())
    }

    /// Drop the write half; once the read half is gone too, the socket
    /// closes.
    pub fn shut(&self) {
        if let Ok(mut guard) = self.write.try_lock() {
            *guard = None;
        }
    }
}

/// Read whole frames off the socket and decode them.
pub async fn read_value(
    read: &mut BoxRead,
    reader: &mut FrameReader,
    backend: &Backend,
) -> Result<Option<Value>> {
    let mut buffer = vec![0u8; 4096];

    loop {
        if let Some(frame) = reader.next_frame()? {
            return Ok(Some(codec::decode_frame(backend, &frame)?));
        }

        let size = read.read(&mut buffer).await?;
        if size == 0 {
            return Ok(None);
        }

        reader.extend(&buffer[..size]);
    }
}

fn client_config(options: &TlsOptions) -> Result<ClientConfig> {
    let builder = ClientConfig::builder();

    let builder = if options.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification::default()))
    } else {
        let mut roots = RootCertStore::empty();
        if let Some(ca_file) = &options.ca_file {
            for certificate in CertificateDer::pem_file_iter(ca_file)? {
                roots.add(certificate?)?;
            }
        }
        builder.with_root_certificates(roots)
    };

    Ok(match &options.identity {
        Some((cert_file, key_file)) => {
            let certificates =
                CertificateDer::pem_file_iter(cert_file)?.collect::<Result<Vec<_>, _>>()?;
            let key = PrivateKeyDer::from_pem_file(key_file)?;
            builder.with_client_auth_cert(certificates, key)?
        }
        None => builder.with_no_client_auth(),
    })
}

/// Trusts whatever the server presents. The manager's stock certificate is
/// self-signed, so test peers opt into this instead of carrying a root.
#[derive(Debug)]
struct NoVerification {
    algorithms: WebPkiSupportedAlgorithms,
}

impl Default for NoVerification {
    fn default() -> Self {
        Self {
            algorithms: aws_lc_rs::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
