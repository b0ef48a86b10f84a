//! TLS key material: generation, loading, inspection.
//!
//! Certificates and keys live as PEM files under an operator-chosen
//! location. A missing pair is generated on first start so a fresh install
//! serves TLS out of the box. Private keys may be stored encrypted with a
//! passphrase.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, pem::PemObject,
};

use crate::config::Tls;

/// Generate a self-signed certificate plus private key and write both as
/// PEM.
pub fn generate_certificate(
    cert_file: &Path,
    key_file: &Path,
    common_name: &str,
    password: Option<&str>,
) -> Result<()> {
    let mut names = vec!["localhost".to_string()];
    if common_name != "localhost" {
        names.push(common_name.to_string());
    }

    let mut params = rcgen::CertificateParams::new(names)?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);

    let key_pair = rcgen::KeyPair::generate()?;
    let certificate = params.self_signed(&key_pair)?;

    fs::write(cert_file, certificate.pem())
        .with_context(|| format!("write {:?} failed", cert_file))?;
    write_key(key_file, &key_pair.serialize_pem(), password)?;

    Ok(())
}

/// Generate a standalone private key.
pub fn generate_key(key_file: &Path, password: Option<&str>) -> Result<()> {
    let key_pair = rcgen::KeyPair::generate()?;
    write_key(key_file, &key_pair.serialize_pem(), password)
}

fn write_key(key_file: &Path, pem: &str, password: Option<&str>) -> Result<()> {
    let bytes = match password {
        None => pem.as_bytes().to_vec(),
        Some(password) => {
            let key = openssl::pkey::PKey::private_key_from_pem(pem.as_bytes())?;
            key.private_key_to_pem_pkcs8_passphrase(
                openssl::symm::Cipher::aes_256_cbc(),
                password.as_bytes(),
            )?
        }
    };

    fs::write(key_file, bytes).with_context(|| format!("write {:?} failed", key_file))?;
    Ok(())
}

/// Load the certificate chain from a PEM file.
pub fn load_certificates(cert_file: &Path) -> Result<Vec<CertificateDer<'static>>> {
    Ok(CertificateDer::pem_file_iter(cert_file)
        .with_context(|| format!("read {:?} failed", cert_file))?
        .collect::<Result<Vec<_>, _>>()?)
}

/// Load a PEM private key, decrypting it when a passphrase is given.
pub fn load_private_key(key_file: &Path, password: Option<&str>) -> Result<PrivateKeyDer<'static>> {
    match password {
        None => Ok(PrivateKeyDer::from_pem_file(key_file)
            .with_context(|| format!("read {:?} failed", key_file))?),
        Some(password) => {
            let pem = fs::read(key_file).with_context(|| format!("read {:?} failed", key_file))?;
            let key =
                openssl::pkey::PKey::private_key_from_pem_passphrase(&pem, password.as_bytes())?;
            Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                key.private_key_to_pkcs8()?,
            )))
        }
    }
}

/// Hex SHA-256 over the DER certificate, the form kept in allow-lists.
pub fn fingerprint(certificate: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(certificate.as_ref()))
}

/// Generate the configured certificate pair when it does not exist yet.
pub fn ensure_certificate(tls: &Tls) -> Result<()> {
    if tls.cert_file.exists() && tls.key_file.exists() {
        return Ok(());
    }

    log::info!(
        "generating self-signed certificate: cert={:?}, key={:?}",
        tls.cert_file,
        tls.key_file
    );

    generate_certificate(
        &tls.cert_file,
        &tls.key_file,
        "localhost",
        tls.key_file_password.as_deref(),
    )
}

/// Human-readable description of every certificate in a PEM file.
pub fn dump(cert_file: &Path) -> Result<String> {
    let data = fs::read(cert_file).with_context(|| format!("read {:?} failed", cert_file))?;
    let mut out = String::new();

    for pem in x509_parser::pem::Pem::iter_from_buffer(&data) {
        let pem = pem?;
        let certificate = pem.parse_x509()?;

        out.push_str(&format!(
            "subject:     {}\n\
             issuer:      {}\n\
             serial:      {}\n\
             not before:  {}\n\
             not after:   {}\n\
             fingerprint: {}\n\n",
            certificate.subject(),
            certificate.issuer(),
            certificate.raw_serial_as_string(),
            certificate.validity().not_before,
            certificate.validity().not_after,
            fingerprint(&CertificateDer::from(pem.contents.as_slice()).into_owned()),
        ));
    }

    if out.is_empty() {
        anyhow::bail!("no certificates found in {:?}", cert_file);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "broker-pki-{}-{}",
            hex::encode(rand::random::<[u8; 8]>()),
            name
        ))
    }

    #[test]
    fn generated_pair_loads_back() -> Result<()> {
        let cert_file = temp_path("cert.pem");
        let key_file = temp_path("key.pem");

        generate_certificate(&cert_file, &key_file, "unit.test", None)?;

        let certificates = load_certificates(&cert_file)?;
        assert_eq!(certificates.len(), 1);
        assert_eq!(fingerprint(&certificates[0]).len(), 64);

        load_private_key(&key_file, None)?;
        Ok(())
    }

    #[test]
    fn encrypted_key_round_trip() -> Result<()> {
        let key_file = temp_path("enc-key.pem");

        generate_key(&key_file, Some("passphrase"))?;

        assert!(load_private_key(&key_file, None).is_err());
        load_private_key(&key_file, Some("passphrase"))?;
        Ok(())
    }

    #[test]
    fn dump_describes_the_certificate() -> Result<()> {
        let cert_file = temp_path("dump-cert.pem");
        let key_file = temp_path("dump-key.pem");

        generate_certificate(&cert_file, &key_file, "dump.test", None)?;

        let description = dump(&cert_file)?;
        assert!(description.contains("fingerprint:"));
        assert!(description.contains("not after:"));
        Ok(())
    }
}
