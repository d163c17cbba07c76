//! TLS identity helpers: PEM loading, self-signed generation and
//! SHA-256 certificate fingerprints used for pinning.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use log::info;
use sha2::{Digest, Sha256};
use wtransport::tls::Sha256Digest;
use wtransport::Identity;

/// Subject alternative names used when nothing else is configured.
pub fn default_sans() -> Vec<String> {
    vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ]
}

/// Load certificate chain and private key from PEM files.
///
/// When `private_key` is `None` the key is read from the certificate file,
/// which then has to contain both PEM blocks.
pub async fn load_identity(certificate: &Path, private_key: Option<&Path>) -> Result<Identity> {
    let key_path = private_key.unwrap_or(certificate);
    Identity::load_pemfiles(certificate, key_path)
        .await
        .map_err(|e| {
            anyhow!(
                "Failed to load TLS identity (certificate: {}, key: {}): {}",
                certificate.display(),
                key_path.display(),
                e
            )
        })
}

/// Generate an ephemeral self-signed identity.
pub fn self_signed_identity(sans: &[String]) -> Result<Identity> {
    Identity::self_signed(sans)
        .map_err(|e| anyhow!("Failed to generate self-signed identity: {:?}", e))
}

/// Hex SHA-256 of the identity's leaf certificate.
pub fn identity_fingerprint(identity: &Identity) -> Result<String> {
    let leaf = identity
        .certificate_chain()
        .as_slice()
        .first()
        .context("Identity has an empty certificate chain")?;
    Ok(cert_fingerprint_hex(leaf.der()))
}

/// Lowercase hex SHA-256 of a DER certificate.
pub fn cert_fingerprint_hex(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

/// Canonical form of a fingerprint: 64 lowercase hex chars.
///
/// Accepts either case and `:`-separated byte pairs.
pub fn normalize_fingerprint(fingerprint: &str) -> Result<String> {
    let compact: String = fingerprint
        .trim()
        .chars()
        .filter(|c| *c != ':')
        .collect();
    let bytes = hex::decode(&compact)
        .with_context(|| format!("Certificate hash is not valid hex: '{}'", fingerprint))?;
    if bytes.len() != 32 {
        anyhow::bail!(
            "Certificate hash must be 32 bytes (64 hex chars), got {} bytes",
            bytes.len()
        );
    }
    Ok(hex::encode(bytes))
}

/// Parse a fingerprint into the digest used for certificate pinning.
pub fn parse_fingerprint(fingerprint: &str) -> Result<Sha256Digest> {
    let bytes = hex::decode(normalize_fingerprint(fingerprint)?)?;
    let digest: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("Certificate hash must be 32 bytes"))?;
    Ok(Sha256Digest::new(digest))
}

/// Write a new self-signed certificate and key as PEM files.
///
/// Returns the certificate fingerprint.
pub fn generate_pem_files(
    cert_path: &Path,
    key_path: &Path,
    sans: Vec<String>,
    force: bool,
) -> Result<String> {
    for path in [cert_path, key_path] {
        if path.exists() && !force {
            anyhow::bail!(
                "File already exists: {}. Use --force to overwrite.",
                path.display()
            );
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create parent directory")?;
            }
        }
    }

    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(sans)
        .context("Failed to generate self-signed certificate")?;
    let fingerprint = cert_fingerprint_hex(cert.der());

    std::fs::write(cert_path, cert.pem()).context("Failed to write certificate file")?;
    std::fs::write(key_path, key_pair.serialize_pem()).context("Failed to write key file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(key_path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(key_path, perms)?;
    }

    info!(
        "Certificate saved to {}, key saved to {}",
        cert_path.display(),
        key_path.display()
    );
    Ok(fingerprint)
}
