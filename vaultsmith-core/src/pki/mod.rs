//! X.509 trust material for the cluster
//!
//! This module provides:
//! - RSA private keys checked against expected size and exponent
//! - Certificates reconciled field by field against declarative properties
//! - The root CA wrapper and PKCS#12 packaging for the admin client

pub mod authority;
pub mod certificate;
pub mod private_key;

pub use authority::{pkcs12_bundle, CertificateAuthority};
pub use certificate::{
    ensure_certificate, ensure_certificate_content, BasicConstraints, CertificateProperties,
    ExtendedKeyUsage, GeneratedCertificate, KeyUsageFlags, NameAttribute, SubjectName,
};
pub use private_key::{
    ensure_private_key, ensure_private_key_content, traditional_pem, GeneratedPrivateKey,
    PrivateKeyProperties, DEFAULT_KEY_SIZE, DEFAULT_PUBLIC_EXPONENT,
};

use crate::error::{VaultsmithError, VaultsmithResult};
use std::path::Path;
use tokio::fs;

/// Write a file readable by the owner only
pub async fn write_private_file(path: &Path, content: &[u8]) -> VaultsmithResult<()> {
    write_file_with_mode(path, content, 0o600).await
}

/// Write a world-readable file (certificates, CA bundles)
pub async fn write_public_file(path: &Path, content: &[u8]) -> VaultsmithResult<()> {
    write_file_with_mode(path, content, 0o644).await
}

async fn write_file_with_mode(path: &Path, content: &[u8], mode: u32) -> VaultsmithResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| VaultsmithError::io(format!("create directory {}", parent.display()), e))?;
    }

    // Remove first so a previous file's permissions never carry over
    if fs::metadata(path).await.is_ok() {
        fs::remove_file(path)
            .await
            .map_err(|e| VaultsmithError::io(format!("remove {}", path.display()), e))?;
    }

    fs::write(path, content)
        .await
        .map_err(|e| VaultsmithError::io(format!("write {}", path.display()), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| VaultsmithError::io(format!("set permissions on {}", path.display()), e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}
