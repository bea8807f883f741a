//! Interception certificate authority
//!
//! A self-signed ECDSA P-256 root that mints one leaf certificate per
//! intercepted host. Leaves are cached as ready-to-use rustls server configs.
//! The root is persisted as two PEM files and can be pushed into the
//! platform trust store.

use crate::{ProxyError, Result};
use chrono::{Datelike, Duration, Utc};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;

pub const COMMON_NAME: &str = "trawl Interception CA";
pub const CERT_FILE: &str = "trawl-ca.pem";
pub const KEY_FILE: &str = "trawl-ca-key.pem";

const CA_YEARS: i32 = 10;
const LEAF_CACHE: usize = 512;

fn cert_error(e: impl std::fmt::Display) -> ProxyError {
    ProxyError::Certificate(e.to_string())
}

/// Calendar date `years` after `at`, day clamped so every month has it.
fn ymd(at: chrono::DateTime<Utc>, years: i32) -> (i32, u8, u8) {
    (at.year() + years, at.month() as u8, at.day().min(28) as u8)
}

/// DER body of the first certificate in `pem`.
fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    CertificateDer::from_pem_slice(pem.as_bytes())
        .map(|der| der.to_vec())
        .map_err(|e| ProxyError::Certificate(format!("bad PEM: {e}")))
}

pub struct CertificateAuthority {
    signer: Certificate,
    cert_der: Vec<u8>,
    cert_pem: String,
    key_pem: String,
    leaves: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
    pub fn generate() -> Result<Self> {
        let now = Utc::now();
        let mut params = CertificateParams::new(Vec::<String>::new());
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, COMMON_NAME);
        name.push(DnType::OrganizationName, "trawl");
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign, KeyUsagePurpose::DigitalSignature];
        let (y, m, d) = ymd(now - Duration::days(1), 0);
        params.not_before = rcgen::date_time_ymd(y, m, d);
        let (y, m, d) = ymd(now, CA_YEARS);
        params.not_after = rcgen::date_time_ymd(y, m, d);

        let signer = Certificate::from_params(params).map_err(cert_error)?;
        // Each serialization signs afresh, so derive the DER from the one PEM
        let cert_pem = signer.serialize_pem().map_err(cert_error)?;
        let cert_der = pem_to_der(&cert_pem)?;
        let key_pem = signer.serialize_private_key_pem();
        tracing::info!("generated interception CA");
        Ok(Self { signer, cert_der, cert_pem, key_pem, leaves: Mutex::new(HashMap::new()) })
    }

    fn from_pem(cert_pem: String, key_pem: String) -> Result<Self> {
        let key = KeyPair::from_pem(&key_pem).map_err(cert_error)?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem, key).map_err(cert_error)?;
        let signer = Certificate::from_params(params).map_err(cert_error)?;
        let cert_der = pem_to_der(&cert_pem)?;
        Ok(Self { signer, cert_der, cert_pem, key_pem, leaves: Mutex::new(HashMap::new()) })
    }

    /// Load `trawl-ca.pem` / `trawl-ca-key.pem` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        if !cert_path.exists() || !key_path.exists() {
            return Err(ProxyError::NoCertificateAuthority);
        }
        let ca = Self::from_pem(std::fs::read_to_string(cert_path)?, std::fs::read_to_string(key_path)?)?;
        tracing::debug!(dir = %dir.display(), "loaded interception CA");
        Ok(ca)
    }

    /// `load`, or `generate` and `save` when `dir` holds no CA yet.
    pub fn load_or_generate(dir: &Path) -> Result<Self> {
        match Self::load(dir) {
            Err(ProxyError::NoCertificateAuthority) => {
                let ca = Self::generate()?;
                ca.save(dir)?;
                Ok(ca)
            }
            other => other,
        }
    }

    /// Write both PEM files into `dir`; the key is readable by the owner only.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let cert_path = dir.join(CERT_FILE);
        std::fs::write(&cert_path, &self.cert_pem)?;

        let key_path = dir.join(KEY_FILE);
        std::fs::write(&key_path, &self.key_pem)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(cert_path)
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Write the public certificate (never the key) to `path`.
    pub fn export_pem(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &self.cert_pem)?;
        Ok(())
    }

    /// Server config presenting a leaf for `host`, chained to this CA.
    pub fn leaf_for(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
        if let Some(config) = self.leaves.lock().get(&host) {
            return Ok(Arc::clone(config));
        }

        let config = Arc::new(self.mint(&host)?);
        let mut leaves = self.leaves.lock();
        if leaves.len() >= LEAF_CACHE {
            leaves.clear();
        }
        leaves.insert(host.clone(), Arc::clone(&config));
        tracing::debug!(%host, "minted leaf certificate");
        Ok(config)
    }

    fn mint(&self, host: &str) -> Result<ServerConfig> {
        let now = Utc::now();
        let mut params = CertificateParams::new(Vec::<String>::new());
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.to_string()),
        }];
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, host);
        params.distinguished_name = name;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let (y, m, d) = ymd(now - Duration::days(1), 0);
        params.not_before = rcgen::date_time_ymd(y, m, d);
        let (y, m, d) = ymd(now, 1);
        params.not_after = rcgen::date_time_ymd(y, m, d);

        let leaf = Certificate::from_params(params).map_err(cert_error)?;
        let leaf_der = leaf.serialize_der_with_signer(&self.signer).map_err(cert_error)?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.serialize_private_key_der()));
        let chain = vec![CertificateDer::from(leaf_der), CertificateDer::from(self.cert_der.clone())];

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }

    /// Add the CA to the system trust store. The certificate is first
    /// written to `dir`.
    pub async fn install(&self, dir: &Path) -> Result<()> {
        let cert_path = self.save(dir)?;
        let commands = trust_commands(std::env::consts::OS, &cert_path)
            .ok_or_else(|| ProxyError::Install(format!("unsupported platform {}", std::env::consts::OS)))?;

        for (program, args) in commands {
            tracing::info!(%program, ?args, "installing CA certificate");
            let output = tokio::process::Command::new(&program).args(&args).output().await.map_err(|e| {
                match e.kind() {
                    std::io::ErrorKind::PermissionDenied => ProxyError::PermissionDenied(format!("{program}: {e}")),
                    _ => ProxyError::Install(format!("{program}: {e}")),
                }
            })?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                return Err(install_failure(&program, stderr));
            }
        }
        Ok(())
    }
}

fn install_failure(program: &str, stderr: String) -> ProxyError {
    let lower = stderr.to_lowercase();
    let denied = ["permission denied", "not permitted", "access is denied", "authorization", "must be root"];
    if denied.iter().any(|d| lower.contains(d)) {
        ProxyError::PermissionDenied(format!("{program}: {stderr}"))
    } else {
        ProxyError::Install(format!("{program}: {stderr}"))
    }
}

/// Commands that trust `cert` on `os`, in order.
pub fn trust_commands(os: &str, cert: &Path) -> Option<Vec<(String, Vec<String>)>> {
    let cert = cert.display().to_string();
    let cmd = |program: &str, args: &[&str]| (program.to_string(), args.iter().map(|a| a.to_string()).collect());
    match os {
        "macos" => Some(vec![cmd(
            "security",
            &["add-trusted-cert", "-d", "-r", "trustRoot", "-k", "/Library/Keychains/System.keychain", &cert],
        )]),
        "linux" => Some(vec![
            cmd("cp", &[&cert, "/usr/local/share/ca-certificates/trawl-ca.crt"]),
            cmd("update-ca-certificates", &[]),
        ]),
        "windows" => Some(vec![cmd("certutil", &["-addstore", "-f", "ROOT", &cert])]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(CertificateAuthority::load(dir.path()), Err(ProxyError::NoCertificateAuthority)));

        let ca = CertificateAuthority::generate().unwrap();
        let cert_path = ca.save(dir.path()).unwrap();
        assert!(std::fs::read_to_string(cert_path).unwrap().starts_with("-----BEGIN CERTIFICATE-----"));

        let loaded = CertificateAuthority::load(dir.path()).unwrap();
        assert_eq!(loaded.cert_pem(), ca.cert_pem());
        assert_eq!(loaded.cert_der, ca.cert_der);
        assert!(loaded.leaf_for("example.com").is_ok());
    }

    #[test]
    fn test_unreadable_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::generate().unwrap();
        ca.save(dir.path()).unwrap();
        std::fs::write(dir.path().join(CERT_FILE), "-----BEGIN CERTIFICATE-----\n!!!\n-----END CERTIFICATE-----\n").unwrap();

        assert!(matches!(CertificateAuthority::load(dir.path()), Err(ProxyError::Certificate(_))));
        assert!(pem_to_der("no armour here").is_err());
        assert_eq!(pem_to_der(ca.cert_pem()).unwrap(), ca.cert_der);
    }

    #[test]
    fn test_export_and_load_or_generate() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path()).unwrap();
        let again = CertificateAuthority::load_or_generate(dir.path()).unwrap();
        assert_eq!(ca.cert_pem(), again.cert_pem());

        let out = dir.path().join("export/ca.pem");
        ca.export_pem(&out).unwrap();
        let exported = std::fs::read_to_string(out).unwrap();
        assert!(!exported.contains("PRIVATE KEY"));
        assert_eq!(exported, ca.cert_pem());
    }

    #[test]
    fn test_leaf_cache() {
        let ca = CertificateAuthority::generate().unwrap();
        let a = ca.leaf_for("Example.com").unwrap();
        let b = ca.leaf_for("example.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(ca.leaf_for("127.0.0.1").is_ok());
        assert!(!Arc::ptr_eq(&a, &ca.leaf_for("other.example").unwrap()));
    }

    #[test]
    fn test_trust_commands() {
        let cert = Path::new("/tmp/trawl-ca.pem");
        let linux = trust_commands("linux", cert).unwrap();
        assert_eq!(linux.last().unwrap().0, "update-ca-certificates");
        assert_eq!(trust_commands("macos", cert).unwrap()[0].0, "security");
        assert!(trust_commands("windows", cert).unwrap()[0].1.contains(&"ROOT".to_string()));
        assert!(trust_commands("plan9", cert).is_none());

        assert!(matches!(install_failure("cp", "Permission denied".into()), ProxyError::PermissionDenied(_)));
        assert!(matches!(install_failure("cp", "disk full".into()), ProxyError::Install(_)));
    }

    #[tokio::test]
    async fn test_leaf_verifies_against_ca() {
        let ca = CertificateAuthority::generate().unwrap();
        let acceptor = TlsAcceptor::from(ca.leaf_for("localhost").unwrap());

        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(ca.cert_der.clone())).unwrap();
        let client = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client));

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move {
            let mut tls = acceptor.accept(server_io).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.flush().await.unwrap();
        });

        let name = ServerName::try_from("localhost").unwrap();
        let mut tls = connector.connect(name, client_io).await.unwrap();
        tls.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }
}
