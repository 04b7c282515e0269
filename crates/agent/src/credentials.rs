use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::SERVER_NAME;

const CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// SHA-256 of the server leaf DER, installed by the rotation engine and
/// checked inside every TLS handshake. All-zero means no rotation has run
/// in this process yet and the check is skipped.
#[derive(Debug, Default)]
pub struct PinnedFingerprint(StdRwLock<[u8; 32]>);

impl PinnedFingerprint {
    pub fn set(&self, fingerprint: [u8; 32]) {
        *self.0.write().expect("pin lock poisoned") = fingerprint;
    }

    pub fn get(&self) -> [u8; 32] {
        *self.0.read().expect("pin lock poisoned")
    }

    pub fn is_set(&self) -> bool {
        self.get() != [0u8; 32]
    }
}

struct Entry {
    tls: ClientConfig,
    token: String,
    loaded_at: Instant,
}

/// Lazily loaded mTLS material: assembled TLS configuration plus the bearer
/// token, refreshed after 30 minutes or on explicit invalidation.
pub struct CredentialCache {
    certs_dir: PathBuf,
    pin: Arc<PinnedFingerprint>,
    entry: RwLock<Option<Entry>>,
}

impl CredentialCache {
    pub fn new(certs_dir: PathBuf) -> Self {
        // rustls needs a process-level provider before any config is built.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            certs_dir,
            pin: Arc::new(PinnedFingerprint::default()),
            entry: RwLock::new(None),
        }
    }

    pub fn pin(&self) -> Arc<PinnedFingerprint> {
        self.pin.clone()
    }

    /// Cached TLS config + bearer token, reloading from disk when expired.
    pub async fn get(&self) -> anyhow::Result<(ClientConfig, String)> {
        {
            let entry = self.entry.read().await;
            if let Some(entry) = entry.as_ref() {
                if entry.loaded_at.elapsed() < CACHE_TTL {
                    return Ok((entry.tls.clone(), entry.token.clone()));
                }
            }
        }

        let mut entry = self.entry.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(existing) = entry.as_ref() {
            if existing.loaded_at.elapsed() < CACHE_TTL {
                return Ok((existing.tls.clone(), existing.token.clone()));
            }
        }

        let fresh = self.load()?;
        let result = (fresh.tls.clone(), fresh.token.clone());
        *entry = Some(fresh);
        Ok(result)
    }

    /// Forces a reload on the next lookup. Readers are never blocked beyond
    /// that lookup.
    pub async fn invalidate(&self) {
        *self.entry.write().await = None;
        debug!("credential cache invalidated");
    }

    fn load(&self) -> anyhow::Result<Entry> {
        info!(dir = %self.certs_dir.display(), "loading mTLS credentials");

        let ca_pem = std::fs::read(self.certs_dir.join("ca.crt")).context("read CA cert")?;
        let client_cert_pem =
            std::fs::read(self.certs_dir.join("client.crt")).context("read client cert")?;
        let client_key_pem =
            std::fs::read(self.certs_dir.join("client.key")).context("read client key")?;
        let token = std::fs::read_to_string(self.certs_dir.join("token"))
            .context("read bearer token")?
            .trim()
            .to_string();

        let chain: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(&client_cert_pem)
            .collect::<Result<_, _>>()
            .context("parse client certificate")?;
        let key = PrivateKeyDer::from_pem_slice(&client_key_pem).context("parse client key")?;

        let verifier = PinnedVerifier::from_ca_pem(&ca_pem, self.pin.clone())?;

        let tls = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(chain, key)
            .context("assemble client TLS config")?;

        Ok(Entry {
            tls,
            token,
            loaded_at: Instant::now(),
        })
    }
}

/// Chain verification via WebPKI plus byte-equality of the leaf fingerprint
/// against the in-memory pin.
#[derive(Debug)]
struct PinnedVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pin: Arc<PinnedFingerprint>,
}

impl PinnedVerifier {
    fn from_ca_pem(ca_pem: &[u8], pin: Arc<PinnedFingerprint>) -> anyhow::Result<Arc<Self>> {
        let mut roots = RootCertStore::empty();
        for cert in CertificateDer::pem_slice_iter(ca_pem) {
            roots
                .add(cert.context("parse CA certificate")?)
                .context("add CA certificate to root store")?;
        }
        if roots.is_empty() {
            anyhow::bail!("CA file contains no certificates");
        }

        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .context("build server verifier")?;
        Ok(Arc::new(Self { inner, pin }))
    }
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )?;

        if self.pin.is_set() {
            let fingerprint: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();
            if fingerprint != self.pin.get() {
                return Err(rustls::Error::General(
                    "server certificate fingerprint mismatch (possible impersonation)".into(),
                ));
            }
        }

        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Client for the mTLS upstream: the configured TLS stack plus a DNS
/// override so the URL can carry the expected server name while the bytes
/// go to the cached VM address.
pub fn upstream_client(
    tls: ClientConfig,
    vm_ip: &str,
    timeout: Duration,
) -> anyhow::Result<reqwest::Client> {
    let ip: IpAddr = vm_ip.parse().with_context(|| format!("bad VM IP {vm_ip}"))?;
    reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .resolve(SERVER_NAME, SocketAddr::new(ip, 0))
        .timeout(timeout)
        .build()
        .context("build upstream client")
}

/// NotBefore of the stored client certificate; doubles as the bearer token
/// creation time since both are minted in the same rotation.
pub fn client_cert_not_before(certs_dir: &Path) -> Option<DateTime<Utc>> {
    let pem = std::fs::read(certs_dir.join("client.crt")).ok()?;
    let (_, parsed) = x509_parser::pem::parse_x509_pem(&pem).ok()?;
    let cert = parsed.parse_x509().ok()?;
    DateTime::<Utc>::from_timestamp(cert.validity().not_before.timestamp(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType,
        ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    };

    struct TestPki {
        ca_cert_pem: String,
        server_cert_der: CertificateDer<'static>,
        client_cert_pem: String,
        client_key_pem: String,
    }

    fn generate_pki() -> TestPki {
        let mut ca_dn = DistinguishedName::new();
        ca_dn.push(DnType::CommonName, "private-llm-CA");
        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = ca_dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_key = KeyPair::generate().expect("ca key");
        let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

        let mut server_dn = DistinguishedName::new();
        server_dn.push(DnType::CommonName, SERVER_NAME);
        let mut server_params =
            CertificateParams::new(vec![SERVER_NAME.to_string()]).expect("server params");
        server_params.distinguished_name = server_dn;
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_key = KeyPair::generate().expect("server key");
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .expect("server cert");

        let mut client_dn = DistinguishedName::new();
        client_dn.push(DnType::CommonName, "private-llm-client");
        let mut client_params = CertificateParams::new(vec![]).expect("client params");
        client_params.distinguished_name = client_dn;
        client_params.not_before = time::OffsetDateTime::now_utc();
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_key = KeyPair::generate().expect("client key");
        let client_cert = client_params
            .signed_by(&client_key, &ca_cert, &ca_key)
            .expect("client cert");

        TestPki {
            ca_cert_pem: ca_cert.pem(),
            server_cert_der: server_cert.der().clone(),
            client_cert_pem: client_cert.pem(),
            client_key_pem: client_key.serialize_pem(),
        }
    }

    fn write_store(dir: &Path, pki: &TestPki, token: &str) {
        std::fs::write(dir.join("ca.crt"), &pki.ca_cert_pem).expect("ca.crt");
        std::fs::write(dir.join("client.crt"), &pki.client_cert_pem).expect("client.crt");
        std::fs::write(dir.join("client.key"), &pki.client_key_pem).expect("client.key");
        std::fs::write(dir.join("token"), token).expect("token");
    }

    #[tokio::test]
    async fn loads_and_caches_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pki = generate_pki();
        write_store(dir.path(), &pki, "token-a\n");

        let cache = CredentialCache::new(dir.path().to_path_buf());
        let (_, token) = cache.get().await.expect("load");
        assert_eq!(token, "token-a");

        // Changing the files without invalidating must not change the entry.
        write_store(dir.path(), &pki, "token-b");
        let (_, token) = cache.get().await.expect("cached");
        assert_eq!(token, "token-a");

        cache.invalidate().await;
        let (_, token) = cache.get().await.expect("reload");
        assert_eq!(token, "token-b");
    }

    #[tokio::test]
    async fn missing_files_surface_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CredentialCache::new(dir.path().to_path_buf());
        let err = cache.get().await.expect_err("no certs on disk");
        assert!(err.to_string().contains("CA cert"), "got: {err}");
    }

    #[tokio::test]
    async fn pinned_verifier_accepts_matching_leaf() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let pki = generate_pki();

        let pin = Arc::new(PinnedFingerprint::default());
        let fingerprint: [u8; 32] = Sha256::digest(pki.server_cert_der.as_ref()).into();
        pin.set(fingerprint);

        let verifier =
            PinnedVerifier::from_ca_pem(pki.ca_cert_pem.as_bytes(), pin).expect("verifier");
        let name = ServerName::try_from(SERVER_NAME).expect("server name");
        verifier
            .verify_server_cert(&pki.server_cert_der, &[], &name, &[], UnixTime::now())
            .expect("matching pin verifies");
    }

    #[tokio::test]
    async fn pinned_verifier_rejects_mismatched_leaf() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let pki = generate_pki();

        let pin = Arc::new(PinnedFingerprint::default());
        pin.set([0xAB; 32]);

        let verifier =
            PinnedVerifier::from_ca_pem(pki.ca_cert_pem.as_bytes(), pin).expect("verifier");
        let name = ServerName::try_from(SERVER_NAME).expect("server name");
        let err = verifier
            .verify_server_cert(&pki.server_cert_der, &[], &name, &[], UnixTime::now())
            .expect_err("pin mismatch must fail");
        assert!(
            err.to_string().contains("possible impersonation"),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn zero_pin_skips_the_fingerprint_check() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let pki = generate_pki();

        let pin = Arc::new(PinnedFingerprint::default());
        assert!(!pin.is_set());

        let verifier =
            PinnedVerifier::from_ca_pem(pki.ca_cert_pem.as_bytes(), pin).expect("verifier");
        let name = ServerName::try_from(SERVER_NAME).expect("server name");
        verifier
            .verify_server_cert(&pki.server_cert_der, &[], &name, &[], UnixTime::now())
            .expect("unpinned handshake passes chain verification");
    }

    #[test]
    fn not_before_is_read_from_the_client_cert() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pki = generate_pki();
        write_store(dir.path(), &pki, "t");

        let created = client_cert_not_before(dir.path()).expect("not before");
        let age = Utc::now() - created;
        assert!(age.num_days() < 2, "fresh cert should be recent: {created}");
    }
}
