use std::path::{Path, PathBuf};

use anyhow::Context;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::state::SharedState;
use crate::telemetry;
use crate::SERVER_NAME;

pub const CA_COMMON_NAME: &str = "private-llm-CA";
pub const CLIENT_COMMON_NAME: &str = "private-llm-client";

pub const SECRET_CA_CERT: &str = "private-llm-ca-cert";
pub const SECRET_SERVER_CERT: &str = "private-llm-server-cert";
pub const SECRET_SERVER_KEY: &str = "private-llm-server-key";
pub const SECRET_TOKEN: &str = "private-llm-internal-token";

const CA_VALIDITY_DAYS: i64 = 10 * 365;
const CA_RENEWAL_WINDOW_DAYS: i64 = 30;
const LEAF_VALIDITY_DAYS: i64 = 7;
const TOKEN_BYTES: usize = 32;

// 4096-bit keygen dominates debug-profile test time; tests keep the same
// code path with a smaller modulus.
#[cfg(not(test))]
const RSA_BITS: usize = 4096;
#[cfg(test)]
const RSA_BITS: usize = 2048;

/// Fresh material produced by one rotation. The server key exists only here
/// and in the secret store; it is never written to local disk or read back.
pub struct RotatedMaterials {
    pub ca_cert_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
    pub token: String,
    pub server_fingerprint: [u8; 32],
}

/// Regenerates server cert, client cert, and bearer token, pins the new
/// server fingerprint, publishes the remote half to the secret store, and
/// invalidates the credential cache. The CA is reused while it has more
/// than 30 days left. Runs under the ops mutex.
pub async fn rotate_certs(state: &SharedState) -> anyhow::Result<()> {
    let certs_dir = state.cfg.certs_dir()?;
    create_private_dir(&certs_dir)?;

    let materials = rotate_materials(&certs_dir, state)?;

    let secrets: [(&str, &[u8]); 4] = [
        (SECRET_SERVER_CERT, materials.server_cert_pem.as_bytes()),
        (SECRET_SERVER_KEY, materials.server_key_pem.as_bytes()),
        (SECRET_CA_CERT, materials.ca_cert_pem.as_bytes()),
        (SECRET_TOKEN, materials.token.as_bytes()),
    ];
    for (secret_id, data) in secrets {
        state
            .gcp
            .add_secret_version(&state.cfg.project_id, secret_id, data)
            .await
            .with_context(|| format!("publish {secret_id}"))?;
        info!(secret_id, "published new secret version");
    }

    state.credentials.invalidate().await;
    telemetry::record_rotation("success");
    info!("certificate rotation complete");
    Ok(())
}

/// The local half of a rotation: CA handling, leaf issuance, pinning, and
/// the 0600 writes. Split out so the secret-store publication can be mocked
/// around it.
pub fn rotate_materials(certs_dir: &Path, state: &SharedState) -> anyhow::Result<RotatedMaterials> {
    let (ca_cert_pem, ca_key_pem) = ensure_ca(certs_dir)?;

    let ca_key = KeyPair::from_pem_and_sign_algo(&ca_key_pem, &rcgen::PKCS_RSA_SHA256)
        .context("load CA key")?;
    let ca_params =
        CertificateParams::from_ca_cert_pem(&ca_cert_pem).context("parse CA certificate")?;
    let ca_issuer = ca_params.self_signed(&ca_key).context("rebuild CA issuer")?;

    info!("generating server certificate");
    let (server_key, server_key_pem) = new_rsa_keypair().context("generate server key")?;
    let mut server_params =
        CertificateParams::new(vec![SERVER_NAME.to_string()]).context("server params")?;
    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::CommonName, SERVER_NAME);
    server_params.distinguished_name = server_dn;
    server_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    server_params.serial_number = Some(random_serial());
    server_params.not_before = OffsetDateTime::now_utc();
    server_params.not_after = OffsetDateTime::now_utc() + Duration::days(LEAF_VALIDITY_DAYS);
    let server_cert = server_params
        .signed_by(&server_key, &ca_issuer, &ca_key)
        .context("sign server certificate")?;

    // Pin before any client material is committed, so a handshake can never
    // race a half-installed rotation.
    let server_fingerprint: [u8; 32] = Sha256::digest(server_cert.der().as_ref()).into();
    state.credentials.pin().set(server_fingerprint);
    info!(
        fingerprint = %hex::encode(&server_fingerprint[..8]),
        "pinned server certificate"
    );

    info!("generating client certificate");
    let (client_key, client_key_pem) = new_rsa_keypair().context("generate client key")?;
    let mut client_params = CertificateParams::new(vec![]).context("client params")?;
    let mut client_dn = DistinguishedName::new();
    client_dn.push(DnType::CommonName, CLIENT_COMMON_NAME);
    client_params.distinguished_name = client_dn;
    client_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    client_params.serial_number = Some(random_serial());
    client_params.not_before = OffsetDateTime::now_utc();
    client_params.not_after = OffsetDateTime::now_utc() + Duration::days(LEAF_VALIDITY_DAYS);
    let client_cert = client_params
        .signed_by(&client_key, &ca_issuer, &ca_key)
        .context("sign client certificate")?;

    let token = generate_token();

    write_private(&certs_dir.join("client.crt"), client_cert.pem().as_bytes())?;
    write_private(&certs_dir.join("client.key"), client_key_pem.as_bytes())?;
    write_private(&certs_dir.join("token"), token.as_bytes())?;

    Ok(RotatedMaterials {
        ca_cert_pem,
        server_cert_pem: server_cert.pem(),
        server_key_pem,
        client_cert_pem: client_cert.pem(),
        client_key_pem,
        token,
        server_fingerprint,
    })
}

/// Loads the CA from the cert store, regenerating when absent or within 30
/// days of expiry. The CA private key never leaves this directory.
fn ensure_ca(certs_dir: &Path) -> anyhow::Result<(String, String)> {
    let cert_path = certs_dir.join("ca.crt");
    let key_path = certs_dir.join("ca.key");

    if let (Ok(cert_pem), Ok(key_pem)) = (
        std::fs::read_to_string(&cert_path),
        std::fs::read_to_string(&key_path),
    ) {
        if let Some(not_after) = ca_not_after(&cert_pem) {
            let remaining = not_after - OffsetDateTime::now_utc();
            if remaining > Duration::days(CA_RENEWAL_WINDOW_DAYS) {
                info!(%not_after, "reusing existing CA");
                return Ok((cert_pem, key_pem));
            }
            info!(%not_after, "CA expires within 30 days, regenerating");
        }
    }

    info!("generating new CA certificate");
    let (ca_key, ca_key_pem) = new_rsa_keypair().context("generate CA key")?;
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + Duration::days(CA_VALIDITY_DAYS);
    let ca_cert = params.self_signed(&ca_key).context("self-sign CA")?;

    let cert_pem = ca_cert.pem();
    write_private(&cert_path, cert_pem.as_bytes())?;
    write_private(&key_path, ca_key_pem.as_bytes())?;

    Ok((cert_pem, ca_key_pem))
}

fn ca_not_after(cert_pem: &str) -> Option<OffsetDateTime> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()).ok()?;
    let cert = parsed.parse_x509().ok()?;
    Some(cert.validity().not_after.to_datetime())
}

/// 4096-bit RSA key as both an rcgen signer and its PKCS#8 PEM.
fn new_rsa_keypair() -> anyhow::Result<(KeyPair, String)> {
    let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)
        .context("generate RSA key")?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .context("encode RSA key")?
        .to_string();
    let key_pair = KeyPair::from_pem_and_sign_algo(&pem, &rcgen::PKCS_RSA_SHA256)
        .context("import RSA key")?;
    Ok((key_pair, pem))
}

/// Random 62-bit serial, matching the width the remote half expects.
fn random_serial() -> SerialNumber {
    let serial = rand::thread_rng().next_u64() >> 2;
    SerialNumber::from(serial.to_be_bytes().to_vec())
}

/// 64-character hex bearer token from 32 CSPRNG bytes.
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn create_private_dir(dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("chmod {}", dir.display()))?;
    }
    Ok(())
}

fn write_private(path: &PathBuf, data: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(())
}
