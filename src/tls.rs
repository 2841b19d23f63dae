use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use anyhow::Context;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    ServerConfig,
};
use tokio_rustls::TlsAcceptor;

use crate::error::StartupError;

/// Hosts the generated certificate is valid for.
const SELF_SIGNED_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOrigin {
    Loaded,
    Generated,
}

/// Certificate and key used by every router that terminates TLS.
#[derive(Debug)]
pub struct TlsIdentity {
    origin: IdentityOrigin,
    cert_chain: Vec<CertificateDer<'static>>,
    server_config: Arc<ServerConfig>,
}

impl TlsIdentity {
    fn new(
        origin: IdentityOrigin,
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> anyhow::Result<Self> {
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain.clone(), key)
            .context("certificate and key do not form a usable pair")?;
        Ok(Self {
            origin,
            cert_chain,
            server_config: Arc::new(server_config),
        })
    }

    pub fn origin(&self) -> IdentityOrigin {
        self.origin
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }
}

/// Loads the identity from `cert_path`/`key_path`, or generates a
/// self-signed one when they cannot be used. Only a generation failure is
/// an error.
pub fn acquire(cert_path: &Path, key_path: &Path) -> Result<TlsIdentity, StartupError> {
    acquire_with(cert_path, key_path, generate)
}

/// [`acquire`] with the fallback generator supplied by the caller.
pub fn acquire_with<G>(
    cert_path: &Path,
    key_path: &Path,
    generate: G,
) -> Result<TlsIdentity, StartupError>
where
    G: FnOnce() -> anyhow::Result<TlsIdentity>,
{
    match load(cert_path, key_path) {
        Ok(identity) => {
            log::info!(
                "loaded TLS certificate from \"{}\" and key from \"{}\"",
                cert_path.display(),
                key_path.display()
            );
            Ok(identity)
        }
        Err(error) => {
            log::info!(
                "no usable TLS certificate ({:#}); generating a self-signed one",
                error
            );
            generate().map_err(StartupError::Certificate)
        }
    }
}

fn load(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsIdentity> {
    let certs = load_certs(cert_path)?;
    anyhow::ensure!(
        !certs.is_empty(),
        "no certificate found in \"{}\"",
        cert_path.display()
    );
    let key = load_private_key(key_path)?;
    TlsIdentity::new(IdentityOrigin::Loaded, certs, key)
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open cert file \"{}\"", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certs in \"{}\"", path.display()))
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open key file \"{}\"", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("failed to parse key in \"{}\"", path.display()))?
        .with_context(|| format!("no private key found in \"{}\"", path.display()))
}

pub fn generate() -> anyhow::Result<TlsIdentity> {
    let hosts: Vec<String> = SELF_SIGNED_HOSTS.iter().map(|host| host.to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(hosts)
        .context("failed to generate self-signed certificate")?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));
    let identity = TlsIdentity::new(
        IdentityOrigin::Generated,
        vec![certified.cert.der().clone()],
        key,
    )?;
    log::info!("generated self-signed TLS certificate for {:?}", SELF_SIGNED_HOSTS);
    Ok(identity)
}
