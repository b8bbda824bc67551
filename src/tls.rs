use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use rustls::{
    crypto::ring,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    version::TLS13,
    RootCertStore, ServerConfig,
};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::{config::TlsFiles, Error, Result};

/// Builds the TLS 1.3 acceptor for inbound connections. Clients must present
/// a certificate issued by one of the CAs in `files.ca_cert`.
pub fn load_tls_acceptor(files: &TlsFiles) -> Result<TlsAcceptor> {
    info!(
        cert = %files.server_cert.display(),
        key = %files.private_key.display(),
        ca = %files.ca_cert.display(),
        "loading TLS certificates"
    );

    let certs = load_certs(&files.server_cert)?;
    let key = load_private_key(&files.private_key)?;

    let mut roots = RootCertStore::empty();
    for ca in load_certs(&files.ca_cert)? {
        roots.add(ca)?;
    }

    let provider = Arc::new(ring::default_provider());
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|err| Error::Config(format!("client verifier: {err}")))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&TLS13])?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", path.display())))
}
