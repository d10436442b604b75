//! TLS material: server certificate, optional client-CA verification.

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;
use wtty_core::{WttyError, WttyResult};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the rustls server configuration.
///
/// With `client_ca` set, every connection must present a certificate that
/// verifies against that CA bundle.
pub fn build_server_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca: Option<&Path>,
) -> WttyResult<ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| WttyError::Tls(format!("unsupported protocol versions: {e}")))?;

    let builder = match client_ca {
        Some(ca_path) => {
            info!(ca = %ca_path.display(), "mutual TLS enabled, requiring client certificates");
            builder.with_client_cert_verifier(build_client_verifier(ca_path)?)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| WttyError::Tls(format!("invalid certificate/key pair: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Load a CA bundle into a verifier that requires a client certificate.
pub fn build_client_verifier(ca_path: &Path) -> WttyResult<Arc<dyn ClientCertVerifier>> {
    let ca_certs = load_certs(ca_path)
        .map_err(|e| WttyError::Tls(format!("could not load CA crt file: {e}")))?;

    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots.add(cert).map_err(|e| {
            WttyError::Tls(format!("invalid CA certificate in {}: {e}", ca_path.display()))
        })?;
    }

    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
        .build()
        .map_err(|e| WttyError::Tls(format!("failed to build client verifier: {e}")))
}

pub fn acceptor(config: ServerConfig) -> TlsAcceptor {
    TlsAcceptor::from(Arc::new(config))
}

/// Read every certificate in a PEM file. An empty file is an error.
pub fn load_certs(path: &Path) -> WttyResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| WttyError::Tls(format!("cannot read cert {}: {e}", path.display())))?;

    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| WttyError::Tls(format!("cannot parse cert {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(WttyError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file.
pub fn load_private_key(path: &Path) -> WttyResult<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| WttyError::Tls(format!("cannot read key {}: {e}", path.display())))?;

    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| WttyError::Tls(format!("cannot parse key {}: {e}", path.display())))?
        .ok_or_else(|| WttyError::Tls(format!("no private key found in {}", path.display())))
}

/// Write a self-signed development certificate into `dir`.
pub fn generate_self_signed_cert(dir: &Path) -> WttyResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let tls_err = |e: rcgen::Error| WttyError::Tls(format!("certificate generation failed: {e}"));
    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])
    .map_err(tls_err)?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "wtty dev cert");

    let key_pair = rcgen::KeyPair::generate().map_err(tls_err)?;
    let cert = params.self_signed(&key_pair).map_err(tls_err)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
        KeyUsagePurpose,
    };
    use rustls::pki_types::ServerName;
    use rustls::ClientConfig;
    use tokio::io::duplex;
    use tokio_rustls::TlsConnector;

    struct Issued {
        cert: rcgen::Certificate,
        key: KeyPair,
    }

    fn ca(name: &str) -> Issued {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, name);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Issued { cert, key }
    }

    fn leaf(name: &str, usage: ExtendedKeyUsagePurpose, issuer: Option<&Issued>) -> Issued {
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![usage];
        let key = KeyPair::generate().unwrap();
        let cert = match issuer {
            Some(ca) => params.signed_by(&key, &ca.cert, &ca.key).unwrap(),
            None => params.self_signed(&key).unwrap(),
        };
        Issued { cert, key }
    }

    fn write_pair(dir: &Path, name: &str, issued: &Issued) -> (PathBuf, PathBuf) {
        let cert = dir.join(format!("{name}.crt"));
        let key = dir.join(format!("{name}.key"));
        std::fs::write(&cert, issued.cert.pem()).unwrap();
        std::fs::write(&key, issued.key.serialize_pem()).unwrap();
        (cert, key)
    }

    fn client_config(ca: &Issued, client: Option<(&Path, &Path)>) -> ClientConfig {
        let mut roots = RootCertStore::empty();
        roots.add(ca.cert.der().clone()).unwrap();
        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots);
        match client {
            Some((cert, key)) => builder
                .with_client_auth_cert(load_certs(cert).unwrap(), load_private_key(key).unwrap())
                .unwrap(),
            None => builder.with_no_client_auth(),
        }
    }

    /// Run one in-memory handshake and report whether the server accepted it.
    async fn server_accepts(server: ServerConfig, client: ClientConfig) -> bool {
        let (client_io, server_io) = duplex(64 * 1024);
        let acceptor = acceptor(server);
        let connector = TlsConnector::from(Arc::new(client));
        let name = ServerName::try_from("localhost").unwrap();

        let (server_side, _client_side) = tokio::join!(
            acceptor.accept(server_io),
            connector.connect(name, client_io)
        );
        server_side.is_ok()
    }

    #[tokio::test]
    async fn plain_tls_accepts_any_client() {
        let dir = tempfile::tempdir().unwrap();
        let root = ca("wtty test root");
        let server = leaf("localhost", ExtendedKeyUsagePurpose::ServerAuth, Some(&root));
        let (cert, key) = write_pair(dir.path(), "server", &server);

        let config = build_server_config(&cert, &key, None).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert!(server_accepts(config, client_config(&root, None)).await);
    }

    #[tokio::test]
    async fn mutual_tls_accepts_certificate_signed_by_ca() {
        let dir = tempfile::tempdir().unwrap();
        let root = ca("wtty test root");
        let server = leaf("localhost", ExtendedKeyUsagePurpose::ServerAuth, Some(&root));
        let client = leaf("alice", ExtendedKeyUsagePurpose::ClientAuth, Some(&root));
        let (cert, key) = write_pair(dir.path(), "server", &server);
        let (client_cert, client_key) = write_pair(dir.path(), "client", &client);
        let ca_path = dir.path().join("ca.crt");
        std::fs::write(&ca_path, root.cert.pem()).unwrap();

        let config = build_server_config(&cert, &key, Some(&ca_path)).unwrap();
        let client = client_config(&root, Some((&client_cert, &client_key)));
        assert!(server_accepts(config, client).await);
    }

    #[tokio::test]
    async fn mutual_tls_rejects_unrelated_self_signed_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let root = ca("wtty test root");
        let server = leaf("localhost", ExtendedKeyUsagePurpose::ServerAuth, Some(&root));
        let rogue = leaf("mallory", ExtendedKeyUsagePurpose::ClientAuth, None);
        let (cert, key) = write_pair(dir.path(), "server", &server);
        let (rogue_cert, rogue_key) = write_pair(dir.path(), "rogue", &rogue);
        let ca_path = dir.path().join("ca.crt");
        std::fs::write(&ca_path, root.cert.pem()).unwrap();

        let config = build_server_config(&cert, &key, Some(&ca_path)).unwrap();
        let client = client_config(&root, Some((&rogue_cert, &rogue_key)));
        assert!(!server_accepts(config, client).await);
    }

    #[tokio::test]
    async fn mutual_tls_rejects_missing_client_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let root = ca("wtty test root");
        let server = leaf("localhost", ExtendedKeyUsagePurpose::ServerAuth, Some(&root));
        let (cert, key) = write_pair(dir.path(), "server", &server);
        let ca_path = dir.path().join("ca.crt");
        std::fs::write(&ca_path, root.cert.pem()).unwrap();

        let config = build_server_config(&cert, &key, Some(&ca_path)).unwrap();
        assert!(!server_accepts(config, client_config(&root, None)).await);
    }

    #[test]
    fn unreadable_material_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.pem");
        let err = build_server_config(&missing, &missing, None).unwrap_err();
        assert!(err.to_string().contains("missing.pem"));
    }

    #[test]
    fn ca_file_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("empty-ca.pem");
        std::fs::write(&ca_path, "not a certificate\n").unwrap();
        assert!(build_client_verifier(&ca_path).is_err());
    }

    #[test]
    fn generated_dev_cert_loads() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = generate_self_signed_cert(&dir.path().join("certs")).unwrap();
        assert!(build_server_config(&cert, &key, None).is_ok());
    }
}
