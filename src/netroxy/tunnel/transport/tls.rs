use std::{fs, path::Path, sync::Arc};

use async_trait::async_trait;
use rcgen::generate_simple_self_signed;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::netroxy::tunnel::transport::{BoxedStream, Transport};

#[derive(Debug, Clone, Default)]
pub struct TlsServerOptions {
    /// PEM certificate chain. Empty together with `key_file` means a
    /// self-signed certificate for `localhost` is generated at startup.
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct TlsClientOptions {
    pub verify: bool,
    pub server_name: String,
    /// PEM bundle of trusted roots, required when `verify` is set.
    pub ca_file: String,
}

pub struct TlsTransport {
    acceptor: Option<TlsAcceptor>,
    connector: Option<(TlsConnector, ServerName<'static>)>,
}

impl TlsTransport {
    pub fn server(opts: &TlsServerOptions) -> anyhow::Result<Self> {
        let (certs, key) = load_or_generate_cert(&opts.cert_file, &opts.key_file)?;
        let cfg = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Self {
            acceptor: Some(TlsAcceptor::from(Arc::new(cfg))),
            connector: None,
        })
    }

    pub fn client(opts: &TlsClientOptions) -> anyhow::Result<Self> {
        let name = if opts.server_name.trim().is_empty() {
            "localhost".to_string()
        } else {
            opts.server_name.trim().to_string()
        };
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| anyhow::anyhow!("tls: invalid server name {name:?}"))?;

        let builder = rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?;
        let cfg = if opts.verify {
            let ca = opts.ca_file.trim();
            if ca.is_empty() {
                anyhow::bail!("tls: verify requires a ca file");
            }
            let mut roots = rustls::RootCertStore::empty();
            for c in load_certs(Path::new(ca))? {
                roots.add(c)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth()
        };

        Ok(Self {
            acceptor: None,
            connector: Some((TlsConnector::from(Arc::new(cfg)), server_name)),
        })
    }
}

#[async_trait]
impl Transport for TlsTransport {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn accept(&self, conn: TcpStream) -> anyhow::Result<BoxedStream> {
        let Some(acceptor) = &self.acceptor else {
            anyhow::bail!("tls: transport has no server certificate");
        };
        let st = acceptor.accept(conn).await?;
        Ok(Box::new(st))
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        let Some((connector, name)) = &self.connector else {
            anyhow::bail!("tls: transport has no client config");
        };
        let tcp = TcpStream::connect(addr).await?;
        let _ = tcp.set_nodelay(true);
        let st = connector.connect(name.clone(), tcp).await?;
        Ok(Box::new(st))
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn load_or_generate_cert(
    cert_file: &str,
    key_file: &str,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_file = cert_file.trim();
    let key_file = key_file.trim();

    if !cert_file.is_empty() || !key_file.is_empty() {
        if cert_file.is_empty() || key_file.is_empty() {
            anyhow::bail!("tls: requires both ca and key (or neither to auto-generate)");
        }
        let certs = load_certs(Path::new(cert_file))?;
        let key = load_key(Path::new(key_file))?;
        return Ok((certs, key));
    }

    tracing::warn!("tls: no certificate configured; generating a self-signed one for localhost");
    let rcgen::CertifiedKey { cert, signing_key } =
        generate_simple_self_signed(["localhost".to_string()])?;
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
    Ok((vec![cert_der], key_der))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).map_err(|e| anyhow::anyhow!("tls: read {}: {e}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("tls: no certificate found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).map_err(|e| anyhow::anyhow!("tls: read {}: {e}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let Some(k) = rustls_pemfile::private_key(&mut rd)? else {
        anyhow::bail!("tls: no private key found in {}", path.display());
    };
    Ok(k)
}

/// Certificate verifier that accepts any server certificate, used when the
/// client config sets `verify = false`.
///
/// NOTE: vulnerable to MITM.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
