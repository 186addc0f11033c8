use std::fs::File;
use std::io::{self, BufReader};
use std::sync::{Arc, LazyLock};

use anyhow::Context as _;
use camino::Utf8Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};

// rustls doc says:
//
// > Making one of these can be expensive, and should be once per process rather than once per connection.
//
// We reuse the same TLS client config for every probe and proxied request.
// Certificate verification is disabled: the gateway talks to whatever service
// the tunnel creator pointed it at, self-signed or not, over an
// already-established SSH channel.
static TLS_CONNECTOR: LazyLock<tokio_rustls::TlsConnector> = LazyLock::new(|| {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let tls_client_config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .expect("default protocol versions are supported by the default provider")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification(provider)))
        .with_no_client_auth();

    tokio_rustls::TlsConnector::from(Arc::new(tls_client_config))
});

/// Opens a TLS client session on top of an arbitrary transport (in practice:
/// a `forwarded-tcpip` channel).
pub async fn connect<T>(host: &str, stream: T) -> io::Result<tokio_rustls::client::TlsStream<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt as _;

    let host = host.trim_start_matches('[').trim_end_matches(']');

    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut tls_stream = TLS_CONNECTOR.connect(server_name, stream).await?;

    // > To keep it simple and correct, [TlsStream] will behave like `BufWriter`.
    // > For `TlsStream<TcpStream>`, this means that data written by `poll_write`
    // > is not guaranteed to be written to `TcpStream`.
    // > You must call `poll_flush` to ensure that it is written to `TcpStream`.
    //
    // source: https://docs.rs/tokio-rustls/latest/tokio_rustls/#why-do-i-need-to-call-poll_flush
    tls_stream.flush().await?;

    Ok(tls_stream)
}

/// True when a failed `connect` means the peer answered the ClientHello with
/// plaintext rather than a TLS record — the scheme-mismatch signal the
/// bind-time probe relies on.
pub fn is_plaintext_reply(error: &io::Error) -> bool {
    matches!(
        error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>()),
        Some(rustls::Error::InvalidMessage(_))
    )
}

pub fn build_server_config(
    certificates: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
) -> anyhow::Result<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)
        .context("couldn't set server config cert")?;

    // The public side is HTTP/1.1 only: the proxy's hijack path cannot work
    // over multiplexed streams.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

pub fn read_certificates(path: &Utf8Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("couldn't open {path}"))?;

    let certificates = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("couldn't parse PEM certificates from {path}"))?;

    anyhow::ensure!(!certificates.is_empty(), "no certificate found in {path}");

    Ok(certificates)
}

pub fn read_private_key(path: &Utf8Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("couldn't open {path}"))?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("couldn't parse PEM private key from {path}"))?
        .with_context(|| format!("no private key found in {path}"))
}

mod danger {
    use std::sync::Arc;

    use tokio_rustls::rustls;
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any certificate; signatures are still checked so a broken
    /// handshake fails instead of silently passing garbage through.
    #[derive(Debug)]
    pub(super) struct NoCertificateVerification(pub(super) Arc<CryptoProvider>);

    impl ServerCertVerifier for NoCertificateVerification {
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
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
