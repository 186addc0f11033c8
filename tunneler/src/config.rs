use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use clap::Parser;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::local_addr::parse_listen_addr;
use crate::tls;

#[derive(Debug, Parser)]
#[command(name = "tunneler", about = "Reverse-tunneling HTTP gateway over SSH remote forwarding")]
pub struct Cli {
    /// Address used by the SSH server to listen to
    #[arg(long, default_value = ":2222")]
    pub ssh_addr: String,

    /// Address used by the HTTP server to listen to
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub http_addr: String,

    /// Address used by the HTTPs server to listen to
    #[arg(long, default_value = "127.0.0.1:8443")]
    pub https_addr: String,

    /// Public hostname used to reach this service
    #[arg(long)]
    pub hostname: Option<String>,

    /// Path to a valid TLS certificate used by the HTTPs server
    #[arg(long)]
    pub tls_cert_path: Utf8PathBuf,

    /// Path to a valid TLS key used by the HTTPs server
    #[arg(long)]
    pub tls_key_path: Utf8PathBuf,

    /// Path to a valid host key used by the SSH server
    #[arg(long)]
    pub host_key_path: Utf8PathBuf,
}

pub struct Tls {
    pub acceptor: tokio_rustls::TlsAcceptor,
}

impl Tls {
    pub fn init(
        certificates: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> anyhow::Result<Self> {
        let config = tls::build_server_config(certificates, private_key)
            .context("failed to build TLS server config")?;

        Ok(Self {
            acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        })
    }
}

/// Validated runtime configuration. Key material is loaded once here; the
/// rest of the service never touches the filesystem.
pub struct Conf {
    pub ssh_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub hostname: String,
    pub tls: Tls,
    pub host_key: russh::keys::PrivateKey,
}

impl Conf {
    pub fn init() -> anyhow::Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let ssh_addr = parse_listen_addr(&cli.ssh_addr)
            .with_context(|| format!("invalid --ssh-addr: {}", cli.ssh_addr))?;
        let http_addr = parse_listen_addr(&cli.http_addr)
            .with_context(|| format!("invalid --http-addr: {}", cli.http_addr))?;
        let https_addr = parse_listen_addr(&cli.https_addr)
            .with_context(|| format!("invalid --https-addr: {}", cli.https_addr))?;

        let hostname = cli
            .hostname
            .filter(|hostname| !hostname.is_empty())
            .or_else(default_hostname)
            .unwrap_or_else(|| "localhost".to_owned());

        let certificates = tls::read_certificates(&cli.tls_cert_path).context("TLS certificate")?;
        let private_key = tls::read_private_key(&cli.tls_key_path).context("TLS private key")?;
        let tls = Tls::init(certificates, private_key).context("failed to init TLS config")?;

        let host_key = russh::keys::load_secret_key(&cli.host_key_path, None)
            .with_context(|| format!("SSH host key at {}", cli.host_key_path))?;

        Ok(Conf {
            ssh_addr,
            http_addr,
            https_addr,
            hostname,
            tls,
            host_key,
        })
    }
}

fn default_hostname() -> Option<String> {
    hostname::get().ok()?.into_string().ok()
}
