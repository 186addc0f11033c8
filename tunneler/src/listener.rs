use std::net::SocketAddr;

use anyhow::Context as _;
use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tap::Pipe as _;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::Instrument as _;
use tunneler_task::{ChildTask, ShutdownSignal, Task};

use crate::AppState;

/// Which listener a request came in on. Injected per connection; the cookie
/// handler derives the `Domain` and `Secure` attributes from it.
#[derive(Debug, Clone, Copy)]
pub struct ServedBy {
    pub addr: SocketAddr,
    pub tls: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Http,
    Https,
}

/// Binds an IPv4 TCP listener. Fails fast so a taken port aborts startup.
pub fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    info!(%addr, "Initiating listener…");

    let socket = TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?;
    socket.bind(addr).context("failed to bind TCP socket")?;

    socket
        .listen(64)
        .context("failed to listen with the bound TCP socket")
}

pub struct GatewayListener {
    addr: SocketAddr,
    kind: ListenerKind,
    listener: TcpListener,
    state: AppState,
}

impl GatewayListener {
    pub fn new(listener: TcpListener, kind: ListenerKind, state: AppState) -> anyhow::Result<Self> {
        let addr = listener.local_addr().context("listener local address")?;

        info!(?kind, %addr, "Listener started successfully");

        Ok(Self {
            addr,
            kind,
            listener,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[instrument("listener", skip(self), fields(port = self.addr.port()))]
    pub async fn run(self) -> anyhow::Result<()> {
        match self.kind {
            ListenerKind::Http => run_http_listener(self.listener, self.state, self.addr).await,
            ListenerKind::Https => run_https_listener(self.listener, self.state, self.addr).await,
        }
    }
}

#[async_trait]
impl Task for GatewayListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "gateway listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

async fn run_http_listener(
    listener: TcpListener,
    state: AppState,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let served_by = ServedBy { addr, tls: false };

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let state = state.clone();

                let fut = async move {
                    if let Err(e) = handle_http_peer(stream, state, served_by).await {
                        debug!(error = format!("{e:#}"), "handle_http_peer failed");
                    }
                }
                .instrument(info_span!("http", client = %peer_addr));

                ChildTask::spawn(fut).detach();
            }
            Err(error) => {
                error!(%error, "failed to accept connection");
            }
        }
    }
}

async fn run_https_listener(
    listener: TcpListener,
    state: AppState,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let served_by = ServedBy { addr, tls: true };

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let tls_acceptor = state.conf.tls.acceptor.clone();
                let state = state.clone();

                let fut = async move {
                    if let Err(e) = handle_https_peer(stream, tls_acceptor, state, served_by).await {
                        debug!(error = format!("{e:#}"), "handle_https_peer failed");
                    }
                }
                .instrument(info_span!("https", client = %peer_addr));

                ChildTask::spawn(fut).detach();
            }
            Err(error) => {
                error!(%error, "failed to accept connection");
            }
        }
    }
}

async fn handle_https_peer(
    stream: TcpStream,
    tls_acceptor: tokio_rustls::TlsAcceptor,
    state: AppState,
    served_by: ServedBy,
) -> anyhow::Result<()> {
    let tls_stream = tls_acceptor
        .accept(stream)
        .await
        .context("TLS handshake failed")?
        .pipe(tokio_rustls::TlsStream::Server);

    handle_http_peer(tls_stream, state, served_by).await
}

pub(crate) async fn handle_http_peer<I>(
    io: I,
    state: AppState,
    served_by: ServedBy,
) -> anyhow::Result<()>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let app = crate::make_http_service(state).layer(axum::Extension(served_by));

    // HTTP/1.1 only: the upgrade relay takes over the raw byte stream, which
    // cannot work on a multiplexed connection.
    hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), TowerToHyperService::new(app))
        .with_upgrades()
        .await
        .context("HTTP server")
}
