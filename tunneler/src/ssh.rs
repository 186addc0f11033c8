use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::Channel;
use tokio::net::TcpListener;
use tunneler_task::{ChildTask, ShutdownSignal, Task};

use crate::local_addr::LocalAddr;
use crate::proxy;
use crate::transport::ChannelTransport;
use crate::tunnel::{Scheme, SshConn, FORWARD_BIND_PORT};
use crate::AppState;

const GREETING: &[u8] = b"Remote forwarding available...\n";

/// The SSH side of the gateway: accepts connections and intercepts
/// `tcpip-forward` requests whose bind address is a tunnel identifier.
pub struct SshPlane {
    listener: TcpListener,
    config: Arc<russh::server::Config>,
    state: AppState,
}

impl SshPlane {
    pub fn new(listener: TcpListener, state: AppState) -> Self {
        let config = russh::server::Config {
            keys: vec![state.conf.host_key.clone()],
            ..Default::default()
        };

        Self {
            listener,
            config: Arc::new(config),
            state,
        }
    }

    #[instrument("ssh", skip(self), fields(port = self.state.bound.ssh.port()))]
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await.context("failed to accept connection") {
                Ok((stream, peer_addr)) => {
                    let config = self.config.clone();
                    let handler = SshHandler::new(self.state.clone(), peer_addr);

                    ChildTask::spawn(async move {
                        match russh::server::run_stream(config, stream, handler).await {
                            Ok(session) => {
                                if let Err(error) = session.await {
                                    debug!(%error, client = %peer_addr, "SSH connection closed");
                                }
                            }
                            Err(error) => {
                                warn!(%error, client = %peer_addr, "SSH connection setup failed");
                            }
                        }
                    })
                    .detach();
                }
                Err(e) => error!(error = format!("{e:#}"), "Listener failure"),
            }
        }
    }
}

#[async_trait]
impl Task for SshPlane {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "ssh plane";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown_signal.wait() => Ok(()),
        }
    }
}

/// Per-connection handler. Tracks which identifiers this connection bound so
/// they can be dropped from the registry when the connection goes away.
struct SshHandler {
    state: AppState,
    peer_addr: SocketAddr,
    bound: Arc<Mutex<HashSet<String>>>,
    session_channels: Vec<Channel<Msg>>,
}

impl SshHandler {
    fn new(state: AppState, peer_addr: SocketAddr) -> Self {
        Self {
            state,
            peer_addr,
            bound: Arc::new(Mutex::new(HashSet::new())),
            session_channels: Vec::new(),
        }
    }
}

impl Handler for SshHandler {
    type Error = russh::Error;

    // Authentication is presently unconstrained: anyone who was handed a
    // tunnel identifier may bind it.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(user, client = %self.peer_addr, "accepting connection");
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        debug!(user, client = %self.peer_addr, "accepting connection");
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(user, client = %self.peer_addr, "accepting connection");
        Ok(Auth::Accept)
    }

    // No shell, no exec, no PTY: a session channel only gets the greeting and
    // then stays open until the connection closes.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if let Err(error) = channel.data(GREETING).await {
            debug!(%error, client = %self.peer_addr, "failed to write greeting");
        }

        self.session_channels.push(channel);

        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!(client = %self.peer_addr, address, port = *port, "received forward request");

        // The bind address carries a tunnel identifier, which must have been
        // registered through the HTTP API first. The port is ignored.
        let Some(tunnel) = self.state.tunnels.lookup(address) else {
            warn!(client = %self.peer_addr, address, "tunnel not found");
            return Ok(false);
        };

        let handle = session.handle();
        let id = address.to_owned();
        let state = self.state.clone();
        let bound = self.bound.clone();
        let peer_addr = self.peer_addr;

        // The probe needs the session loop free to deliver the channel-open
        // confirmation, so binding completes on its own task. Until it does,
        // the tunnel stays unbound and proxy requests keep failing.
        ChildTask::spawn(async move {
            match bind_and_probe(&state, handle, &id, tunnel.local_addr, peer_addr).await {
                Ok(scheme) => {
                    bound.lock().insert(id.clone());
                    info!(tunnel = %id, %scheme, client = %peer_addr, "tunnel bound");
                }
                Err(error) => {
                    warn!(tunnel = %id, error = format!("{error:#}"), "failed to bind tunnel");
                }
            }
        })
        .detach();

        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!(client = %self.peer_addr, address, "received cancel request");

        self.state.tunnels.remove(address);
        self.bound.lock().remove(address);

        Ok(true)
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        // Dropping the retained channels closes any open session channels
        // along with the connection.
        if !self.session_channels.is_empty() {
            debug!(
                sessions = self.session_channels.len(),
                client = %self.peer_addr,
                "closing session channels",
            );
        }

        for id in self.bound.lock().drain() {
            if self.state.tunnels.remove(&id) {
                debug!(tunnel = %id, client = %self.peer_addr, "tunnel detached on connection close");
            }
        }
    }
}

async fn bind_and_probe(
    state: &AppState,
    handle: russh::server::Handle,
    id: &str,
    local_addr: LocalAddr,
    peer_addr: SocketAddr,
) -> anyhow::Result<Scheme> {
    let channel = handle
        .channel_open_forwarded_tcpip(id, FORWARD_BIND_PORT, "", 0)
        .await
        .context("failed to open SSH channel")?;

    let transport = ChannelTransport::new(channel, peer_addr);
    let scheme = proxy::probe_scheme(transport, &local_addr).await?;

    // The tunnel may have been cancelled while the probe was in flight; only
    // a still-registered identifier becomes reachable.
    anyhow::ensure!(
        state.tunnels.bind(id, SshConn { handle, peer_addr }),
        "tunnel was removed while probing"
    );
    state.tunnels.set_scheme(id, scheme);

    Ok(scheme)
}
