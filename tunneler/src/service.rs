use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::runtime::{self, Runtime};
use tunneler_task::{ChildTask, ShutdownHandle, ShutdownSignal, Task};

use crate::config::Conf;
use crate::listener::{self, GatewayListener, ListenerKind};
use crate::log::LoggerGuard;
use crate::ssh::SshPlane;
use crate::tunnel::TunnelStore;
use crate::{AppState, BoundAddrs};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[allow(clippy::large_enum_variant)] // `Running` variant is bigger than `Stopped` but we don't care
enum ServiceState {
    Stopped,
    Running {
        shutdown_handle: ShutdownHandle,
        runtime: Runtime,
    },
}

pub struct TunnelerService {
    conf: Arc<Conf>,
    state: ServiceState,
    _logger_guard: LoggerGuard,
}

impl TunnelerService {
    pub fn load(conf: Conf) -> anyhow::Result<Self> {
        let logger_guard = crate::log::init(None).context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        // rustls resolves its crypto provider process-wide; install it before
        // the first client or server config is built.
        let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

        Ok(TunnelerService {
            conf: Arc::new(conf),
            state: ServiceState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        // spawn_tasks needs to run in the runtime in order to bind the sockets.
        let (tasks, state) = runtime.block_on(spawn_tasks(self.conf.clone()))?;

        info!(
            ssh = %state.bound.ssh,
            http = %state.bound.http,
            https = %state.bound.https,
            "service started, ready to accept requests",
        );

        let Tasks {
            inner,
            shutdown_handle,
            shutdown_signal: _,
        } = tasks;

        let mut join_all =
            futures::future::select_all(inner.into_iter().map(|child| Box::pin(child.join())));

        runtime.spawn(async {
            loop {
                let (result, _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!("A task terminated gracefully"),
                    Ok(Err(error)) => error!(error = format!("{error:#}"), "A task failed"),
                    Err(error) => error!(%error, "Something went very wrong with a task"),
                }

                if rest.is_empty() {
                    break;
                } else {
                    join_all = futures::future::select_all(rest);
                }
            }
        });

        self.state = ServiceState::Running {
            shutdown_handle,
            runtime,
        };

        Ok(())
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, ServiceState::Stopped) {
            ServiceState::Stopped => {
                info!("Attempted to stop the service, but it's already stopped");
            }
            ServiceState::Running {
                shutdown_handle,
                runtime,
            } => {
                info!("Stopping service");

                shutdown_handle.signal();

                runtime.block_on(async {
                    tokio::select! {
                        _ = shutdown_handle.all_closed() => {
                            debug!("All tasks are terminated");
                        }
                        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
                            warn!("Shutdown deadline expired, terminating lingering tasks forcefully");
                        }
                    }
                });

                // Wait for 1 more second before forcefully shutting down the runtime
                runtime.shutdown_timeout(Duration::from_secs(1));
            }
        }
    }
}

pub struct Tasks {
    inner: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl Tasks {
    fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        Self {
            inner: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: Task<Output = anyhow::Result<()>> + 'static,
    {
        let child = tunneler_task::spawn_task(task, self.shutdown_signal.clone());
        self.inner.push(child);
    }

    pub fn shutdown_handle(&self) -> &ShutdownHandle {
        &self.shutdown_handle
    }
}

/// Binds the three listeners (fail fast, in order: SSH, HTTP, HTTPS), builds
/// the shared state and spawns the three server tasks. Must run inside a
/// tokio runtime.
pub async fn spawn_tasks(conf: Arc<Conf>) -> anyhow::Result<(Tasks, AppState)> {
    let ssh_listener =
        listener::bind(conf.ssh_addr).context("failed to initialize ssh listener")?;
    let http_listener =
        listener::bind(conf.http_addr).context("failed to initialize http listener")?;
    let https_listener =
        listener::bind(conf.https_addr).context("failed to initialize https listener")?;

    let bound = BoundAddrs {
        ssh: ssh_listener.local_addr().context("ssh listener address")?,
        http: http_listener.local_addr().context("http listener address")?,
        https: https_listener.local_addr().context("https listener address")?,
    };

    let state = AppState {
        conf,
        tunnels: TunnelStore::new(),
        bound,
    };

    let mut tasks = Tasks::new();

    tasks.register(SshPlane::new(ssh_listener, state.clone()));
    tasks.register(GatewayListener::new(
        http_listener,
        ListenerKind::Http,
        state.clone(),
    )?);
    tasks.register(GatewayListener::new(
        https_listener,
        ListenerKind::Https,
        state.clone(),
    )?);

    Ok((tasks, state))
}
