use anyhow::Context as _;
use tracing::info;
use tunneler::config::Conf;
use tunneler::service::TunnelerService;

fn main() -> anyhow::Result<()> {
    let conf = Conf::init().context("invalid configuration")?;

    let mut service = TunnelerService::load(conf).context("service loading failed")?;

    service.start().context("failed to start service")?;

    // Waiting for some stop signals (CTRL-C…)
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to create signal runtime")?;
    rt.block_on(build_signals_fut())?;

    info!("shutting down");

    service.stop();

    Ok(())
}

#[cfg(unix)]
async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate_signal =
        signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut quit_signal = signal(SignalKind::quit()).context("failed to create quit signal stream")?;
    let mut interrupt_signal =
        signal(SignalKind::interrupt()).context("failed to create interrupt signal stream")?;

    futures::future::select_all(vec![
        Box::pin(terminate_signal.recv()),
        Box::pin(quit_signal.recv()),
        Box::pin(interrupt_signal.recv()),
    ])
    .await;

    Ok(())
}

#[cfg(not(unix))]
async fn build_signals_fut() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("CTRL_C signal failed")
}
