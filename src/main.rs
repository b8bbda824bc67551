use anyhow::{anyhow, Result};
use multiproxy::{config::CliArgs, listener, logger, tls};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn main() -> Result<()> {
    let cli = CliArgs::parse_args();
    cli.validate()?;
    logger::init_logger(cli.log_level, cli.log_file.as_deref())?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install the rustls crypto provider"))?;

    let config = cli.into_server_config();
    let acceptor = config.tls.as_ref().map(tls::load_tls_acceptor).transpose()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        tokio::spawn(wait_for_signal(shutdown.clone()));

        listener::serve(config, acceptor, shutdown).await?;
        info!("proxy stopped");
        Ok::<_, anyhow::Error>(())
    })
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                (Err(err), _) | (_, Err(err)) => {
                    error!(error = %err, "cannot listen for signals");
                    return;
                }
            };

        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "cannot listen for ctrl-c");
            return;
        }
        info!("ctrl-c received");
    }

    shutdown.cancel();
}
