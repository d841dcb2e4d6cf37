use anyhow::Result;
use lib_feedmux::{Multiplexer, StompWsLinkFactory};
use std::sync::Arc;
use tokio::signal;

mod feedmux_logic;
use feedmux_logic::{config, downstream, logger};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), &config.log_level())?;

    let (mut mux, inbox) = Multiplexer::new(Arc::new(StompWsLinkFactory), config.mux_settings());
    if let Some(path) = &config.providers_path {
        let providers = config::load_providers(path)?;
        log::info!("Registering {} providers from {}", providers.len(), path.display());
        for provider in providers {
            mux.register(provider)?;
        }
    }
    let mux_handle = mux.handle();

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let mux_task = tokio::spawn(mux.run(inbox));
    let downstream_task = tokio::spawn(downstream::run(
        config.clone(),
        mux_handle.clone(),
        shutdown_tx.subscribe(),
    ));

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = mux_handle.shutdown();

    let (_, served) = tokio::try_join!(mux_task, downstream_task)?;
    if let Err(e) = served {
        log::error!("Downstream server failed: {:#}", e);
    }

    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
