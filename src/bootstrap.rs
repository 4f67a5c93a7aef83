//! Daemon assembly: storage, session, transports, readiness, shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use wabridge_core::bus::EventBus;
use wabridge_core::config::{Config, Mode};
use wabridge_core::shellexpand;
use wabridge_session::SessionService;
use wabridge_store::Store;

use crate::messaging::MessageService;
use crate::{mcp, rpc, stdio, watchdog};

/// How long the RPC listener gets to come up before boot is declared failed.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the daemon until shutdown. Returns only on a graceful exit; fatal
/// boot errors bubble up as `Err` (non-zero exit).
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // The watchdog outranks everything: a dead host means exit, promptly.
    if let Some(pid) = config.parent_pid {
        watchdog::spawn(pid, cancel.clone());
    }

    let store = Store::open(&config.db_path).await?;
    let bus = Arc::new(EventBus::new());

    let media_dir = config
        .media_dir
        .as_deref()
        .map(|dir| std::path::PathBuf::from(shellexpand(dir)));
    let session = Arc::new(
        SessionService::new(
            &config.device_db_path(),
            media_dir,
            store.clone(),
            Arc::clone(&bus),
        )
        .await?,
    );

    let service = Arc::new(MessageService::new(
        store.clone(),
        Arc::clone(&session),
        Arc::clone(&bus),
    ));

    // Transports. The RPC listener gates readiness.
    let (ready_tx, ready_rx) = oneshot::channel();
    let rpc_task = {
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        let addr = config.rpc_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = rpc::serve(&addr, service, cancel.clone(), ready_tx).await {
                error!("rpc server failed: {e}");
                cancel.cancel();
            }
        })
    };

    let mcp_task = {
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        let addr = config.mcp_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = mcp::serve(&addr, service, cancel.clone()).await {
                error!("mcp server failed: {e}");
                cancel.cancel();
            }
        })
    };

    // Hold boot until the RPC listener accepts, then signal the host.
    match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
        Ok(Ok(addr)) => {
            info!("transports up (rpc {addr}, mcp {})", config.mcp_addr);
        }
        Ok(Err(_)) | Err(_) => {
            cancel.cancel();
            anyhow::bail!(
                "rpc listener failed to start within {}s",
                READY_TIMEOUT.as_secs()
            );
        }
    }

    match config.mode {
        Mode::Server => {
            // The host's startup barrier. Nothing else writes to stdout in
            // server mode; logs go to stderr.
            {
                use std::io::Write;
                let mut stdout = std::io::stdout();
                write!(stdout, "ready\n")?;
                stdout.flush()?;
            }
            wait_for_shutdown(&cancel).await;
        }
        Mode::Headless => {
            let stdio_cancel = cancel.clone();
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = stdio::headless::run(Arc::clone(&service), stdio_cancel) => {
                    if let Err(e) = res {
                        error!("headless transport failed: {e}");
                    }
                }
                _ = shutdown_signal() => {}
            }
        }
        Mode::Interactive => {
            let stdio_cancel = cancel.clone();
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = stdio::interactive::run(Arc::clone(&service), stdio_cancel) => {
                    if let Err(e) = res {
                        error!("interactive transport failed: {e}");
                    }
                }
                _ = shutdown_signal() => {}
            }
        }
    }

    info!("shutting down");
    cancel.cancel();
    let _ = session.disconnect().await;
    // The RPC server drains in-flight requests with its own deadline.
    let _ = rpc_task.await;
    let _ = mcp_task.await;
    store.close().await;
    info!("bye");
    Ok(())
}

async fn wait_for_shutdown(cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = shutdown_signal() => {}
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
