//! Serves the driver API on the plugin unix socket

use anyhow::{Context, Result};
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::path::Path;
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use ovsnet_core::Cancellation;

/// Bind `path`, replacing a socket left behind by an earlier run.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory {}", parent.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("Failed to bind {}", path.display()))
}

/// Accept connections until `cancel` fires, then remove the socket file.
pub async fn serve(listener: UnixListener, path: &Path, router: Router, cancel: Cancellation) -> Result<()> {
    info!("Remote driver API listening on unix:{}", path.display());

    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("Failed to accept plugin connection: {}", e);
                    continue;
                }
            },
        };

        let router = router.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = TowerToHyperService::new(router);

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Plugin connection error: {}", e);
            }
        });
    }

    info!("Remote driver API stopped");
    if let Err(e) = std::fs::remove_file(path) {
        debug!("Could not remove socket {}: {}", path.display(), e);
    }
    Ok(())
}
