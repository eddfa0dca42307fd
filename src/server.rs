//! Wiring of the SMTP and HTTP listeners around one shared store.

use std::sync::Arc;

use anyhow::Result;
use mailsink_http::HttpServer;
use mailsink_smtp::SmtpServer;
use mailsink_utils::{CaptureHandler, Config, MemoryStore, MimeParser};
use tokio::{net::TcpListener, sync::watch, try_join};
use tracing::{error, info};

/// Both listeners sharing one store.
pub struct Server {
    smtp: SmtpServer,
    http: HttpServer,
}

impl Server {
    pub fn new(config: &Config) -> Self {
        let store = Arc::new(MemoryStore::new(config.store.max_messages));
        let handler = Arc::new(CaptureHandler::new(
            store.clone(),
            MimeParser::new(config.store.headers.into()),
            config.smtp.hostname.clone(),
        ));
        Self {
            smtp: SmtpServer::new(&config.smtp, handler),
            http: HttpServer::new(&config.http, store),
        }
    }

    /// Binds both configured addresses and serves until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        let (must_exit, _provoke_exit) = watch_ctrl_c();
        try_join!(
            self.smtp.run(must_exit.clone()),
            self.http.run(must_exit.clone())
        )?;
        info!("Mailsink stopped");
        Ok(())
    }

    /// Serves on already bound listeners until `must_exit` flips.
    pub async fn serve(
        self,
        smtp: TcpListener,
        http: TcpListener,
        must_exit: watch::Receiver<bool>,
    ) -> Result<()> {
        try_join!(
            self.smtp.serve(smtp, must_exit.clone()),
            self.http.serve(http, must_exit.clone())
        )?;
        Ok(())
    }
}

/// Returns a shutdown signal flipped to `true` on Ctrl+C, along with its
/// sender so that callers may also trigger it.
pub fn watch_ctrl_c() -> (watch::Receiver<bool>, Arc<watch::Sender<bool>>) {
    let (send_cancel, watch_cancel) = watch::channel(false);
    let send_cancel = Arc::new(send_cancel);
    let send_cancel_2 = send_cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        info!("Received Ctrl+C, shutting down");
        let _ = send_cancel.send(true);
    });
    (watch_cancel, send_cancel_2)
}
