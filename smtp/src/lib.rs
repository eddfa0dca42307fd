//! SMTP listener capturing every accepted message into a [`MessageHandler`].
//!
//! The server never relays: a completed `DATA` phase is handed to the
//! handler and acknowledged only once the handler resolves.

pub mod session;

pub use session::*;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use mailsink_utils::{
    AuthEngine, MessageHandler, PermissiveAuthEngine, SenderPolicy, SmtpConfig,
};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tracing::{debug, info, warn};

/// Time given to open sessions to finish once shutdown was requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SmtpServer {
    bind_addr: String,
    context: Arc<SessionContext>,
}

impl SmtpServer {
    /// Creates a server accepting any SMTP credentials.
    pub fn new(config: &SmtpConfig, handler: Arc<dyn MessageHandler>) -> Self {
        Self::with_auth(config, handler, Arc::new(PermissiveAuthEngine))
    }

    pub fn with_auth(
        config: &SmtpConfig,
        handler: Arc<dyn MessageHandler>,
        auth: Arc<dyn AuthEngine>,
    ) -> Self {
        Self {
            bind_addr: config.bind_addr(),
            context: Arc::new(SessionContext {
                hostname: config.hostname.clone(),
                policy: SenderPolicy::new(config.whitelist.iter().cloned()),
                auth,
                handler,
                max_message_size: config.max_message_size,
                advertise_auth: config.advertise_auth,
            }),
        }
    }

    /// Binds the configured address and serves until `must_exit` flips.
    pub async fn run(self, must_exit: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        self.serve(listener, must_exit).await
    }

    /// Serves sessions from an already bound listener.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut must_exit: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            address = %listener.local_addr()?,
            hostname = %self.context.hostname,
            whitelist = self.context.policy.is_restricted(),
            "SMTP server listening"
        );

        let mut connections = FuturesUnordered::new();
        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept SMTP connection");
                        continue;
                    }
                },
                _ = wait_conn_finished => continue,
                changed = must_exit.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            debug!(client = %remote_addr, "Accepted SMTP connection");

            let context = self.context.clone();
            connections.push(tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, remote_addr, context).await {
                    warn!(client = %remote_addr, error = %e, "SMTP session failed");
                }
            }));
        }
        drop(listener);

        info!(open = connections.len(), "SMTP server shutting down, draining sessions");
        if tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("SMTP sessions still open after drain timeout");
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    context: Arc<SessionContext>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut session = SmtpSession::new(context, Some(remote_addr.ip()));
    session.run(&mut reader, &mut writer).await
}
