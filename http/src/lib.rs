//! HTTP API over the captured mailbox.

pub mod routes;

pub use routes::*;

use std::{convert::Infallible, sync::Arc, time::Duration};

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request};
use hyper_util::rt::TokioIo;
use mailsink_utils::{AuthEngine, HttpConfig, MemoryAuthEngine, MemoryStore};
use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, info, warn};

/// Time given to open connections to finish once shutdown was requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpServer {
    bind_addr: String,
    router: Arc<Router>,
}

impl HttpServer {
    pub fn new(config: &HttpConfig, store: Arc<MemoryStore>) -> Self {
        let auth = config.auth.as_ref().map(|credentials| {
            Arc::new(MemoryAuthEngine::from_credentials(credentials)) as Arc<dyn AuthEngine>
        });
        Self {
            bind_addr: config.bind_addr(),
            router: Arc::new(Router::new(store, auth)),
        }
    }

    pub async fn run(self, must_exit: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        self.serve(listener, must_exit).await
    }

    pub async fn serve(
        self,
        listener: TcpListener,
        mut must_exit: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(address = %listener.local_addr()?, "HTTP server listening");

        let mut connections = FuturesUnordered::new();
        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept HTTP connection");
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
            debug!(client = %remote_addr, "Accepted HTTP connection");

            let router = self.router.clone();
            connections.push(tokio::spawn(async move {
                let service = service_fn(|request: Request<Incoming>| {
                    let router = router.clone();
                    async move {
                        let response = router.handle(&request);
                        debug!(
                            method = %request.method(),
                            path = %request.uri().path(),
                            status = response.status().as_u16(),
                            "Handled request"
                        );
                        Ok::<_, Infallible>(response)
                    }
                });
                match http1::Builder::new()
                    .serve_connection(TokioIo::new(socket), service)
                    .await
                {
                    Err(e) => warn!(error = ?e, "HTTP connection failed"),
                    Ok(()) => debug!(client = %remote_addr, "HTTP connection closed"),
                }
            }));
        }
        drop(listener);

        info!(open = connections.len(), "HTTP server shutting down, draining connections");
        if tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("HTTP connections still open after drain timeout");
        }
        Ok(())
    }
}
