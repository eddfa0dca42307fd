use std::{future::Future, pin::Pin, sync::Arc};

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{Delivery, MemoryStore, MimeParser, ParseError, ParsedMessage};

/// Result type for handler operations.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Boxed future type for handler operations, enabling object safety.
///
/// Resolves to the identifier the delivery was stored under.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult<String>> + Send + 'a>>;

/// Errors that can occur while handling a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The delivered bytes are not a readable message.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    /// The handler itself failed, unrelated to the message content.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Trait for handlers receiving completed SMTP deliveries.
///
/// The SMTP session acknowledges a delivery only once the returned future
/// resolves successfully.
pub trait MessageHandler: Send + Sync {
    /// Handles a completed delivery.
    fn handle(&self, delivery: Delivery) -> HandlerFuture<'_>;

    /// Returns the name of this handler.
    fn name(&self) -> &str;
}

/// Handler that parses deliveries and captures them into a [`MemoryStore`].
///
/// Messages without a `Message-ID` header are stored under a synthesized
/// `<uuid>@<hostname>` identifier.
pub struct CaptureHandler {
    store: Arc<MemoryStore>,
    parser: MimeParser,
    hostname: String,
}

impl CaptureHandler {
    pub fn new(store: Arc<MemoryStore>, parser: MimeParser, hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        info!(
            capacity = store.capacity().get(),
            headers = ?parser.header_mode(),
            hostname = %hostname,
            "Capture handler initialized"
        );
        Self {
            store,
            parser,
            hostname,
        }
    }

    fn fallback_id(&self) -> String {
        format!("{}@{}", Uuid::new_v4(), self.hostname)
    }
}

impl MessageHandler for CaptureHandler {
    fn handle(&self, delivery: Delivery) -> HandlerFuture<'_> {
        Box::pin(async move {
            let raw: Arc<[u8]> = delivery.raw.into();
            let parser = self.parser;
            let received_at = delivery.received_at;

            // Parsing is CPU bound and unbounded in message size, keep it off
            // the reactor threads.
            let bytes = raw.clone();
            let parsed = tokio::task::spawn_blocking(move || parser.parse(&bytes, received_at))
                .await
                .map_err(|e| HandlerError::Internal(e.to_string()))?;

            let ParsedMessage {
                mut message,
                attachments,
            } = parsed.inspect_err(|e| {
                info!(
                    from = %delivery.envelope_from,
                    client = ?delivery.client_ip,
                    size = raw.len(),
                    error = %e,
                    "Rejected unparsable email"
                );
            })?;

            if message.message_id.is_empty() {
                message.message_id = self.fallback_id();
                debug!(message_id = %message.message_id, "Synthesized message identifier");
            }
            let message_id = message.message_id.clone();
            let size = raw.len();

            let evicted = self.store.insert(message, raw, attachments);
            info!(
                message_id = %message_id,
                from = %delivery.envelope_from,
                to = ?delivery.envelope_to,
                client = ?delivery.client_ip,
                helo = ?delivery.helo_domain,
                size = size,
                evicted = evicted.len(),
                "Received email"
            );
            Ok(message_id)
        })
    }

    fn name(&self) -> &str {
        "capture"
    }
}
