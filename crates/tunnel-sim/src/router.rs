//! Tag-keyed dispatch of envelopes to worker-side handlers.

use crate::BoxError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tunnel_core::{CodecError, Envelope, Message};

type ErasedHandler =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<Envelope, RouterError>> + Send + Sync>;

/// Registry of message handlers keyed by envelope tag.
///
/// Workers populate it while configuring. Registering a tag twice replaces
/// the earlier handler.
///
/// ```ignore
/// router.register(|ping: Ping| async move { Ok(Pong { nonce: ping.nonce }) });
/// ```
#[derive(Default)]
pub struct Router {
    handlers: RwLock<HashMap<String, ErasedHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for envelopes tagged `Req::TAG`.
    ///
    /// Returns `true` if a previous handler was replaced.
    pub fn register<Req, Resp, F, Fut>(&self, handler: F) -> bool
    where
        Req: Message,
        Resp: Message,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, BoxError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |envelope: Envelope| {
            let handler = handler.clone();
            async move {
                let request = envelope.decode_payload::<Req>()?;
                let response = handler(request)
                    .await
                    .map_err(|source| RouterError::Handler {
                        tag: Req::TAG,
                        source,
                    })?;
                Ok::<_, RouterError>(Envelope::make(&response)?)
            }
            .boxed()
        });

        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Req::TAG.to_string(), erased)
            .is_some();
        if replaced {
            tracing::debug!(tag = Req::TAG, "replaced message handler");
        }
        replaced
    }

    /// Run the handler registered for `envelope`'s tag.
    pub async fn handle(&self, envelope: Envelope) -> Result<Envelope, RouterError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(envelope.tag())
            .cloned();
        let handler = handler.ok_or_else(|| RouterError::UnregisteredMessageType {
            tag: envelope.tag().to_string(),
        })?;
        handler(envelope).await
    }

    /// [`handle`](Self::handle) on raw envelope bytes.
    pub async fn handle_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>, RouterError> {
        let envelope = Envelope::from_bytes(bytes)?;
        Ok(self.handle(envelope).await?.to_bytes()?)
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tags.sort();
        tags
    }
}

/// Error dispatching an envelope.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no handler registered for `{tag}`")]
    UnregisteredMessageType { tag: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("`{tag}` handler failed: {source}")]
    Handler {
        tag: &'static str,
        source: BoxError,
    },
}
