//! Routing incoming messages to handlers.

use modnet_core::{ApplicationId, Body, Envelope, ModuleId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Handles one kind of incoming message.
///
/// Returning `Ok(Some(body))` sends `body` back to the sender as the
/// response. `Ok(None)` sends nothing. Errors and panics are logged and
/// treated like `Ok(None)`; the connection stays up.
///
/// Handlers run on a blocking thread, so they may take their time, but they
/// must not block on responses arriving over the same connection.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, remote: ModuleId, message: &Envelope) -> anyhow::Result<Option<Body>>;
}

struct FnHandler<F>(F);

impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(ModuleId, &Envelope) -> anyhow::Result<Option<Body>> + Send + Sync + 'static,
{
    fn handle(&self, remote: ModuleId, message: &Envelope) -> anyhow::Result<Option<Body>> {
        (self.0)(remote, message)
    }
}

/// Wrap a closure as a handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(ModuleId, &Envelope) -> anyhow::Result<Option<Body>> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HandlerKey {
    kind: String,
    application: ApplicationId,
}

/// Handler table keyed by message type and application.
pub struct Dispatcher {
    handlers: RwLock<HashMap<HandlerKey, Arc<dyn MessageHandler>>>,
    runtime: Option<Handle>,
}

impl Dispatcher {
    /// `runtime` is where handlers run; `None` means the current runtime.
    pub fn new(runtime: Option<Handle>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            runtime,
        }
    }

    /// Install or, with `None`, remove the handler for `kind` within
    /// `application`. Returns the handler previously installed.
    pub fn set_handler(
        &self,
        kind: &str,
        application: ApplicationId,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Option<Arc<dyn MessageHandler>> {
        let key = HandlerKey {
            kind: kind.to_string(),
            application,
        };
        let mut handlers = self.handlers.write();
        match handler {
            Some(handler) => handlers.insert(key, handler),
            None => handlers.remove(&key),
        }
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    /// The application's handler if there is one, else the default handler.
    pub fn handler_for(&self, message: &Envelope) -> Option<Arc<dyn MessageHandler>> {
        let handlers = self.handlers.read();
        let mut key = HandlerKey {
            kind: message.kind().to_string(),
            application: message.application_id.unwrap_or(ApplicationId::DEFAULT),
        };
        if let Some(handler) = handlers.get(&key) {
            return Some(handler.clone());
        }
        if key.application.is_default() {
            return None;
        }
        key.application = ApplicationId::DEFAULT;
        handlers.get(&key).cloned()
    }

    /// Run the matching handler and build the response, if any.
    pub async fn dispatch(&self, remote: ModuleId, message: Envelope) -> Option<Envelope> {
        let Some(handler) = self.handler_for(&message) else {
            tracing::debug!(%remote, kind = message.kind(), "no handler for message");
            return None;
        };
        let kind = message.kind().to_string();

        let work = move || {
            let result = handler.handle(remote, &message);
            (message, result)
        };
        let joined = match &self.runtime {
            Some(runtime) => runtime.spawn_blocking(work).await,
            None => tokio::task::spawn_blocking(work).await,
        };

        match joined {
            Ok((message, Ok(reply))) => reply.map(|body| message.reply(body)),
            Ok((_, Err(e))) => {
                tracing::warn!(%remote, kind = %kind, "handler failed: {:#}", e);
                None
            }
            Err(e) if e.is_panic() => {
                tracing::error!(%remote, kind = %kind, "handler panicked");
                None
            }
            Err(e) => {
                tracing::warn!(%remote, kind = %kind, "handler did not complete: {}", e);
                None
            }
        }
    }
}
