//! Matching responses to the requests that caused them.

use crate::ResponseError;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use modnet_core::{Envelope, MessageId, ModuleId};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Resolves once with the response to one request.
///
/// Cloning yields another handle to the same pending response.
pub type ResponseFuture = Shared<BoxFuture<'static, Result<Envelope, ResponseError>>>;

struct Pending {
    tx: oneshot::Sender<Result<Envelope, ResponseError>>,
    future: ResponseFuture,
    target: Option<ModuleId>,
}

/// Table of outstanding requests keyed by request id.
///
/// Entries are removed exactly once: by the first matching response, by
/// [`fail`](Self::fail), or when the target connection goes away. There is
/// no built-in timeout.
#[derive(Default)]
pub struct ResponseCorrelator {
    pending: Mutex<HashMap<MessageId, Pending>>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The future for `request`, created on first call.
    pub fn get_future(&self, request: MessageId) -> ResponseFuture {
        self.track(request, None)
    }

    /// Like [`get_future`](Self::get_future), remembering which module must answer.
    pub fn track(&self, request: MessageId, target: Option<ModuleId>) -> ResponseFuture {
        let mut pending = self.pending.lock();
        pending
            .entry(request)
            .or_insert_with(|| {
                let (tx, rx) = oneshot::channel();
                let future = rx
                    .map(|result| result.unwrap_or(Err(ResponseError::Dropped)))
                    .boxed()
                    .shared();
                Pending { tx, future, target }
            })
            .future
            .clone()
    }

    /// Resolve the request `response` answers. Unknown ids are dropped.
    pub fn handle_response(&self, response: Envelope) -> bool {
        let Some(request) = response.in_reply_to else {
            return false;
        };
        let Some(entry) = self.pending.lock().remove(&request) else {
            tracing::trace!(%request, "dropping response to unknown request");
            return false;
        };
        let _ = entry.tx.send(Ok(response));
        true
    }

    /// Fail a pending request.
    pub fn fail(&self, request: MessageId, error: ResponseError) -> bool {
        let Some(entry) = self.pending.lock().remove(&request) else {
            return false;
        };
        let _ = entry.tx.send(Err(error));
        true
    }

    /// Fail every request waiting on `module`. Returns how many there were.
    pub fn fail_module(&self, module: ModuleId, error: ResponseError) -> usize {
        let failed: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let ids: Vec<MessageId> = pending
                .iter()
                .filter(|(_, p)| p.target == Some(module))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = failed.len();
        for entry in failed {
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}
