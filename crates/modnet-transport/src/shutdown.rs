use tokio::sync::watch;

/// One-shot broadcast telling background tasks to stop.
#[derive(Debug)]
pub(crate) struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.tx.subscribe())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Resolves once shutdown has been triggered.
    pub(crate) async fn wait(&mut self) {
        loop {
            let triggered = *self.0.borrow_and_update();
            if triggered || self.0.changed().await.is_err() {
                return;
            }
        }
    }
}
