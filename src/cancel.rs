//! A small hand-rolled cancellation token over a `tokio::sync::watch`
//! channel. No dependency on `tokio-util`'s `CancellationToken`,
//! so this crate expresses the same idea directly over `tokio::sync::watch`.

use tokio::sync::watch;

#[derive(Clone)]
pub struct CancelToken {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelSignal { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel()` has been called. Cheap to poll in a
    /// `tokio::select!` alongside I/O.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        let _ = self.rx.changed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let (token, mut signal) = CancelToken::new();
        assert!(!signal.is_cancelled());
        token.cancel();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_resolves_immediately() {
        let (token, mut signal) = CancelToken::new();
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(50), signal.cancelled())
            .await
            .expect("already-cancelled signal must resolve immediately");
    }
}
