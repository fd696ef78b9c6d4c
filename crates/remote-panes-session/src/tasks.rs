//! Spawned helpers owned by the session actor.

use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
pub struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Post `event` to `tx` after `delay` unless the guard is dropped first.
pub fn after<E: Send + 'static>(delay: Duration, tx: &mpsc::UnboundedSender<E>, event: E) -> TaskGuard {
    let tx = tx.clone();
    TaskGuard(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(event);
    }))
}

/// Forward every item from `rx` into `tx`, wrapped by `wrap`.
pub fn forward<T, E, F>(mut rx: mpsc::UnboundedReceiver<T>, tx: &mpsc::UnboundedSender<E>, wrap: F) -> TaskGuard
where
    T: Send + 'static,
    E: Send + 'static,
    F: Fn(T) -> E + Send + 'static,
{
    let tx = tx.clone();
    TaskGuard(tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if tx.send(wrap(item)).is_err() {
                break;
            }
        }
    }))
}
