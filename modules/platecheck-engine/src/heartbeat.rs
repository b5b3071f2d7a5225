// Cancellable periodic tick, used to bump liveness timestamps on tasks and
// bulk jobs while work is in flight.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Heartbeat {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Start ticking. The first tick fires after one full interval; a zero
    /// interval disables ticking entirely.
    pub fn start<F, Fut>(interval: Duration, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (stop, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            if interval.is_zero() {
                let _ = rx.changed().await;
                return;
            }
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = tokio::time::sleep(interval) => tick().await,
                }
            }
        });
        Self { stop, handle }
    }

    /// Stop ticking and wait for the loop to exit, so no tick can land after
    /// the final state write.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}
