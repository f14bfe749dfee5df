use tokio::sync::watch;

/// Process-wide stop signal. Dropping the handle counts as a stop.
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (StopHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, Shutdown { rx })
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once a stop has been signalled.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_resolves_after_stop() {
        let (handle, mut sd) = channel();
        assert!(!sd.is_stopped());
        let waiter = tokio::spawn(async move {
            sd.wait().await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropped_handle_stops() {
        let (handle, mut sd) = channel();
        drop(handle);
        assert!(sd.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), sd.wait()).await.unwrap();
    }
}
