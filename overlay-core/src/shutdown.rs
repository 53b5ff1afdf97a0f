use std::sync::Arc;
use tokio::sync::watch;

/// A struct which can be used to shut down a registry or overlay node.
/// You can create multiple connected shutdowns by cloning.
///
/// The signal is level-triggered: a task that starts waiting after the
/// shutdown was sent still sees it.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// This channel can be used to tell every listening task to stop.
    notify: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Creates a new active shutdown.
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            notify: Arc::new(notify),
        }
    }

    /// Signals all `Shutdown`s cloned from this one.
    pub fn shut_down(&self) {
        self.notify.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.notify.borrow()
    }

    /// Waits until a shutdown has been signalled.
    pub async fn wait_for_shutdown(&self) {
        let mut recv = self.notify.subscribe();
        loop {
            if *recv.borrow_and_update() {
                return;
            }
            // the sender lives as long as self, so this cannot fail
            if recv.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_active() {
        let shut0 = Shutdown::new();
        let shuts = [shut0.clone(), shut0.clone(), shut0.clone()];
        assert!(!shut0.is_shut_down());

        shuts[0].shut_down();

        for shut in shuts {
            assert!(shut.is_shut_down());
            shut.wait_for_shutdown().await;
        }
    }

    #[tokio::test]
    async fn waiters_are_woken() {
        let shutdown = Shutdown::new();
        let waiter = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.wait_for_shutdown().await }
        });
        tokio::task::yield_now().await;
        shutdown.shut_down();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
