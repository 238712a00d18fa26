//! Coordinated shutdown.
//!
//! One controller listens for SIGINT/SIGTERM and fans the signal out to
//! every background task through a watch channel, so the prober, recovery
//! timer, checkpointer and listener all stop taking new work without
//! interrupting whatever is in flight.

pub struct ShutdownController {
    sender: tokio::sync::watch::Sender<bool>,
}

impl ShutdownController {
    /// Creates a controller that trips on SIGINT/SIGTERM.
    pub fn new_shutdown_on_signal() -> Self {
        let controller = Self::new_manual();
        let sender = controller.sender.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            let _ = sender.send(true);
        });
        controller
    }

    /// Creates a controller tripped only by [`ShutdownController::shutdown`].
    pub fn new_manual() -> Self {
        let (sender, _) = tokio::sync::watch::channel(false);
        Self { sender }
    }

    /// A receiver that resolves `changed()` once shutdown begins.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<bool> {
        self.sender.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
    }

    /// Waits for the shutdown signal.
    pub async fn wait(&self) {
        let mut receiver = self.subscribe();
        if *receiver.borrow() {
            return;
        }
        let _ = receiver.changed().await;
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::{self, unix};
        let mut sigterm = match unix::signal(unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!(?err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_shutdown_reaches_all_subscribers() {
        let controller = ShutdownController::new_manual();
        let mut first = controller.subscribe();
        let mut second = controller.subscribe();
        controller.shutdown();
        first.changed().await.unwrap();
        second.changed().await.unwrap();
        assert!(*first.borrow());
    }

    #[tokio::test]
    async fn wait_returns_immediately_after_shutdown() {
        let controller = ShutdownController::new_manual();
        controller.shutdown();
        controller.wait().await;
    }
}
