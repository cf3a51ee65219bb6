//! Background services

pub mod check_scheduler;
pub mod publisher;
pub mod source_refresh;

pub use check_scheduler::CheckScheduler;
pub use publisher::SubscriptionPublisher;
pub use source_refresh::{load_descriptors, SourceRefreshService};

use tokio::sync::watch;

/// Handle for stopping a background service
pub struct ShutdownHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (Self { shutdown_tx }, shutdown_rx)
    }

    /// Another receiver for a second service sharing this handle
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
