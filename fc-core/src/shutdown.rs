//! Process shutdown signalling
//!
//! One `watch` channel per process. The signal task flips it to `true` on
//! SIGINT or SIGTERM and every periodic task selects on it.

use tokio::sync::watch;
use tracing::{info, warn};

/// Sending side; dropping it also stops every listener
pub type ShutdownSender = watch::Sender<bool>;

/// Receiving side handed to each task
pub type ShutdownReceiver = watch::Receiver<bool>;

pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    watch::channel(false)
}

/// Resolve once shutdown has been requested or the sender is gone
pub async fn requested(rx: &mut ShutdownReceiver) {
    // An Err means the sender was dropped, which also means stop
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Wait for SIGINT or SIGTERM
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGNAL: Received SIGINT"),
                    _ = term.recv() => info!("SIGNAL: Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to wait for SIGINT: {}", e);
        std::future::pending::<()>().await;
    }
    info!("SIGNAL: Received SIGINT");
}

/// Spawn the signal task that trips `tx`
pub fn spawn_signal_task(tx: ShutdownSender) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        tx.send_replace(true);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_requested_resolves_on_flip() {
        let (tx, mut rx) = channel();
        let waiter = tokio::spawn(async move { requested(&mut rx).await });
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_requested_resolves_when_sender_dropped() {
        let (tx, mut rx) = channel();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), requested(&mut rx))
            .await
            .unwrap();
    }
}
