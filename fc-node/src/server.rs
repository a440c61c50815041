//! Duty command acceptor
//!
//! Any number of coordinators may connect, up to the configured limit. Each
//! connection is read in bounded chunks and every duty token is applied in
//! the order it arrived.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

use fc_core::shutdown::ShutdownReceiver;
use fc_protocol::{parse_duty_commands, MAX_MESSAGE_SIZE};

use crate::agent::NodeAgent;

/// Live connection count, decremented when the guard drops
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn try_acquire(active: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        let current = active.load(Ordering::SeqCst);
        if current >= limit {
            return None;
        }
        active.fetch_add(1, Ordering::SeqCst);
        Some(Self {
            active: active.clone(),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accept command connections until shutdown
pub async fn run_server(
    listener: TcpListener,
    agent: Arc<NodeAgent>,
    max_connections: usize,
    mut shutdown: ShutdownReceiver,
) {
    let active = Arc::new(AtomicUsize::new(0));
    let mut total: u64 = 0;

    match listener.local_addr() {
        Ok(addr) => info!("Command server listening on {} (max {} connections)", addr, max_connections),
        Err(_) => info!("Command server listening (max {} connections)", max_connections),
    }

    loop {
        tokio::select! {
            _ = fc_core::shutdown::requested(&mut shutdown) => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let slot = match ConnectionSlot::try_acquire(&active, max_connections) {
                            Some(slot) => slot,
                            None => {
                                warn!("Connection limit reached ({}), rejecting {}", max_connections, peer);
                                drop(stream);
                                continue;
                            }
                        };

                        total += 1;
                        info!("Coordinator connected from {}", peer);
                        let agent = agent.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            let _slot = slot;
                            handle_client(stream, agent, shutdown).await;
                            info!("Coordinator {} disconnected", peer);
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                }
            }
        }
    }

    info!("Command server stopped (handled {} total connections)", total);
}

async fn handle_client(mut stream: TcpStream, agent: Arc<NodeAgent>, mut shutdown: ShutdownReceiver) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    loop {
        let n = tokio::select! {
            _ = fc_core::shutdown::requested(&mut shutdown) => return,
            read = stream.read(&mut buf) => match read {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    debug!("Read error: {}", e);
                    return;
                }
            },
        };

        trace!(bytes = n, "Command chunk");
        for token in parse_duty_commands(&buf[..n]) {
            let duty = match token {
                Ok(duty) => duty,
                Err(e) => {
                    debug!("Ignoring command: {}", e);
                    continue;
                }
            };

            let agent = agent.clone();
            match tokio::task::spawn_blocking(move || agent.apply_command(duty)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(duty = duty, kind = %e.kind(), "Command failed: {}", e),
                Err(e) => error!("Command task panicked: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{NodeControl, NodeHardware};
    use fc_core::hw::{PulseCounter, PwmOutput};
    use fc_core::{Result, TemperatureUnit};
    use std::time::{Duration, Instant};
    use tokio::io::AsyncWriteExt;

    struct NullPwm;

    impl PwmOutput for NullPwm {
        fn set_duty(&mut self, _percent: u8) -> Result<()> {
            Ok(())
        }

        fn release(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct NullCounter;

    impl PulseCounter for NullCounter {
        fn tally(&self) -> Result<u64> {
            Ok(0)
        }

        fn reset_tally(&self) -> Result<()> {
            Ok(())
        }
    }

    fn agent() -> Arc<NodeAgent> {
        let hardware = NodeHardware {
            pwm: Box::new(NullPwm),
            counter: Arc::new(NullCounter),
            probe: None,
        };
        let control = NodeControl::new(100, 2, Instant::now()).unwrap();
        Arc::new(NodeAgent::new(control, hardware, TemperatureUnit::Fahrenheit))
    }

    async fn start(agent: Arc<NodeAgent>, limit: usize) -> (String, fc_core::shutdown::ShutdownSender) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = fc_core::shutdown::channel();
        tokio::spawn(run_server(listener, agent, limit, rx));
        (addr, tx)
    }

    async fn wait_for_target(agent: &NodeAgent, target: u8) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while agent.control().ramp().desired_target() != target {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_slot_released_on_drop() {
        let active = Arc::new(AtomicUsize::new(0));
        let first = ConnectionSlot::try_acquire(&active, 1).unwrap();
        assert!(ConnectionSlot::try_acquire(&active, 1).is_none());
        drop(first);
        assert!(ConnectionSlot::try_acquire(&active, 1).is_some());
    }

    #[tokio::test]
    async fn test_command_sets_target() {
        let agent = agent();
        let (addr, _tx) = start(agent.clone(), 4).await;

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        stream.write_all(b"62").await.unwrap();
        wait_for_target(&agent, 62).await;
    }

    #[tokio::test]
    async fn test_tokens_apply_in_order_and_junk_is_ignored() {
        let agent = agent();
        let (addr, _tx) = start(agent.clone(), 4).await;

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        stream.write_all(b"70 fast 45").await.unwrap();
        wait_for_target(&agent, 45).await;
    }

    #[tokio::test]
    async fn test_connection_over_limit_is_dropped() {
        let agent = agent();
        let (addr, _tx) = start(agent.clone(), 1).await;

        let _first = TcpStream::connect(&addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(&addr).await.unwrap();
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
