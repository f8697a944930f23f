//! Common test utilities for relay integration tests.

pub mod fixtures;

use std::net::SocketAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use prism_relay::{Relay, RelayConfig};

/// An in-process relay on an ephemeral port.
pub struct TestRelay {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TestRelay {
    /// Starts a relay with the given configuration. The listen port is
    /// forced to 0 so tests never collide.
    pub async fn start(mut config: RelayConfig) -> Self {
        config.listen.host = "127.0.0.1".to_owned();
        config.listen.port = 0;

        let relay = Relay::new(config);
        let listener = relay.bind().await.expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        let shutdown = relay.shutdown_token();

        tokio::spawn(async move {
            let _ = relay.serve(listener).await;
        });

        Self { addr, shutdown }
    }

    /// Starts a relay with timing shortened for tests.
    pub async fn start_fast() -> Self {
        Self::start(fast_config()).await
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Configuration with short timers so lifecycle tests run in
/// milliseconds instead of the production seconds.
pub fn fast_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.heartbeat.interval = Duration::from_millis(200);
    config.heartbeat.max_missed = 3;
    config.heartbeat.reload_grace = Duration::from_millis(800);
    config.requests.default_timeout = Duration::from_millis(2_000);
    config.requests.first_frame_timeout = Duration::from_millis(1_000);
    config
}

/// Fast configuration with the per-instance queue enabled.
pub fn queued_config(capacity: usize) -> RelayConfig {
    let mut config = fast_config();
    config.queue.enabled = true;
    config.queue.capacity = capacity;
    config
}

/// Fast configuration with liveness slowed down, for tests that keep an
/// editor deliberately unresponsive to commands for a while.
pub fn patient_heartbeat_config() -> RelayConfig {
    let mut config = fast_config();
    config.heartbeat.interval = Duration::from_secs(2);
    config
}
