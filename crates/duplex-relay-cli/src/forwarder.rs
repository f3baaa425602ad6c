use duplex_relay::{RelayConfig, RelayHandle, RelayPair, RelayTracker};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long live pairs get to close gracefully on shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors that can occur while forwarding
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to target address {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),
}

/// Forwarder configuration
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Address to accept connections on (host:port)
    pub listen: String,
    /// Address each accepted connection is paired with (host:port)
    pub target: String,
    /// Maximum number of live pairs (None = unlimited)
    pub max_pairs: Option<usize>,
    pub relay: RelayConfig,
}

/// Accepts TCP connections and relays each one to a freshly dialed target
pub struct Forwarder {
    config: ForwarderConfig,
    tracker: Arc<RelayTracker>,
    dialing: Arc<AtomicUsize>,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        Self {
            config,
            tracker: Arc::new(RelayTracker::new()),
            dialing: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of live pairs, including ones still dialing the target
    pub fn live_pairs(&self) -> usize {
        self.tracker.len() + self.dialing.load(Ordering::SeqCst)
    }

    /// Bind the listen address
    ///
    /// Retries up to 3 times, 1 second apart, while the address is in use
    /// (a previous instance may leave it in TIME_WAIT).
    pub async fn bind(&self) -> Result<TcpListener, ForwarderError> {
        let address = &self.config.listen;
        for attempt in 1..=3 {
            match TcpListener::bind(address).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!("Successfully bound to {} on attempt {}/3", address, attempt);
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Address {} is in use (attempt {}/3), retrying in 1 second...",
                        address, attempt
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(ForwarderError::Bind {
                        address: address.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(ForwarderError::Bind {
            address: address.clone(),
            reason: "Address in use after 3 retry attempts".to_string(),
        })
    }

    /// Accept connections until `shutdown` fires, then close all live pairs
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ForwarderError> {
        let addr = listener.local_addr()?;
        info!(
            "Forwarding connections from {} to {}",
            addr, self.config.target
        );

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            self.tracker.prune();
            if let Some(max_pairs) = self.config.max_pairs {
                if self.live_pairs() >= max_pairs {
                    warn!(
                        peer_addr = %peer_addr,
                        max_pairs = max_pairs,
                        "Refusing connection, pair limit reached"
                    );
                    drop(stream);
                    continue;
                }
            }

            debug!(peer_addr = %peer_addr, "Accepted connection");
            self.dialing.fetch_add(1, Ordering::SeqCst);

            let target = self.config.target.clone();
            let relay_config = self.config.relay.clone();
            let tracker = self.tracker.clone();
            let dialing = self.dialing.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                let dialed = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    dialed = dial(&target) => Some(dialed),
                };
                match dialed {
                    Some(Ok(upstream)) => {
                        let handle = RelayPair::new(stream, upstream, relay_config).spawn();
                        debug!(
                            pair_id = %handle.id(),
                            peer_addr = %peer_addr,
                            target = %target,
                            "Relaying connection"
                        );
                        track(&tracker, handle, &shutdown);
                    }
                    Some(Err(e)) => {
                        warn!(peer_addr = %peer_addr, "Dropping connection: {}", e);
                    }
                    None => debug!(peer_addr = %peer_addr, "Shutting down, dropping connection"),
                }
                dialing.fetch_sub(1, Ordering::SeqCst);
            });
        }

        info!(
            "Stopped accepting, closing {} live pairs",
            self.tracker.len()
        );
        let reports = self.tracker.shutdown(SHUTDOWN_GRACE).await;
        info!("Closed {} pairs", reports.len());

        Ok(())
    }
}

/// Register a new pair, closing it right away if shutdown already began
///
/// Shutdown drains the tracker after cancelling the token, so a pair
/// registered too late to be drained always sees the token cancelled.
fn track(tracker: &RelayTracker, handle: RelayHandle, shutdown: &CancellationToken) {
    let id = handle.id();
    tracker.register(handle);
    if shutdown.is_cancelled() {
        debug!(pair_id = %id, "Shutting down, closing new pair");
        tracker.close(&id);
    }
}

async fn dial(target: &str) -> Result<TcpStream, ForwarderError> {
    TcpStream::connect(target)
        .await
        .map_err(|e| ForwarderError::ConnectionFailed {
            address: target.to_string(),
            source: e,
        })
}
