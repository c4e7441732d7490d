use crate::chord::actor::ChordHandle;
use crate::chord::types::{IdSpace, NodeInfo, RingEvent, RingSnapshot, RingState};
use crate::chord::workers::{run_predecessor_heartbeat, run_successor_heartbeat};
use crate::error::{ChordError, RingletError};
use crate::network::transport::UdpTransport;
use crate::network::PeerConfig;
use futures::future::join_all;
use log::{debug, error, info};
use std::net::SocketAddr;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// A ring member: the UDP socket, the actor that owns its state, and the
/// heartbeat tasks once maintenance has started.
pub struct ChordPeer {
    chord_handle: ChordHandle,
    node: NodeInfo,
    config: PeerConfig,
    shutdown_tx: watch::Sender<bool>,
    actor_task: Option<JoinHandle<()>>,
    worker_tasks: Vec<JoinHandle<()>>,
}

impl ChordPeer {
    /// Binds the socket and starts dispatching. The node stays detached
    /// until `create_network` or `join`.
    pub async fn bind(config: PeerConfig) -> Result<Self, RingletError> {
        config.validate()?;
        let space = IdSpace::new(config.ring_bits)?;

        let transport = UdpTransport::bind(config.bind_addr).await?;
        let node = NodeInfo::new(&space, transport.local_addr());
        info!("Node {} bound on {} (m = {})", node.id, node.addr, space.bits());
        if config.replication_factor > 1 {
            debug!(
                "Replication factor {} accepted; keys are stored on their owner only",
                config.replication_factor
            );
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (chord_handle, actor) = ChordHandle::new(
            RingState::new(space, node),
            transport,
            shutdown_rx,
            config.join_timeout,
            config.request_timeout,
        );
        let actor_task = tokio::spawn(actor.run());

        Ok(Self {
            chord_handle,
            node,
            config,
            shutdown_tx,
            actor_task: Some(actor_task),
            worker_tasks: Vec::new(),
        })
    }

    pub fn handle(&self) -> ChordHandle {
        self.chord_handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.node.addr
    }

    pub fn node(&self) -> NodeInfo {
        self.node
    }

    /// Becomes the sole member of a new ring
    pub async fn create_network(&self) -> Result<(), ChordError> {
        info!("Creating new ring at {}", self.node);
        self.chord_handle.create().await
    }

    pub async fn join(&self, bootstrap: SocketAddr) -> Result<(), ChordError> {
        info!("Attempting to join ring through {}", bootstrap);
        match self.chord_handle.join(bootstrap).await {
            Ok(()) => {
                info!("Node {} joined the ring", self.node);
                Ok(())
            }
            Err(e) => {
                error!("Failed to join through {}: {}", bootstrap, e);
                Err(e)
            }
        }
    }

    /// Spawns the successor and predecessor heartbeat tasks. Idempotent.
    pub fn start_maintenance(&mut self) {
        if !self.worker_tasks.is_empty() {
            return;
        }
        let period = self.config.heartbeat_interval;
        self.worker_tasks.push(tokio::spawn(run_successor_heartbeat(
            self.chord_handle.clone(),
            period,
            self.shutdown_tx.subscribe(),
        )));
        self.worker_tasks.push(tokio::spawn(run_predecessor_heartbeat(
            self.chord_handle.clone(),
            period,
            self.shutdown_tx.subscribe(),
        )));
        info!("Maintenance workers started");
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, ChordError> {
        self.chord_handle.get(key).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), ChordError> {
        self.chord_handle.set(key, value).await
    }

    pub async fn lookup(&self, key: &str) -> Result<SocketAddr, ChordError> {
        self.chord_handle.lookup(key).await
    }

    pub async fn snapshot(&self) -> Result<RingSnapshot, ChordError> {
        self.chord_handle.snapshot().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RingEvent> {
        self.chord_handle.subscribe()
    }

    /// Stops the actor and the heartbeat tasks and waits for them to exit
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);

        let mut tasks: Vec<JoinHandle<()>> = self.worker_tasks.drain(..).collect();
        tasks.extend(self.actor_task.take());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Task ended abnormally: {}", e);
            }
        }
        info!("Node {} shut down", self.node);
    }

    /// Serves until Ctrl-C, then shuts down
    pub async fn run(&mut self) {
        info!("Node {} running, Ctrl-C to stop", self.node);
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Cannot listen for Ctrl-C, stopping: {}", e),
        }
        self.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chord::types::RingPhase;
    use crate::error::ConfigError;
    use std::time::Duration;

    #[tokio::test]
    async fn bind_rejects_invalid_config() {
        let config = PeerConfig {
            ring_bits: 0,
            ..PeerConfig::default()
        };
        assert!(matches!(
            ChordPeer::bind(config).await,
            Err(RingletError::Config(ConfigError::InvalidRingBits(0)))
        ));
    }

    #[tokio::test]
    async fn identity_follows_the_bound_address() {
        let peer = ChordPeer::bind(PeerConfig::default()).await.unwrap();
        let space = IdSpace::new(PeerConfig::default().ring_bits).unwrap();
        assert_ne!(peer.local_addr().port(), 0);
        assert_eq!(peer.node().id, space.identifier(&peer.local_addr().to_string()));

        let snapshot = peer.snapshot().await.unwrap();
        assert_eq!(snapshot.phase, RingPhase::Detached);
    }

    #[tokio::test]
    async fn shutdown_stops_actor_and_workers() {
        let config = PeerConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..PeerConfig::default()
        };
        let mut peer = ChordPeer::bind(config).await.unwrap();
        peer.create_network().await.unwrap();
        peer.start_maintenance();

        tokio::time::timeout(Duration::from_secs(2), peer.shutdown())
            .await
            .unwrap();
        assert!(matches!(peer.snapshot().await, Err(ChordError::ActorStopped)));
    }
}
