//! Async driver: one task owns the [`SyncNode`] and feeds it events.
//!
//! ```text
//!  SyncHandle ──NodeCommand──┐
//!                            ▼
//!  GuildChannel ──frames──► select! ──► SyncNode ──events──► mpsc::Receiver<SyncEvent>
//!                            ▲               │
//!  interval tick ────────────┘               └──tick() frames──► GuildChannel::send
//! ```
//!
//! Commands, inbound frames and ticks are handled strictly one at a time in
//! arrival order; the node itself is never shared. Events are forwarded
//! without waiting: when the receiver falls behind, new events are dropped
//! and logged rather than stalling the loop.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::channel::{ChannelFrame, GuildChannel};
use crate::event::SyncEvent;
use crate::membership::Peer;
use crate::node::{NodeStats, SyncNode};
use crate::record::{Record, RecordId, RecordPayload};
use crate::storage::ReplicaSnapshot;

/// Requests processed by the runtime loop.
#[derive(Debug)]
pub enum NodeCommand {
    RecordChanged { id: RecordId, payload: RecordPayload },
    RecordDeleted(RecordId),
    PeerListChanged(Vec<Peer>),
    SetSuspended(bool),
    Reset,
    Get(RecordId, oneshot::Sender<Option<Record>>),
    Snapshot(oneshot::Sender<ReplicaSnapshot>),
    Stats(oneshot::Sender<NodeStats>),
    Shutdown,
}

/// The runtime loop has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeClosed;

impl std::fmt::Display for RuntimeClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sync runtime has shut down")
    }
}

impl std::error::Error for RuntimeClosed {}

/// Cloneable command API for a running node.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<NodeCommand>,
}

impl SyncHandle {
    async fn send(&self, cmd: NodeCommand) -> Result<(), RuntimeClosed> {
        self.tx.send(cmd).await.map_err(|_| RuntimeClosed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand,
    ) -> Result<T, RuntimeClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| RuntimeClosed)
    }

    pub async fn record_changed(&self, id: RecordId, payload: RecordPayload) -> Result<(), RuntimeClosed> {
        self.send(NodeCommand::RecordChanged { id, payload }).await
    }

    pub async fn record_deleted(&self, id: RecordId) -> Result<(), RuntimeClosed> {
        self.send(NodeCommand::RecordDeleted(id)).await
    }

    pub async fn peer_list_changed(&self, peers: Vec<Peer>) -> Result<(), RuntimeClosed> {
        self.send(NodeCommand::PeerListChanged(peers)).await
    }

    pub async fn set_suspended(&self, suspended: bool) -> Result<(), RuntimeClosed> {
        self.send(NodeCommand::SetSuspended(suspended)).await
    }

    pub async fn reset(&self) -> Result<(), RuntimeClosed> {
        self.send(NodeCommand::Reset).await
    }

    pub async fn get(&self, id: RecordId) -> Result<Option<Record>, RuntimeClosed> {
        self.request(|tx| NodeCommand::Get(id, tx)).await
    }

    pub async fn snapshot(&self) -> Result<ReplicaSnapshot, RuntimeClosed> {
        self.request(NodeCommand::Snapshot).await
    }

    pub async fn stats(&self) -> Result<NodeStats, RuntimeClosed> {
        self.request(NodeCommand::Stats).await
    }

    /// Stop the loop. [`SyncRuntime::run`] then returns the node.
    pub async fn shutdown(&self) -> Result<(), RuntimeClosed> {
        self.send(NodeCommand::Shutdown).await
    }
}

/// Owns a node and connects it to a [`GuildChannel`].
pub struct SyncRuntime {
    node: SyncNode,
    channel: Arc<GuildChannel>,
    inbound: broadcast::Receiver<Arc<ChannelFrame>>,
    commands: mpsc::Receiver<NodeCommand>,
    events: mpsc::Sender<SyncEvent>,
    tick_interval: Duration,
}

impl SyncRuntime {
    /// Join `channel` and build the runtime plus its handle and event stream.
    pub async fn new(
        node: SyncNode,
        channel: Arc<GuildChannel>,
        tick_interval: Duration,
    ) -> (Self, SyncHandle, mpsc::Receiver<SyncEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let inbound = channel.join(node.local().clone()).await;

        let runtime = Self {
            node,
            channel,
            inbound,
            commands: cmd_rx,
            events: event_tx,
            tick_interval,
        };
        (runtime, SyncHandle { tx: cmd_tx }, event_rx)
    }

    /// Run until shutdown (or every handle is dropped) and return the node.
    pub async fn run(mut self) -> SyncNode {
        self.node.start(Instant::now());

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                frame = self.inbound.recv() => match frame {
                    Ok(frame) => {
                        // Per-frame failures are logged and counted by the node
                        let _ = self.node.receive(&frame.sender, &frame.bytes, Instant::now());
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("{} lagged {missed} frames behind the channel", self.node.local());
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => self.flush(Instant::now()),
            }

            self.forward_events();
        }

        self.channel.leave(self.node.local()).await;
        log::info!("Sync runtime for {} stopped", self.node.local());
        self.node
    }

    fn handle_command(&mut self, cmd: NodeCommand) {
        let now = Instant::now();
        match cmd {
            NodeCommand::RecordChanged { id, payload } => self.node.record_changed(id, payload, now),
            NodeCommand::RecordDeleted(id) => self.node.record_deleted(&id, now),
            NodeCommand::PeerListChanged(peers) => self.node.peer_list_changed(peers, now),
            NodeCommand::SetSuspended(suspended) => self.node.set_suspended(suspended),
            NodeCommand::Reset => self.node.reset(now),
            NodeCommand::Get(id, reply) => {
                let _ = reply.send(self.node.get(&id).cloned());
            }
            NodeCommand::Snapshot(reply) => {
                let _ = reply.send(self.node.snapshot());
            }
            NodeCommand::Stats(reply) => {
                let _ = reply.send(self.node.stats());
            }
            NodeCommand::Shutdown => {}
        }
    }

    fn forward_events(&mut self) {
        let mut dropped = 0usize;
        for event in self.node.take_events() {
            match self.events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped += 1,
                // Nobody is listening; keep syncing anyway
                Err(TrySendError::Closed(_)) => break,
            }
        }
        if dropped > 0 {
            log::warn!("Event stream for {} is full, dropped {dropped} events", self.node.local());
        }
    }

    fn flush(&mut self, now: Instant) {
        for frame in self.node.tick(now) {
            if let Err(e) = self.channel.send(self.node.local(), frame) {
                log::warn!("Channel rejected frame from {}: {e}", self.node.local());
            }
        }
    }
}
