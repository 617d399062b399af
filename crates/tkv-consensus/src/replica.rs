use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use tkv_storage::{LogStorage, Snapshot, StateMachineStore};
use tkv_types::{Command, EntryKind, KvPair, LogId, LogIndex, NodeId, Term, TkvError};

use crate::config::ReplicaConfig;
use crate::message::Envelope;
use crate::node::{Node, NodeStatus, Ready, Role};
use crate::snapshot::SnapshotManager;
use crate::transport::{Mailbox, Transport};

const MAILBOX_CAPACITY: usize = 4096;

pub(crate) enum Request {
    Write {
        commands: Vec<Command>,
        respond_to: oneshot::Sender<Result<LogId, TkvError>>,
    },
    Raft(Envelope),
    Status(oneshot::Sender<NodeStatus>),
    Campaign,
    Shutdown(oneshot::Sender<()>),
}

struct Pending {
    term: Term,
    respond_to: oneshot::Sender<Result<LogId, TkvError>>,
}

type SnapshotOutcome = (NodeId, Term, Result<LogIndex, TkvError>);

/// How the driver ended: `None` while it runs, then `Ok` after a requested
/// shutdown or the storage error that stopped it.
type Exit = Option<Result<(), TkvError>>;

// ---------------------------------------------------------------------------
// Replica: the single task that owns a node and its state machine
// ---------------------------------------------------------------------------

/// Drives one [`Node`]: feeds it ticks, peer messages and proposals, carries
/// out each [`Ready`] and applies committed entries to the state machine.
///
/// All mutation happens on this one task, so the node needs no locking.
/// Reads bypass it and go straight to the state machine.
pub struct Replica<L: LogStorage, S: StateMachineStore, T: Transport> {
    config: ReplicaConfig,
    node: Node<L>,
    sm: Arc<S>,
    transport: Arc<T>,
    rx: mpsc::Receiver<Request>,
    pending: BTreeMap<LogIndex, Pending>,
    snapshots: SnapshotManager,
    snapshot_tx: mpsc::UnboundedSender<SnapshotOutcome>,
    snapshot_rx: mpsc::UnboundedReceiver<SnapshotOutcome>,
    exit: watch::Sender<Exit>,
}

impl<L: LogStorage, S: StateMachineStore, T: Transport> Replica<L, S, T> {
    /// Restore the node from `log` and `sm` and start driving it.
    pub async fn spawn(
        config: ReplicaConfig,
        log: Arc<L>,
        sm: Arc<S>,
        transport: Arc<T>,
    ) -> Result<ReplicaHandle<S>, TkvError> {
        config.validate()?;
        let applied = sm.applied().await?;
        let node = Node::open(config.raft.clone(), log, applied.index).await?;
        let id = node.id();

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let (exit, exit_rx) = watch::channel(None);
        let replica = Replica {
            snapshots: SnapshotManager::new(config.snapshot_chunk_size),
            config,
            node,
            sm: Arc::clone(&sm),
            transport,
            rx,
            pending: BTreeMap::new(),
            snapshot_tx,
            snapshot_rx,
            exit,
        };
        let request_timeout = replica.config.request_timeout;
        tokio::spawn(replica.run());

        Ok(ReplicaHandle { id, tx, sm, exit: exit_rx, request_timeout })
    }

    async fn run(mut self) {
        let id = self.node.id();
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut result = self.apply_committed().await;
        let mut shutdown_ack = None;
        while result.is_ok() {
            result = tokio::select! {
                _ = ticker.tick() => self.on_tick().await,
                Some((peer, term, outcome)) = self.snapshot_rx.recv() => {
                    self.on_snapshot_sent(peer, term, outcome).await
                }
                req = self.rx.recv() => match req {
                    Some(Request::Shutdown(ack)) => {
                        shutdown_ack = Some(ack);
                        break;
                    }
                    Some(req) => self.handle(req).await,
                    None => break,
                },
            };
        }

        // Mark the replica stopped before any waiting writer hears back, so
        // reads through the handle fail from then on.
        self.rx.close();
        if let Err(e) = &result {
            tracing::error!(node_id = id, error = %e, "replica stopped on storage failure");
        } else {
            tracing::info!(node_id = id, "replica stopped");
        }
        self.exit.send_replace(Some(result));
        self.snapshots.cancel_all();
        for (_, p) in std::mem::take(&mut self.pending) {
            let _ = p.respond_to.send(Err(TkvError::Stopped));
        }
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    async fn handle(&mut self, req: Request) -> Result<(), TkvError> {
        match req {
            Request::Write { commands, respond_to } => {
                let payload = Command::encode_batch(&commands)?;
                match self.node.propose(payload).await {
                    Ok((id, ready)) => {
                        self.pending.insert(id.index, Pending { term: id.term, respond_to });
                        self.process_ready(ready).await
                    }
                    Err(e @ TkvError::NotLeader { .. }) => {
                        let _ = respond_to.send(Err(e));
                        Ok(())
                    }
                    Err(e) => {
                        // Answered with `Stopped` once the driver winds down.
                        let index = self.node.last_log().index + 1;
                        self.pending.insert(index, Pending { term: self.node.term(), respond_to });
                        Err(e)
                    }
                }
            }
            Request::Raft(env) => {
                let ready = self.node.step(env).await?;
                self.process_ready(ready).await
            }
            Request::Status(respond_to) => {
                let status = NodeStatus { pending_writes: self.pending.len(), ..self.node.status() };
                let _ = respond_to.send(status);
                Ok(())
            }
            Request::Campaign => {
                let ready = self.node.campaign().await?;
                self.process_ready(ready).await
            }
            Request::Shutdown(_) => Ok(()),
        }
    }

    async fn on_tick(&mut self) -> Result<(), TkvError> {
        // Writers that gave up no longer need an answer.
        self.pending.retain(|_, p| !p.respond_to.is_closed());
        let ready = self.node.tick().await?;
        self.process_ready(ready).await
    }

    async fn on_snapshot_sent(
        &mut self,
        peer: NodeId,
        term: Term,
        outcome: Result<LogIndex, TkvError>,
    ) -> Result<(), TkvError> {
        self.snapshots.finish(peer, term);
        if self.node.role() != Role::Leader || self.node.term() != term {
            return Ok(());
        }
        self.node.snapshot_sent(peer, outcome.ok());
        let ready = self.node.take_ready();
        self.process_ready(ready).await
    }

    // -----------------------------------------------------------------------
    // Ready handling
    // -----------------------------------------------------------------------

    async fn process_ready(&mut self, mut ready: Ready) -> Result<(), TkvError> {
        if let Some(from) = ready.truncated_from {
            self.drop_pending(from..);
        }
        if let Some(snapshot) = ready.snapshot.take() {
            let follow_up = self.install_snapshot(snapshot).await?;
            if let Some(from) = follow_up.truncated_from {
                self.drop_pending(from..);
            }
            ready.messages.extend(follow_up.messages);
        }
        for env in ready.messages {
            self.transport.send(env);
        }

        if self.node.role() == Role::Leader {
            for peer in ready.snapshot_targets {
                self.send_snapshot(peer);
            }
        } else {
            self.snapshots.cancel_all();
        }

        self.apply_committed().await
    }

    async fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<Ready, TkvError> {
        let meta = snapshot.meta.clone();
        self.sm.install_snapshot(snapshot).await?;
        // Entries covered by the image can't be matched to their proposals.
        self.drop_pending(..=meta.index);
        self.node.snapshot_installed(&meta).await
    }

    fn send_snapshot(&mut self, peer: NodeId) {
        let term = self.node.term();
        let done_tx = self.snapshot_tx.clone();
        self.snapshots.generate(
            self.node.id(),
            peer,
            term,
            self.node.conf_state(),
            Arc::clone(&self.sm),
            Arc::clone(&self.transport),
            move |outcome| {
                let _ = done_tx.send((peer, term, outcome));
            },
        );
    }

    async fn apply_committed(&mut self) -> Result<(), TkvError> {
        loop {
            let entries = self.node.committed_entries(self.config.apply_batch).await?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                let id = entry.log_id();
                let commands = match entry.kind {
                    EntryKind::Normal if entry.is_noop() => Vec::new(),
                    // Every payload came from `encode_batch`; one that no
                    // longer decodes means this replica's log is corrupt.
                    EntryKind::Normal => Command::decode_batch(&entry.payload).map_err(|e| {
                        tracing::error!(node_id = self.node.id(), index = id.index, error = %e, "undecodable entry");
                        e
                    })?,
                    EntryKind::ConfChange => Vec::new(),
                };
                self.sm.apply(id, commands).await?;
                self.node.advance_applied(id.index);
                self.resolve(id);
            }
        }
        self.maybe_compact().await
    }

    /// Answer the proposal waiting on `applied.index`. Whatever was proposed
    /// there under another term lost its slot.
    fn resolve(&mut self, applied: LogId) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > applied.index {
                break;
            }
            let index = *entry.key();
            let p = entry.remove();
            let result = if index == applied.index && p.term == applied.term {
                Ok(applied)
            } else {
                tracing::debug!(node_id = self.node.id(), index, "proposal superseded");
                Err(TkvError::ProposalDropped { index })
            };
            let _ = p.respond_to.send(result);
        }
    }

    fn drop_pending<R: std::ops::RangeBounds<LogIndex>>(&mut self, range: R) {
        let dropped: Vec<LogIndex> = self.pending.range(range).map(|(i, _)| *i).collect();
        for index in dropped {
            if let Some(p) = self.pending.remove(&index) {
                let _ = p.respond_to.send(Err(TkvError::ProposalDropped { index }));
            }
        }
    }

    async fn maybe_compact(&mut self) -> Result<(), TkvError> {
        let applied = self.node.applied_index();
        let retained = (applied + 1).saturating_sub(self.node.first_index());
        if retained <= self.config.snapshot_threshold {
            return Ok(());
        }
        self.sm.flush().await?;
        self.node.compact(applied).await?;
        tracing::info!(
            node_id = self.node.id(),
            index = applied,
            first_index = self.node.first_index(),
            "compacted log"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ReplicaHandle
// ---------------------------------------------------------------------------

/// Client-facing handle to a running [`Replica`]. Cheap to clone.
pub struct ReplicaHandle<S> {
    id: NodeId,
    tx: mpsc::Sender<Request>,
    sm: Arc<S>,
    exit: watch::Receiver<Exit>,
    request_timeout: Duration,
}

impl<S> Clone for ReplicaHandle<S> {
    fn clone(&self) -> Self {
        ReplicaHandle {
            id: self.id,
            tx: self.tx.clone(),
            sm: Arc::clone(&self.sm),
            exit: self.exit.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

impl<S: StateMachineStore> ReplicaHandle<S> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Replicate `commands` as one entry and wait until it is applied here.
    ///
    /// Fails with `NotLeader` on a non-leader, `ProposalDropped` if the entry
    /// lost its log slot, and `Timeout` after the configured deadline.
    pub async fn write(&self, commands: Vec<Command>) -> Result<LogId, TkvError> {
        if commands.is_empty() {
            return Err(TkvError::InvalidArgument("empty write".into()));
        }
        if commands.iter().any(|c| c.key().is_empty()) {
            return Err(TkvError::InvalidArgument("key must not be empty".into()));
        }
        let (respond_to, rx) = oneshot::channel();
        let round_trip = async {
            self.tx
                .send(Request::Write { commands, respond_to })
                .await
                .map_err(|_| TkvError::Stopped)?;
            rx.await.map_err(|_| TkvError::Stopped)?
        };
        tokio::time::timeout(self.request_timeout, round_trip)
            .await
            .map_err(|_| TkvError::Timeout)?
    }

    pub async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), TkvError> {
        self.write(vec![Command::Put { key, value }]).await.map(|_| ())
    }

    pub async fn delete(&self, key: Vec<u8>) -> Result<(), TkvError> {
        self.write(vec![Command::Delete { key }]).await.map(|_| ())
    }

    /// Read from the local state machine. May trail the leader.
    /// Fails with `Stopped` once the driver is gone.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TkvError> {
        if self.is_stopped() {
            return Err(TkvError::Stopped);
        }
        self.sm.get(key).await
    }

    pub async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>, TkvError> {
        if self.is_stopped() {
            return Err(TkvError::Stopped);
        }
        self.sm.scan(start, end, limit).await
    }

    pub async fn status(&self) -> Result<NodeStatus, TkvError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Request::Status(tx)).await.map_err(|_| TkvError::Stopped)?;
        rx.await.map_err(|_| TkvError::Stopped)
    }

    /// Ask the node to stand for election immediately.
    pub async fn campaign(&self) -> Result<(), TkvError> {
        self.tx.send(Request::Campaign).await.map_err(|_| TkvError::Stopped)
    }

    pub fn mailbox(&self) -> Mailbox {
        Mailbox { tx: self.tx.clone() }
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed() || self.exit.borrow().is_some()
    }

    /// Resolves when the driver has stopped: `Ok` after [`shutdown`], or the
    /// storage error that ended it.
    ///
    /// [`shutdown`]: ReplicaHandle::shutdown
    pub async fn stopped(&self) -> Result<(), TkvError> {
        let mut exit = self.exit.clone();
        let result = match exit.wait_for(Option::is_some).await {
            Ok(done) => (*done).clone().unwrap_or(Ok(())),
            // The driver vanished without reporting, e.g. the runtime shut down.
            Err(_) => Err(TkvError::Stopped),
        };
        result
    }

    /// Stop the replica and wait for it to wind down. Outstanding writes
    /// fail with `Stopped`.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Request::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}
