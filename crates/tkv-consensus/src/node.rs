use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tkv_storage::{LogStorage, Snapshot};
use tkv_types::{
    ConfState, Entry, HardState, LogId, LogIndex, NodeId, SnapshotMeta, Term, TkvError,
};

use crate::config::RaftConfig;
use crate::message::{AppendOutcome, Envelope, Message, Rejection};
use crate::progress::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Everything a transition produced that the caller has to act on.
#[derive(Debug, Default)]
pub struct Ready {
    /// Outbound messages, fire-and-forget.
    pub messages: Vec<Envelope>,
    /// New commit index, when it advanced.
    pub commit: Option<LogIndex>,
    /// Uncommitted entries at or after this index were discarded.
    pub truncated_from: Option<LogIndex>,
    /// Peers whose next entry is compacted away and need a snapshot.
    pub snapshot_targets: Vec<NodeId>,
    /// A received snapshot the node accepted. Install it, then report back
    /// through [`Node::snapshot_installed`].
    pub snapshot: Option<Snapshot>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.commit.is_none()
            && self.truncated_from.is_none()
            && self.snapshot_targets.is_empty()
            && self.snapshot.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit: LogIndex,
    pub applied: LogIndex,
    pub first_index: LogIndex,
    pub last_log: LogId,
    /// Writes waiting on the apply loop. Only a running replica fills it in.
    pub pending_writes: usize,
}

/// The Raft state machine for one replica.
///
/// `Node` owns the hard state and the log; it never touches the key-value
/// data. Every public transition persists what it must before queueing the
/// messages that depend on it, and returns a [`Ready`].
pub struct Node<L: LogStorage> {
    config: RaftConfig,
    log: Arc<L>,

    role: Role,
    term: Term,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    commit: LogIndex,
    applied: LogIndex,
    last_purged: LogId,
    last_log: LogId,

    votes: HashMap<NodeId, bool>,
    progress: HashMap<NodeId, Progress>,

    election_elapsed: u32,
    heartbeat_elapsed: u32,
    election_timeout: u32,

    /// Leader whose snapshot is awaiting installation.
    snapshot_from: Option<NodeId>,
    ready: Ready,
}

impl<L: LogStorage> Node<L> {
    /// Restore a node from storage. It always starts as a follower.
    ///
    /// `applied` is the state machine's applied index.
    pub async fn open(config: RaftConfig, log: Arc<L>, applied: LogIndex) -> Result<Self, TkvError> {
        config.validate()?;
        let hs = log.hard_state().await?;
        let state = log.log_state().await?;
        let commit = hs.commit.max(applied).max(state.last_purged.index);

        let mut node = Node {
            config,
            log,
            role: Role::Follower,
            term: hs.term,
            voted_for: hs.voted_for,
            leader: None,
            commit,
            applied: applied.max(state.last_purged.index),
            last_purged: state.last_purged,
            last_log: state.last,
            votes: HashMap::new(),
            progress: HashMap::new(),
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            election_timeout: 0,
            snapshot_from: None,
            ready: Ready::default(),
        };
        node.reset_election_timer();
        tracing::info!(
            node_id = node.config.id,
            term = node.term,
            commit = node.commit,
            last_index = node.last_log.index,
            "raft node restored"
        );
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.config.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit
    }

    pub fn applied_index(&self) -> LogIndex {
        self.applied
    }

    pub fn first_index(&self) -> LogIndex {
        self.last_purged.index + 1
    }

    pub fn last_log(&self) -> LogId {
        self.last_log
    }

    pub fn conf_state(&self) -> ConfState {
        ConfState { voters: self.config.voters.clone() }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.config.id,
            role: self.role,
            term: self.term,
            leader: self.leader,
            commit: self.commit,
            applied: self.applied,
            first_index: self.first_index(),
            last_log: self.last_log,
            pending_writes: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Public transitions
    // -----------------------------------------------------------------------

    /// Append `payload` as a new entry. Only a leader accepts proposals; any
    /// other role fails with `NotLeader` and leaves the log untouched.
    pub async fn propose(&mut self, payload: Vec<u8>) -> Result<(LogId, Ready), TkvError> {
        if self.role != Role::Leader {
            return Err(TkvError::NotLeader { leader: self.leader });
        }
        let entry = Entry::normal(self.last_log.index + 1, self.term, payload);
        let id = self.append_local(entry).await?;
        self.broadcast_append().await?;
        self.maybe_commit().await?;
        Ok((id, self.take_ready()))
    }

    /// Advance the logical clock by one tick.
    pub async fn tick(&mut self) -> Result<Ready, TkvError> {
        match self.role {
            Role::Leader => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.config.heartbeat_tick {
                    self.heartbeat_elapsed = 0;
                    self.broadcast_heartbeat().await?;
                }
            }
            Role::Follower | Role::Candidate => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.election_timeout {
                    self.start_election().await?;
                }
            }
        }
        Ok(self.take_ready())
    }

    /// Start an election now instead of waiting for the timeout.
    pub async fn campaign(&mut self) -> Result<Ready, TkvError> {
        if self.role != Role::Leader {
            self.start_election().await?;
        }
        Ok(self.take_ready())
    }

    /// Process one inbound message.
    pub async fn step(&mut self, env: Envelope) -> Result<Ready, TkvError> {
        if env.to != self.config.id || !self.config.voters.contains(&env.from) {
            tracing::debug!(
                node_id = self.config.id,
                from = env.from,
                to = env.to,
                "dropping misrouted message"
            );
            return Ok(self.take_ready());
        }

        if env.term > self.term {
            let leader = match env.message {
                Message::Append { .. } | Message::Heartbeat { .. } | Message::InstallSnapshot { .. } => {
                    Some(env.from)
                }
                _ => None,
            };
            tracing::info!(
                node_id = self.config.id,
                term = self.term,
                new_term = env.term,
                from = env.from,
                kind = env.message.kind(),
                "observed higher term"
            );
            self.become_follower(env.term, leader);
            self.persist_hard_state().await?;
        } else if env.term < self.term {
            self.reject_stale(env);
            return Ok(self.take_ready());
        }

        let from = env.from;
        match env.message {
            Message::RequestVote { last_log } => self.handle_request_vote(from, last_log).await?,
            Message::RequestVoteResponse { granted } => self.handle_vote_response(from, granted).await?,
            Message::Append { prev, entries, commit } => {
                self.handle_append(from, prev, entries, commit).await?
            }
            Message::AppendResponse(outcome) => self.handle_append_response(from, outcome).await?,
            Message::Heartbeat { commit } => self.handle_heartbeat(from, commit).await?,
            Message::HeartbeatResponse => self.handle_heartbeat_response(from).await?,
            Message::InstallSnapshot { snapshot } => self.handle_snapshot(from, snapshot),
        }
        Ok(self.take_ready())
    }

    /// Entries committed but not yet applied, at most `max` of them.
    pub async fn committed_entries(&self, max: usize) -> Result<Vec<Entry>, TkvError> {
        if self.applied >= self.commit {
            return Ok(Vec::new());
        }
        let hi = self.commit.min(self.applied + max as u64) + 1;
        self.log.entries(self.applied + 1, hi).await
    }

    pub fn advance_applied(&mut self, index: LogIndex) {
        debug_assert!(index <= self.commit, "applied past commit");
        self.applied = self.applied.max(index);
    }

    /// Drop log entries through `index`, which must already be applied and
    /// durable in the state machine.
    pub async fn compact(&mut self, index: LogIndex) -> Result<(), TkvError> {
        let index = index.min(self.applied);
        if index <= self.last_purged.index {
            return Ok(());
        }
        let term = self.term_at(index).await?.ok_or_else(|| {
            TkvError::Storage(format!("no term recorded for index {index}"))
        })?;
        self.log.compact(index).await?;
        self.last_purged = LogId::new(term, index);
        Ok(())
    }

    /// The state machine finished installing the snapshot handed out in
    /// [`Ready::snapshot`].
    pub async fn snapshot_installed(&mut self, meta: &SnapshotMeta) -> Result<Ready, TkvError> {
        let state = self.log.log_state().await?;
        if self.last_log.index > meta.index && state.last.index == meta.index {
            self.note_truncation(meta.index + 1);
        }
        self.last_purged = state.last_purged;
        self.last_log = state.last;
        self.commit = self.commit.max(meta.index);
        self.applied = self.applied.max(meta.index);
        tracing::info!(
            node_id = self.config.id,
            index = meta.index,
            term = meta.term,
            last_index = self.last_log.index,
            "snapshot installed"
        );
        if let Some(leader) = self.snapshot_from.take() {
            self.send(leader, Message::AppendResponse(AppendOutcome::Accepted { match_index: meta.index }));
        }
        Ok(self.take_ready())
    }

    /// Outcome of an outbound snapshot transfer. On failure the peer goes
    /// back to probing, which schedules a fresh transfer.
    pub fn snapshot_sent(&mut self, peer: NodeId, installed: Option<LogIndex>) {
        if let Some(pr) = self.progress.get_mut(&peer) {
            pr.snapshot_finished(installed);
        }
    }

    pub fn take_ready(&mut self) -> Ready {
        std::mem::take(&mut self.ready)
    }

    // -----------------------------------------------------------------------
    // Role changes
    // -----------------------------------------------------------------------

    async fn start_election(&mut self) -> Result<(), TkvError> {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.config.id);
        self.leader = None;
        self.progress.clear();
        self.votes.clear();
        self.votes.insert(self.config.id, true);
        self.reset_election_timer();
        self.persist_hard_state().await?;

        tracing::info!(node_id = self.config.id, term = self.term, "starting election");

        if self.granted_votes() >= self.config.quorum() {
            return self.become_leader().await;
        }
        let last_log = self.last_log;
        for peer in self.peers() {
            self.send(peer, Message::RequestVote { last_log });
        }
        Ok(())
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        if self.role != Role::Follower {
            tracing::info!(node_id = self.config.id, term = self.term, ?leader, "became follower");
        }
        self.role = Role::Follower;
        self.leader = leader;
        self.votes.clear();
        self.progress.clear();
        self.reset_election_timer();
    }

    async fn become_leader(&mut self) -> Result<(), TkvError> {
        self.role = Role::Leader;
        self.leader = Some(self.config.id);
        self.heartbeat_elapsed = 0;
        self.votes.clear();
        let next = self.last_log.index + 1;
        self.progress = self.peers().into_iter().map(|p| (p, Progress::new(next))).collect();

        tracing::info!(node_id = self.config.id, term = self.term, "became leader");

        // Committing an entry of our own term is what commits everything
        // before it.
        self.append_local(Entry::noop(self.last_log.index + 1, self.term)).await?;
        self.broadcast_append().await?;
        self.maybe_commit().await
    }

    /// Same-term contact from the leader.
    fn accept_leader(&mut self, leader: NodeId) {
        if self.role == Role::Candidate {
            self.become_follower(self.term, Some(leader));
        } else {
            self.leader = Some(leader);
            self.election_elapsed = 0;
        }
    }

    // -----------------------------------------------------------------------
    // Message handlers
    // -----------------------------------------------------------------------

    fn reject_stale(&mut self, env: Envelope) {
        tracing::debug!(
            node_id = self.config.id,
            term = self.term,
            from = env.from,
            stale_term = env.term,
            kind = env.message.kind(),
            "rejecting stale message"
        );
        let reply = match env.message {
            Message::RequestVote { .. } => Some(Message::RequestVoteResponse { granted: false }),
            Message::Append { .. } | Message::InstallSnapshot { .. } => {
                Some(Message::AppendResponse(AppendOutcome::Rejected(Rejection::StaleTerm)))
            }
            Message::Heartbeat { .. } => Some(Message::HeartbeatResponse),
            _ => None,
        };
        if let Some(message) = reply {
            self.send(env.from, message);
        }
    }

    async fn handle_request_vote(&mut self, candidate: NodeId, last_log: LogId) -> Result<(), TkvError> {
        let can_vote = self.voted_for.map_or(true, |v| v == candidate);
        let up_to_date = last_log >= self.last_log;
        let granted = can_vote && up_to_date;
        if granted {
            self.voted_for = Some(candidate);
            self.reset_election_timer();
            self.persist_hard_state().await?;
        }
        tracing::debug!(
            node_id = self.config.id,
            term = self.term,
            candidate,
            granted,
            "vote request"
        );
        self.send(candidate, Message::RequestVoteResponse { granted });
        Ok(())
    }

    async fn handle_vote_response(&mut self, from: NodeId, granted: bool) -> Result<(), TkvError> {
        if self.role != Role::Candidate {
            return Ok(());
        }
        self.votes.insert(from, granted);
        if self.granted_votes() >= self.config.quorum() {
            return self.become_leader().await;
        }
        let denied = self.votes.values().filter(|g| !**g).count();
        if denied >= self.config.quorum() {
            self.become_follower(self.term, None);
        }
        Ok(())
    }

    async fn handle_append(
        &mut self,
        leader: NodeId,
        prev: LogId,
        mut entries: Vec<Entry>,
        leader_commit: LogIndex,
    ) -> Result<(), TkvError> {
        if self.role == Role::Leader {
            tracing::warn!(node_id = self.config.id, term = self.term, from = leader, "append from a second leader");
            return Ok(());
        }
        self.accept_leader(leader);

        if prev.index < self.commit {
            let match_index = self.commit;
            self.send(leader, Message::AppendResponse(AppendOutcome::Accepted { match_index }));
            return Ok(());
        }

        let local = self.term_at(prev.index).await?;
        if local != Some(prev.term) {
            let rejection = self.conflict(prev.index, local).await?;
            tracing::debug!(
                node_id = self.config.id,
                term = self.term,
                prev_index = prev.index,
                prev_term = prev.term,
                ?rejection,
                "rejecting append"
            );
            self.send(leader, Message::AppendResponse(AppendOutcome::Rejected(rejection)));
            return Ok(());
        }

        let match_index = prev.index + entries.len() as u64;
        if let Some(split) = self.first_new_entry(&entries).await? {
            let first_new = entries[split].index;
            if first_new <= self.commit {
                tracing::error!(
                    node_id = self.config.id,
                    index = first_new,
                    commit = self.commit,
                    "leader sent an entry conflicting with a committed one"
                );
                return Ok(());
            }
            if first_new <= self.last_log.index {
                self.note_truncation(first_new);
            }
            let suffix = entries.split_off(split);
            let last = suffix.last().map(Entry::log_id).unwrap_or(self.last_log);
            self.log.append(suffix).await?;
            self.last_log = last;
        }

        let new_commit = leader_commit.min(match_index);
        if new_commit > self.commit {
            self.advance_commit(new_commit).await?;
        }
        self.send(leader, Message::AppendResponse(AppendOutcome::Accepted { match_index }));
        Ok(())
    }

    async fn handle_append_response(&mut self, peer: NodeId, outcome: AppendOutcome) -> Result<(), TkvError> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let Some(matched) = self.progress.get(&peer).map(|p| p.matched) else {
            return Ok(());
        };

        match outcome {
            AppendOutcome::Accepted { match_index } => {
                let advanced = match self.progress.get_mut(&peer) {
                    Some(pr) => pr.on_accepted(match_index),
                    None => false,
                };
                if advanced {
                    self.maybe_commit().await?;
                }
                if self.progress.get(&peer).is_some_and(|p| p.next <= self.last_log.index) {
                    self.send_append(peer).await?;
                }
            }
            AppendOutcome::Rejected(Rejection::StaleTerm) => {}
            AppendOutcome::Rejected(Rejection::LogConflict { rejected, conflict_term, hint }) => {
                if rejected <= matched {
                    return Ok(());
                }
                let mut next = hint;
                if let Some(term) = conflict_term {
                    if let Some(index) = self.last_index_of_term(term, rejected).await? {
                        next = index + 1;
                    }
                }
                tracing::debug!(node_id = self.config.id, peer, rejected, next, "rewinding follower");
                if let Some(pr) = self.progress.get_mut(&peer) {
                    pr.on_rejected(next.min(rejected));
                }
                self.send_append(peer).await?;
            }
        }
        Ok(())
    }

    async fn handle_heartbeat(&mut self, leader: NodeId, commit: LogIndex) -> Result<(), TkvError> {
        if self.role == Role::Leader {
            return Ok(());
        }
        self.accept_leader(leader);
        let commit = commit.min(self.last_log.index);
        if commit > self.commit {
            self.advance_commit(commit).await?;
        }
        self.send(leader, Message::HeartbeatResponse);
        Ok(())
    }

    async fn handle_heartbeat_response(&mut self, peer: NodeId) -> Result<(), TkvError> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let last_index = self.last_log.index;
        let behind = match self.progress.get_mut(&peer) {
            Some(pr) if pr.matched < last_index => {
                pr.resume(last_index);
                true
            }
            _ => false,
        };
        if behind {
            self.send_append(peer).await?;
        }
        Ok(())
    }

    fn handle_snapshot(&mut self, leader: NodeId, snapshot: Snapshot) {
        if self.role == Role::Leader {
            return;
        }
        self.accept_leader(leader);
        if snapshot.meta.index <= self.commit {
            let match_index = self.commit;
            self.send(leader, Message::AppendResponse(AppendOutcome::Accepted { match_index }));
            return;
        }
        tracing::info!(
            node_id = self.config.id,
            index = snapshot.meta.index,
            term = snapshot.meta.term,
            from = leader,
            "accepting snapshot"
        );
        self.snapshot_from = Some(leader);
        self.ready.snapshot = Some(snapshot);
    }

    // -----------------------------------------------------------------------
    // Replication
    // -----------------------------------------------------------------------

    async fn send_append(&mut self, to: NodeId) -> Result<(), TkvError> {
        let Some(next) = self.progress.get(&to).filter(|p| p.can_send()).map(|p| p.next) else {
            return Ok(());
        };
        if next <= self.last_purged.index {
            self.request_snapshot(to);
            return Ok(());
        }
        let prev_index = next - 1;
        let Some(prev_term) = self.term_at(prev_index).await? else {
            self.request_snapshot(to);
            return Ok(());
        };
        let hi = (self.last_log.index + 1).min(next + self.config.max_append_entries as u64);
        let entries = self.log.entries(next, hi).await?;
        let last_sent = entries.last().map(|e| e.index);
        let commit = self.commit;
        self.send(to, Message::Append { prev: LogId::new(prev_term, prev_index), entries, commit });
        if let Some(pr) = self.progress.get_mut(&to) {
            pr.on_sent(last_sent);
        }
        Ok(())
    }

    async fn broadcast_append(&mut self) -> Result<(), TkvError> {
        for peer in self.peers() {
            self.send_append(peer).await?;
        }
        Ok(())
    }

    async fn broadcast_heartbeat(&mut self) -> Result<(), TkvError> {
        for peer in self.peers() {
            let matched = match self.progress.get_mut(&peer) {
                Some(pr) => {
                    pr.resume(self.last_log.index);
                    pr.matched
                }
                None => continue,
            };
            let commit = self.commit.min(matched);
            self.send(peer, Message::Heartbeat { commit });
        }
        Ok(())
    }

    fn request_snapshot(&mut self, to: NodeId) {
        if let Some(pr) = self.progress.get_mut(&to) {
            pr.begin_snapshot();
            tracing::info!(
                node_id = self.config.id,
                peer = to,
                next = pr.next,
                first_index = self.last_purged.index + 1,
                "peer needs a snapshot"
            );
            self.ready.snapshot_targets.push(to);
        }
    }

    async fn maybe_commit(&mut self) -> Result<(), TkvError> {
        let mut matched: Vec<LogIndex> = self.progress.values().map(|p| p.matched).collect();
        matched.push(self.last_log.index);
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.config.quorum() - 1];
        if candidate <= self.commit {
            return Ok(());
        }
        // Entries from earlier terms only commit under one of ours.
        if self.term_at(candidate).await? != Some(self.term) {
            return Ok(());
        }
        self.advance_commit(candidate).await?;
        self.broadcast_append().await
    }

    async fn advance_commit(&mut self, index: LogIndex) -> Result<(), TkvError> {
        self.commit = index;
        self.persist_hard_state().await?;
        self.ready.commit = Some(index);
        tracing::debug!(node_id = self.config.id, term = self.term, commit = index, "commit advanced");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Log helpers
    // -----------------------------------------------------------------------

    async fn append_local(&mut self, entry: Entry) -> Result<LogId, TkvError> {
        let id = entry.log_id();
        self.log.append(vec![entry]).await?;
        self.last_log = id;
        Ok(id)
    }

    async fn term_at(&self, index: LogIndex) -> Result<Option<Term>, TkvError> {
        if index == self.last_purged.index {
            return Ok(Some(self.last_purged.term));
        }
        if index < self.last_purged.index || index > self.last_log.index {
            return Ok(None);
        }
        self.log.term(index).await
    }

    /// Position in `entries` of the first one this log does not already hold.
    async fn first_new_entry(&self, entries: &[Entry]) -> Result<Option<usize>, TkvError> {
        let Some(first) = entries.first().map(|e| e.index) else {
            return Ok(None);
        };
        let overlap_end = self.last_log.index.min(first + entries.len() as u64 - 1);
        let existing = self.log.entries(first, overlap_end + 1).await?;
        for (i, entry) in entries.iter().enumerate() {
            match existing.get(i) {
                Some(local) if local.index == entry.index && local.term == entry.term => continue,
                _ => return Ok(Some(i)),
            }
        }
        Ok(None)
    }

    async fn conflict(&self, rejected: LogIndex, local: Option<Term>) -> Result<Rejection, TkvError> {
        let Some(conflict_term) = local else {
            return Ok(Rejection::LogConflict {
                rejected,
                conflict_term: None,
                hint: self.last_log.index + 1,
            });
        };
        // Walk back to the first entry of the conflicting term; nothing at or
        // below the commit index can conflict.
        let floor = self.commit.max(self.last_purged.index) + 1;
        let mut hint = rejected;
        while hint > floor && self.term_at(hint - 1).await? == Some(conflict_term) {
            hint -= 1;
        }
        Ok(Rejection::LogConflict { rejected, conflict_term: Some(conflict_term), hint })
    }

    /// Largest index `<= upto` holding `term`, if this log has any.
    async fn last_index_of_term(&self, term: Term, upto: LogIndex) -> Result<Option<LogIndex>, TkvError> {
        let mut index = upto.min(self.last_log.index);
        while index > self.last_purged.index {
            match self.term_at(index).await? {
                Some(t) if t == term => return Ok(Some(index)),
                Some(t) if t < term => return Ok(None),
                _ => index -= 1,
            }
        }
        Ok((self.last_purged.term == term && self.last_purged.index > 0).then_some(self.last_purged.index))
    }

    fn note_truncation(&mut self, from: LogIndex) {
        tracing::info!(
            node_id = self.config.id,
            term = self.term,
            from,
            last_index = self.last_log.index,
            "discarding conflicting log suffix"
        );
        self.ready.truncated_from = Some(self.ready.truncated_from.map_or(from, |t| t.min(from)));
    }

    async fn persist_hard_state(&self) -> Result<(), TkvError> {
        self.log
            .save_hard_state(HardState { term: self.term, voted_for: self.voted_for, commit: self.commit })
            .await
    }

    // -----------------------------------------------------------------------
    // Misc
    // -----------------------------------------------------------------------

    fn peers(&self) -> Vec<NodeId> {
        self.config.voters.iter().copied().filter(|p| *p != self.config.id).collect()
    }

    fn granted_votes(&self) -> usize {
        self.votes.values().filter(|g| **g).count()
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        let base = self.config.election_tick;
        self.election_timeout = rand::thread_rng().gen_range(base..base * 2);
    }

    fn send(&mut self, to: NodeId, message: Message) {
        self.ready.messages.push(Envelope { from: self.config.id, to, term: self.term, message });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet, VecDeque};

    use tkv_storage::mem::MemLogStorage;

    use super::*;

    /// Deterministic in-memory cluster: messages are queued and delivered
    /// in order by `pump`; nodes in `down` neither send nor receive.
    struct Cluster {
        nodes: BTreeMap<NodeId, Node<MemLogStorage>>,
        logs: BTreeMap<NodeId, Arc<MemLogStorage>>,
        queue: VecDeque<Envelope>,
        down: HashSet<NodeId>,
        truncations: Vec<(NodeId, LogIndex)>,
        snapshot_requests: Vec<NodeId>,
        leaders_by_term: BTreeMap<Term, HashSet<NodeId>>,
    }

    impl Cluster {
        async fn new(n: u64) -> Self {
            let voters: Vec<NodeId> = (1..=n).collect();
            let mut nodes = BTreeMap::new();
            let mut logs = BTreeMap::new();
            for id in 1..=n {
                let log = Arc::new(MemLogStorage::default());
                let node = Node::open(RaftConfig::new(id, voters.clone()), log.clone(), 0).await.unwrap();
                nodes.insert(id, node);
                logs.insert(id, log);
            }
            Cluster {
                nodes,
                logs,
                queue: VecDeque::new(),
                down: HashSet::new(),
                truncations: Vec::new(),
                snapshot_requests: Vec::new(),
                leaders_by_term: BTreeMap::new(),
            }
        }

        fn node(&self, id: NodeId) -> &Node<MemLogStorage> {
            &self.nodes[&id]
        }

        fn absorb(&mut self, id: NodeId, ready: Ready) {
            if let Some(from) = ready.truncated_from {
                self.truncations.push((id, from));
            }
            self.snapshot_requests.extend(ready.snapshot_targets.iter().copied());
            let node = &self.nodes[&id];
            if node.role() == Role::Leader {
                self.leaders_by_term.entry(node.term()).or_default().insert(id);
            }
            if !self.down.contains(&id) {
                self.queue.extend(ready.messages);
            }
        }

        async fn pump(&mut self) {
            while let Some(env) = self.queue.pop_front() {
                if self.down.contains(&env.to) || self.down.contains(&env.from) {
                    continue;
                }
                let to = env.to;
                let ready = self.nodes.get_mut(&to).unwrap().step(env).await.unwrap();
                self.absorb(to, ready);
            }
        }

        async fn campaign(&mut self, id: NodeId) {
            let ready = self.nodes.get_mut(&id).unwrap().campaign().await.unwrap();
            self.absorb(id, ready);
            self.pump().await;
        }

        async fn propose(&mut self, id: NodeId, payload: &[u8]) -> Result<LogId, TkvError> {
            let (log_id, ready) = self.nodes.get_mut(&id).unwrap().propose(payload.to_vec()).await?;
            self.absorb(id, ready);
            self.pump().await;
            Ok(log_id)
        }

        async fn heartbeat(&mut self, id: NodeId) {
            let hb = self.nodes[&id].config.heartbeat_tick;
            for _ in 0..hb {
                let ready = self.nodes.get_mut(&id).unwrap().tick().await.unwrap();
                self.absorb(id, ready);
            }
            self.pump().await;
        }

        async fn log_of(&self, id: NodeId) -> Vec<Entry> {
            self.logs[&id].entries(1, u64::MAX).await.unwrap()
        }

        fn assert_election_safety(&self) {
            for (term, leaders) in &self.leaders_by_term {
                assert!(leaders.len() <= 1, "term {term} had leaders {leaders:?}");
            }
        }
    }

    #[tokio::test]
    async fn single_node_elects_itself_and_commits() {
        let mut c = Cluster::new(1).await;
        c.campaign(1).await;
        assert_eq!(c.node(1).role(), Role::Leader);
        assert_eq!(c.node(1).commit_index(), 1, "leader no-op commits on its own");

        let id = c.propose(1, b"x").await.unwrap();
        assert_eq!(id, LogId::new(1, 2));
        assert_eq!(c.node(1).commit_index(), 2);
    }

    #[tokio::test]
    async fn three_nodes_replicate_and_commit() {
        let mut c = Cluster::new(3).await;
        c.campaign(1).await;
        assert_eq!(c.node(1).role(), Role::Leader);
        assert_eq!(c.node(2).leader(), Some(1));
        assert_eq!(c.node(3).role(), Role::Follower);

        let id = c.propose(1, b"put x").await.unwrap();
        assert_eq!(c.node(1).commit_index(), id.index);
        for n in 1..=3 {
            assert_eq!(c.node(n).commit_index(), id.index, "node {n}");
            assert_eq!(c.node(n).last_log(), id);
        }
        let leader_log = c.log_of(1).await;
        assert_eq!(c.log_of(2).await, leader_log);
        assert_eq!(c.log_of(3).await, leader_log);
        c.assert_election_safety();
    }

    #[tokio::test]
    async fn proposal_on_follower_is_refused_without_mutation() {
        let mut c = Cluster::new(3).await;
        c.campaign(1).await;
        let before = c.log_of(2).await;

        let err = c.propose(2, b"nope").await.unwrap_err();
        assert_eq!(err, TkvError::NotLeader { leader: Some(1) });
        assert_eq!(c.log_of(2).await, before);
        assert_eq!(c.node(2).last_log(), before.last().unwrap().log_id());
    }

    #[tokio::test]
    async fn proposal_before_any_election_has_no_hint() {
        let mut c = Cluster::new(3).await;
        let err = c.propose(1, b"early").await.unwrap_err();
        assert_eq!(err, TkvError::NotLeader { leader: None });
        assert!(c.log_of(1).await.is_empty());
    }

    #[tokio::test]
    async fn one_vote_per_term() {
        let mut c = Cluster::new(3).await;
        let vote = |from: NodeId, last_log: LogId| Envelope { from, to: 2, term: 1, message: Message::RequestVote { last_log } };

        let r1 = c.nodes.get_mut(&2).unwrap().step(vote(1, LogId::default())).await.unwrap();
        let r3 = c.nodes.get_mut(&2).unwrap().step(vote(3, LogId::default())).await.unwrap();
        assert_eq!(r1.messages[0].message, Message::RequestVoteResponse { granted: true });
        assert_eq!(r3.messages[0].message, Message::RequestVoteResponse { granted: false });

        // The vote is durable.
        let hs = c.logs[&2].hard_state().await.unwrap();
        assert_eq!(hs.voted_for, Some(1));
        assert_eq!(hs.term, 1);
    }

    #[tokio::test]
    async fn vote_denied_to_candidate_with_shorter_log() {
        let mut c = Cluster::new(3).await;
        c.campaign(1).await;
        c.down.insert(3);
        c.propose(1, b"a").await.unwrap();
        c.propose(1, b"b").await.unwrap();
        c.down.remove(&3);

        // Node 3 missed the writes; nobody should elect it.
        c.campaign(3).await;
        assert_ne!(c.node(3).role(), Role::Leader);
        assert!(c.node(3).term() >= 2);
        c.assert_election_safety();

        // Node 1 or 2 can still win afterwards and keeps the history.
        c.campaign(2).await;
        assert_eq!(c.node(2).role(), Role::Leader);
        let log = c.log_of(2).await;
        assert_eq!(log[1].payload, b"a");
        assert_eq!(log[2].payload, b"b");
    }

    #[tokio::test]
    async fn stale_term_append_is_rejected_with_current_term() {
        let mut c = Cluster::new(3).await;
        c.campaign(1).await;
        c.campaign(2).await; // term 2
        let term = c.node(3).term();

        let stale = Envelope {
            from: 1,
            to: 3,
            term: 1,
            message: Message::Append { prev: LogId::default(), entries: vec![], commit: 0 },
        };
        let ready = c.nodes.get_mut(&3).unwrap().step(stale).await.unwrap();
        assert_eq!(ready.messages.len(), 1);
        assert_eq!(ready.messages[0].term, term);
        assert_eq!(
            ready.messages[0].message,
            Message::AppendResponse(AppendOutcome::Rejected(Rejection::StaleTerm))
        );
    }

    #[tokio::test]
    async fn deposed_leader_steps_down_and_truncates() {
        let mut c = Cluster::new(3).await;
        c.campaign(1).await;
        assert_eq!(c.node(1).commit_index(), 1);

        // Node 1 is partitioned and keeps accepting proposals nobody sees.
        c.down.insert(1);
        c.propose(1, b"lost-1").await.unwrap();
        c.propose(1, b"lost-2").await.unwrap();
        assert_eq!(c.node(1).last_log(), LogId::new(1, 3));
        assert_eq!(c.node(1).commit_index(), 1);

        // The majority moves on.
        c.campaign(2).await;
        assert_eq!(c.node(2).role(), Role::Leader);
        let kept = c.propose(2, b"kept").await.unwrap();

        // Heal: the old leader hears the new term, steps down, and its
        // uncommitted suffix is replaced.
        c.down.remove(&1);
        c.heartbeat(2).await;
        c.heartbeat(2).await;

        assert_eq!(c.node(1).role(), Role::Follower);
        assert_eq!(c.node(1).leader(), Some(2));
        assert_eq!(c.log_of(1).await, c.log_of(2).await);
        assert_eq!(c.node(1).commit_index(), kept.index);
        assert!(c.truncations.contains(&(1, 2)), "truncations: {:?}", c.truncations);
        c.assert_election_safety();
    }

    #[tokio::test]
    async fn prior_term_entries_commit_only_with_current_term_entry() {
        let log = Arc::new(MemLogStorage::default());
        log.append(vec![Entry::normal(1, 1, b"a".to_vec()), Entry::normal(2, 1, b"b".to_vec())])
            .await
            .unwrap();
        log.save_hard_state(HardState { term: 1, voted_for: None, commit: 0 }).await.unwrap();

        let mut node = Node::open(RaftConfig::new(1, vec![1, 2, 3]), log.clone(), 0).await.unwrap();
        node.campaign().await.unwrap();
        assert_eq!(node.term(), 2);

        let grant = Envelope { from: 2, to: 1, term: 2, message: Message::RequestVoteResponse { granted: true } };
        node.step(grant).await.unwrap();
        assert_eq!(node.role(), Role::Leader);
        assert_eq!(node.last_log(), LogId::new(2, 3), "no-op appended in the new term");

        // A majority holds index 2, but it is from term 1.
        let ack = |match_index| Envelope {
            from: 2,
            to: 1,
            term: 2,
            message: Message::AppendResponse(AppendOutcome::Accepted { match_index }),
        };
        let ready = node.step(ack(2)).await.unwrap();
        assert_eq!(node.commit_index(), 0);
        assert!(ready.commit.is_none());

        let ready = node.step(ack(3)).await.unwrap();
        assert_eq!(node.commit_index(), 3);
        assert_eq!(ready.commit, Some(3));
        assert_eq!(log.hard_state().await.unwrap().commit, 3);
    }

    #[tokio::test]
    async fn follower_rejection_carries_conflict_term_hint() {
        let log = Arc::new(MemLogStorage::default());
        log.append(vec![
            Entry::normal(1, 1, vec![]),
            Entry::normal(2, 2, vec![]),
            Entry::normal(3, 2, vec![]),
            Entry::normal(4, 2, vec![]),
        ])
        .await
        .unwrap();
        log.save_hard_state(HardState { term: 2, voted_for: None, commit: 1 }).await.unwrap();
        let mut node = Node::open(RaftConfig::new(2, vec![1, 2, 3]), log, 0).await.unwrap();

        let append = Envelope {
            from: 1,
            to: 2,
            term: 3,
            message: Message::Append { prev: LogId::new(3, 4), entries: vec![], commit: 1 },
        };
        let ready = node.step(append).await.unwrap();
        assert_eq!(
            ready.messages[0].message,
            Message::AppendResponse(AppendOutcome::Rejected(Rejection::LogConflict {
                rejected: 4,
                conflict_term: Some(2),
                hint: 2,
            }))
        );

        let beyond = Envelope {
            from: 1,
            to: 2,
            term: 3,
            message: Message::Append { prev: LogId::new(3, 9), entries: vec![], commit: 1 },
        };
        let ready = node.step(beyond).await.unwrap();
        assert_eq!(
            ready.messages[0].message,
            Message::AppendResponse(AppendOutcome::Rejected(Rejection::LogConflict {
                rejected: 9,
                conflict_term: None,
                hint: 5,
            }))
        );
    }

    #[tokio::test]
    async fn stale_append_does_not_truncate() {
        let mut c = Cluster::new(3).await;
        c.campaign(1).await;
        c.propose(1, b"a").await.unwrap();
        c.propose(1, b"b").await.unwrap();
        let before = c.log_of(2).await;

        // A delayed copy of the first replication round.
        let delayed = Envelope {
            from: 1,
            to: 2,
            term: 1,
            message: Message::Append { prev: LogId::default(), entries: before[..1].to_vec(), commit: 0 },
        };
        let ready = c.nodes.get_mut(&2).unwrap().step(delayed).await.unwrap();
        assert!(ready.truncated_from.is_none());
        assert_eq!(c.log_of(2).await, before);
    }

    #[tokio::test]
    async fn election_timeout_starts_campaign() {
        let mut c = Cluster::new(3).await;
        let ticks = 2 * c.node(2).config.election_tick;
        let mut requested = false;
        for _ in 0..ticks {
            let ready = c.nodes.get_mut(&2).unwrap().tick().await.unwrap();
            if ready.messages.iter().any(|m| matches!(m.message, Message::RequestVote { .. })) {
                requested = true;
                break;
            }
        }
        assert!(requested);
        assert_eq!(c.node(2).role(), Role::Candidate);
        assert_eq!(c.node(2).term(), 1);
    }

    #[tokio::test]
    async fn leader_heartbeats_do_not_trigger_elections() {
        let mut c = Cluster::new(3).await;
        c.campaign(1).await;
        for _ in 0..50 {
            c.heartbeat(1).await;
            for id in [2, 3] {
                let ready = c.nodes.get_mut(&id).unwrap().tick().await.unwrap();
                c.absorb(id, ready);
            }
            c.pump().await;
        }
        assert_eq!(c.node(1).role(), Role::Leader);
        assert_eq!(c.node(1).term(), 1);
    }

    #[tokio::test]
    async fn restart_resumes_from_persisted_state() {
        let mut c = Cluster::new(3).await;
        c.campaign(1).await;
        let id = c.propose(1, b"durable").await.unwrap();

        let log = c.logs[&2].clone();
        let node = Node::open(RaftConfig::new(2, vec![1, 2, 3]), log, 0).await.unwrap();
        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.term(), 1);
        assert_eq!(node.last_log(), id);
        assert_eq!(node.commit_index(), id.index);
        assert_eq!(node.applied_index(), 0);
        assert_eq!(node.committed_entries(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lagging_peer_behind_compaction_needs_snapshot() {
        let mut c = Cluster::new(3).await;
        c.campaign(1).await;
        c.down.insert(3);
        for i in 0..5u8 {
            c.propose(1, &[i]).await.unwrap();
        }
        let commit = c.node(1).commit_index();
        let leader = c.nodes.get_mut(&1).unwrap();
        leader.advance_applied(commit);
        leader.compact(commit).await.unwrap();
        assert_eq!(leader.first_index(), commit + 1);

        c.down.remove(&3);
        for _ in 0..3 {
            c.heartbeat(1).await;
        }
        assert_eq!(c.snapshot_requests, vec![3], "one request while a transfer is in flight");

        // A failed transfer puts the peer back into probing, which asks again.
        c.nodes.get_mut(&1).unwrap().snapshot_sent(3, None);
        c.heartbeat(1).await;
        assert_eq!(c.snapshot_requests, vec![3, 3]);
    }
}
