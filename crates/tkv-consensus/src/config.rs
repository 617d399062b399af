use std::time::Duration;

use tkv_types::{NodeId, TkvError};

/// Parameters of the consensus state machine, in ticks.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub id: NodeId,
    /// Every voting member of the group, including `id`.
    pub voters: Vec<NodeId>,
    /// Base election timeout. The effective timeout is drawn uniformly from
    /// `[election_tick, 2 * election_tick)` on every reset.
    pub election_tick: u32,
    pub heartbeat_tick: u32,
    /// Upper bound on entries carried by one append message.
    pub max_append_entries: usize,
}

impl RaftConfig {
    pub fn new(id: NodeId, voters: Vec<NodeId>) -> Self {
        RaftConfig { id, voters, election_tick: 10, heartbeat_tick: 2, max_append_entries: 64 }
    }

    pub fn validate(&self) -> Result<(), TkvError> {
        if self.voters.is_empty() {
            return Err(TkvError::InvalidArgument("voter set is empty".into()));
        }
        if !self.voters.contains(&self.id) {
            return Err(TkvError::InvalidArgument(format!(
                "node {} is not in the voter set {:?}",
                self.id, self.voters
            )));
        }
        if self.heartbeat_tick == 0 {
            return Err(TkvError::InvalidArgument("heartbeat_tick must be positive".into()));
        }
        if self.election_tick <= self.heartbeat_tick {
            return Err(TkvError::InvalidArgument(
                "election_tick must exceed heartbeat_tick".into(),
            ));
        }
        if self.max_append_entries == 0 {
            return Err(TkvError::InvalidArgument("max_append_entries must be positive".into()));
        }
        Ok(())
    }

    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }
}

/// Runtime parameters of a replica: the consensus settings plus the wall
/// clock and storage housekeeping around them.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub raft: RaftConfig,
    pub tick_interval: Duration,
    /// Compact the log once it holds more applied entries than this.
    pub snapshot_threshold: u64,
    pub snapshot_chunk_size: usize,
    /// Deadline for a write to be applied.
    pub request_timeout: Duration,
    /// Committed entries applied per apply-loop pass.
    pub apply_batch: usize,
}

impl ReplicaConfig {
    pub fn new(raft: RaftConfig) -> Self {
        ReplicaConfig {
            raft,
            tick_interval: Duration::from_millis(100),
            snapshot_threshold: 1024,
            snapshot_chunk_size: 64 * 1024,
            request_timeout: Duration::from_secs(3),
            apply_batch: 256,
        }
    }

    pub fn validate(&self) -> Result<(), TkvError> {
        self.raft.validate()?;
        if self.tick_interval.is_zero() {
            return Err(TkvError::InvalidArgument("tick_interval must be positive".into()));
        }
        if self.snapshot_threshold == 0 || self.snapshot_chunk_size == 0 || self.apply_batch == 0 {
            return Err(TkvError::InvalidArgument(
                "snapshot_threshold, snapshot_chunk_size and apply_batch must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ReplicaConfig::new(RaftConfig::new(1, vec![1, 2, 3])).validate().is_ok());
    }

    #[test]
    fn rejects_node_outside_voters() {
        let err = RaftConfig::new(4, vec![1, 2, 3]).validate().unwrap_err();
        assert!(matches!(err, TkvError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_election_not_longer_than_heartbeat() {
        let mut cfg = RaftConfig::new(1, vec![1]);
        cfg.election_tick = cfg.heartbeat_tick;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn quorum_is_strict_majority() {
        assert_eq!(RaftConfig::new(1, vec![1]).quorum(), 1);
        assert_eq!(RaftConfig::new(1, vec![1, 2]).quorum(), 2);
        assert_eq!(RaftConfig::new(1, vec![1, 2, 3]).quorum(), 2);
        assert_eq!(RaftConfig::new(1, vec![1, 2, 3, 4, 5]).quorum(), 3);
    }
}
