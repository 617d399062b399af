use tkv_types::LogIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// Searching for the match point; one append in flight at a time.
    Probe,
    /// Match point known; appends are pipelined.
    Replicate,
    /// Waiting on a snapshot transfer; no appends are sent.
    Snapshot,
}

/// Leader-side view of one follower's log.
#[derive(Debug, Clone)]
pub struct Progress {
    pub matched: LogIndex,
    pub next: LogIndex,
    pub state: ProgressState,
    paused: bool,
}

impl Progress {
    pub fn new(next: LogIndex) -> Self {
        Progress { matched: 0, next, state: ProgressState::Probe, paused: false }
    }

    pub fn can_send(&self) -> bool {
        match self.state {
            ProgressState::Probe => !self.paused,
            ProgressState::Replicate => true,
            ProgressState::Snapshot => false,
        }
    }

    pub fn on_sent(&mut self, last_sent: Option<LogIndex>) {
        match self.state {
            ProgressState::Probe => self.paused = true,
            ProgressState::Replicate => {
                if let Some(i) = last_sent {
                    self.next = i + 1;
                }
            }
            ProgressState::Snapshot => {}
        }
    }

    /// Returns whether `matched` advanced.
    pub fn on_accepted(&mut self, match_index: LogIndex) -> bool {
        let advanced = match_index > self.matched;
        if advanced {
            self.matched = match_index;
        }
        self.next = self.next.max(match_index + 1);
        self.paused = false;
        if self.state != ProgressState::Replicate {
            self.state = ProgressState::Replicate;
        }
        advanced
    }

    /// Rewind to `next` after a failed consistency probe. Never rewinds at or
    /// below the known match point.
    pub fn on_rejected(&mut self, next: LogIndex) {
        self.next = next.max(self.matched + 1);
        self.state = ProgressState::Probe;
        self.paused = false;
    }

    /// Called on heartbeat: lets a paused probe send again, and makes a
    /// pipelined follower that fell behind resend from its match point.
    pub fn resume(&mut self, last_index: LogIndex) {
        self.paused = false;
        if self.state == ProgressState::Replicate && self.matched < last_index {
            self.state = ProgressState::Probe;
            self.next = self.matched + 1;
        }
    }

    pub fn begin_snapshot(&mut self) {
        self.state = ProgressState::Snapshot;
    }

    /// `installed` is the snapshot index on success.
    pub fn snapshot_finished(&mut self, installed: Option<LogIndex>) {
        if self.state != ProgressState::Snapshot {
            return;
        }
        self.state = ProgressState::Probe;
        self.paused = false;
        if let Some(index) = installed {
            self.next = self.next.max(index + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_sends_one_at_a_time() {
        let mut pr = Progress::new(5);
        assert!(pr.can_send());
        pr.on_sent(Some(7));
        assert!(!pr.can_send());
        assert_eq!(pr.next, 5);
        pr.resume(7);
        assert!(pr.can_send());
    }

    #[test]
    fn acceptance_switches_to_pipelining() {
        let mut pr = Progress::new(5);
        assert!(pr.on_accepted(6));
        assert_eq!(pr.state, ProgressState::Replicate);
        pr.on_sent(Some(9));
        assert_eq!(pr.next, 10);
        assert!(pr.can_send());
        assert!(!pr.on_accepted(4));
        assert_eq!(pr.matched, 6);
    }

    #[test]
    fn rejection_never_rewinds_below_match() {
        let mut pr = Progress::new(10);
        pr.on_accepted(6);
        pr.on_rejected(2);
        assert_eq!(pr.next, 7);
        assert_eq!(pr.state, ProgressState::Probe);
    }

    #[test]
    fn snapshot_blocks_appends_until_finished() {
        let mut pr = Progress::new(3);
        pr.begin_snapshot();
        assert!(!pr.can_send());
        pr.snapshot_finished(Some(40));
        assert_eq!(pr.state, ProgressState::Probe);
        assert_eq!(pr.next, 41);
        assert!(pr.can_send());
    }

    #[test]
    fn lagging_pipeline_falls_back_on_heartbeat() {
        let mut pr = Progress::new(1);
        pr.on_accepted(3);
        pr.on_sent(Some(8));
        pr.resume(8);
        assert_eq!(pr.state, ProgressState::Probe);
        assert_eq!(pr.next, 4);
    }
}
