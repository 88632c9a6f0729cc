//! Leader election for background jobs

use std::sync::atomic::{AtomicBool, Ordering};

/// Only the leader of the fleet runs the consistency checks
pub trait LeaderElection: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Leadership fixed by configuration, switchable at runtime
#[derive(Debug, Default)]
pub struct StaticLeader {
    leader: AtomicBool,
}

impl StaticLeader {
    pub fn new(leader: bool) -> Self {
        Self {
            leader: AtomicBool::new(leader),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        let was = self.leader.swap(leader, Ordering::SeqCst);
        if was != leader {
            tracing::info!(leader, "leadership changed");
        }
    }
}

impl LeaderElection for StaticLeader {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_leader() {
        let leader = StaticLeader::new(false);
        assert!(!leader.is_leader());
        leader.set_leader(true);
        assert!(leader.is_leader());
    }
}
