//! Process bookkeeping: the supervisor's view of a spawned child.

use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited,
    Failed,
}

/// Snapshot of a restart policy plus enough of the original spawn request
/// to faithfully re-spawn the child (command/args/rpc-ness), since a
/// restarted process gets a brand new `ProcessRecord`.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub enabled: bool,
    /// Negative means unlimited.
    pub max_restarts: i64,
    pub restart_count: i64,
    pub command: String,
    pub args: Vec<String>,
    pub is_rpc: bool,
}

impl RestartPolicy {
    pub fn new(max_restarts: i64, command: impl Into<String>, args: Vec<String>, is_rpc: bool) -> Self {
        Self {
            enabled: true,
            max_restarts,
            restart_count: 0,
            command: command.into(),
            args,
            is_rpc,
        }
    }

    /// Whether another restart attempt is permitted given `restart_count`.
    pub fn may_restart(&self) -> bool {
        self.enabled && (self.max_restarts < 0 || self.restart_count < self.max_restarts)
    }

    /// The policy snapshot to carry into the next record, with the count
    /// incremented for the restart that's about to happen.
    pub fn next_attempt(&self) -> Self {
        Self {
            restart_count: self.restart_count + 1,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub id: String,
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub restart_policy: Option<RestartPolicy>,
    pub is_rpc: bool,
}

impl ProcessRecord {
    pub fn new(id: impl Into<String>, pid: u32, command: impl Into<String>, args: Vec<String>, is_rpc: bool) -> Self {
        Self {
            id: id.into(),
            pid,
            command: command.into(),
            args,
            status: ProcessStatus::Running,
            exit_code: None,
            start_time: SystemTime::now(),
            end_time: None,
            restart_policy: None,
            is_rpc,
        }
    }

    pub fn failed(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            pid: 0,
            command: command.into(),
            args,
            status: ProcessStatus::Failed,
            exit_code: None,
            start_time: SystemTime::now(),
            end_time: Some(SystemTime::now()),
            restart_policy: None,
            is_rpc: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policy_honors_max_restarts() {
        let mut policy = RestartPolicy::new(2, "/bin/echo", vec![], false);
        assert!(policy.may_restart());
        policy = policy.next_attempt();
        assert_eq!(policy.restart_count, 1);
        assert!(policy.may_restart());
        policy = policy.next_attempt();
        assert_eq!(policy.restart_count, 2);
        assert!(!policy.may_restart());
    }

    #[test]
    fn negative_max_restarts_is_unlimited() {
        let policy = RestartPolicy::new(-1, "/bin/echo", vec![], false);
        assert!(policy.may_restart());
    }
}
