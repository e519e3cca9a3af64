//! Provisioner feedback.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Idle flag for one agent, as seen by the provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdleState {
    pub name: String,
    pub is_idle: bool,
}

/// Demand signal forwarded to the provisioner after each scheduling pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScalingInfo {
    pub desired_new_instances: usize,
    pub agents: BTreeMap<String, AgentIdleState>,
}

impl ScalingInfo {
    /// Replaces the contents and reports whether anything changed.
    pub fn update(
        &mut self,
        desired_new_instances: usize,
        agents: BTreeMap<String, AgentIdleState>,
    ) -> bool {
        let changed = self.desired_new_instances != desired_new_instances || self.agents != agents;
        if changed {
            self.desired_new_instances = desired_new_instances;
            self.agents = agents;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle(name: &str, is_idle: bool) -> (String, AgentIdleState) {
        (
            name.to_string(),
            AgentIdleState {
                name: name.to_string(),
                is_idle,
            },
        )
    }

    #[test]
    fn test_update_reports_changes_only() {
        let mut info = ScalingInfo::default();
        let agents: BTreeMap<_, _> = [idle("agent1", true)].into_iter().collect();

        assert!(info.update(1, agents.clone()));
        assert!(!info.update(1, agents.clone()));

        let busy: BTreeMap<_, _> = [idle("agent1", false)].into_iter().collect();
        assert!(info.update(1, busy));
        assert!(info.update(2, agents));
        assert_eq!(info.desired_new_instances, 2);
    }
}
