use chrono::Utc;
use dashmap::DashMap;
use icrawl_core::{NodeDescriptor, NodeHealth, NodeRole};

/// Read-mostly map of cluster peers keyed by node name. Mutated in place by
/// the Health Monitor and Failover Controller; read without locking by
/// everyone else, since every reader tolerates a slightly stale snapshot.
pub struct NodeRegistry {
    nodes: DashMap<String, NodeDescriptor>,
}

impl NodeRegistry {
    pub fn new(nodes: impl IntoIterator<Item = NodeDescriptor>) -> Self {
        let map = DashMap::new();
        for node in nodes {
            map.insert(node.name.clone(), node);
        }
        Self { nodes: map }
    }

    pub fn snapshot(&self) -> Vec<NodeDescriptor> {
        self.nodes.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<NodeDescriptor> {
        self.nodes.get(name).map(|e| e.value().clone())
    }

    pub fn primary(&self) -> Option<NodeDescriptor> {
        self.nodes.iter().find(|e| e.role == NodeRole::Primary).map(|e| e.value().clone())
    }

    pub fn primary_name(&self) -> Option<String> {
        self.primary().map(|n| n.name)
    }

    pub fn secondaries(&self) -> Vec<NodeDescriptor> {
        self.nodes.iter().filter(|e| e.role != NodeRole::Primary).map(|e| e.value().clone()).collect()
    }

    /// Candidates for failover target: healthy, role secondary/standby,
    /// ordered by ascending static priority (smallest wins). See spec.md §4.9.
    pub fn failover_candidates(&self) -> Vec<NodeDescriptor> {
        let mut candidates: Vec<NodeDescriptor> =
            self.nodes.iter().map(|e| e.value().clone()).filter(|n| n.is_failover_candidate()).collect();
        candidates.sort_by_key(|n| n.priority);
        candidates
    }

    pub fn record_probe_success(&self, name: &str) {
        if let Some(mut node) = self.nodes.get_mut(name) {
            node.consecutive_failures = 0;
            node.health = NodeHealth::Healthy;
            node.last_probe = Some(Utc::now());
            node.last_error = None;
        }
    }

    /// Increments the failure counter and returns the new count.
    pub fn record_probe_failure(&self, name: &str, error: &str, failure_threshold: u32) -> u32 {
        let mut count = 0;
        if let Some(mut node) = self.nodes.get_mut(name) {
            node.consecutive_failures += 1;
            node.last_probe = Some(Utc::now());
            node.last_error = Some(error.to_string());
            if node.consecutive_failures >= failure_threshold {
                node.health = NodeHealth::Offline;
            }
            count = node.consecutive_failures;
        }
        count
    }

    pub fn set_replication_lag(&self, name: &str, lag_secs: f64) {
        if let Some(mut node) = self.nodes.get_mut(name) {
            node.replication_lag_secs = lag_secs;
        }
    }

    pub fn set_role(&self, name: &str, role: NodeRole) {
        if let Some(mut node) = self.nodes.get_mut(name) {
            node.role = role;
        }
    }

    pub fn clear_failure_counters(&self) {
        for mut entry in self.nodes.iter_mut() {
            entry.consecutive_failures = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icrawl_core::NodeHealth;

    fn node(name: &str, role: NodeRole, priority: i32, health: NodeHealth) -> NodeDescriptor {
        NodeDescriptor {
            name: name.to_string(),
            role,
            priority,
            address: format!("{name}:5432"),
            database_url: format!("postgres://{name}"),
            health,
            consecutive_failures: 0,
            replication_lag_secs: 0.0,
            last_probe: None,
            last_error: None,
        }
    }

    #[test]
    fn failover_candidates_sorted_by_priority_ascending() {
        let registry = NodeRegistry::new([
            node("p", NodeRole::Primary, 1, NodeHealth::Healthy),
            node("s2", NodeRole::Secondary, 3, NodeHealth::Healthy),
            node("s1", NodeRole::Secondary, 2, NodeHealth::Healthy),
            node("standby", NodeRole::Standby, 5, NodeHealth::Offline),
        ]);
        let candidates = registry.failover_candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].name, "s1");
        assert_eq!(candidates[1].name, "s2");
    }

    #[test]
    fn probe_failure_marks_offline_at_threshold() {
        let registry = NodeRegistry::new([node("s1", NodeRole::Secondary, 2, NodeHealth::Healthy)]);
        registry.record_probe_failure("s1", "timeout", 3);
        registry.record_probe_failure("s1", "timeout", 3);
        assert_eq!(registry.get("s1").unwrap().health, NodeHealth::Healthy);
        registry.record_probe_failure("s1", "timeout", 3);
        assert_eq!(registry.get("s1").unwrap().health, NodeHealth::Offline);
    }
}
