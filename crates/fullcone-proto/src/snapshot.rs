//! Derived forwarding rule set

use std::net::SocketAddr;

/// One inbound forwarding rule: traffic arriving on `listen` goes to `target`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForwardRule {
    pub listen: SocketAddr,
    pub target: SocketAddr,
}

/// Read-only view of every allocation that must be expressed in the proxy
/// configuration, ordered by external port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    rules: Vec<ForwardRule>,
}

impl ConfigSnapshot {
    pub fn new(mut rules: Vec<ForwardRule>) -> Self {
        rules.sort_by_key(|rule| (rule.listen.port(), rule.listen.ip(), rule.target));
        Self { rules }
    }

    pub fn rules(&self) -> &[ForwardRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// External port currently bound to an internal endpoint
    pub fn port_for(&self, internal: &SocketAddr) -> Option<u16> {
        self.rules
            .iter()
            .find(|rule| rule.target == *internal)
            .map(|rule| rule.listen.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(listen: &str, target: &str) -> ForwardRule {
        ForwardRule {
            listen: listen.parse().unwrap(),
            target: target.parse().unwrap(),
        }
    }

    #[test]
    fn test_rules_are_ordered_by_port() {
        let snapshot = ConfigSnapshot::new(vec![
            rule("203.0.113.7:40002", "192.168.25.10:80"),
            rule("203.0.113.7:1025", "192.168.25.11:80"),
            rule("203.0.113.7:40000", "192.168.25.44:5000"),
        ]);

        let ports: Vec<u16> = snapshot.rules().iter().map(|r| r.listen.port()).collect();
        assert_eq!(ports, vec![1025, 40000, 40002]);
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let a = ConfigSnapshot::new(vec![
            rule("203.0.113.7:40000", "192.168.25.44:5000"),
            rule("203.0.113.7:40001", "192.168.25.45:5000"),
        ]);
        let b = ConfigSnapshot::new(vec![
            rule("203.0.113.7:40001", "192.168.25.45:5000"),
            rule("203.0.113.7:40000", "192.168.25.44:5000"),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_port_for() {
        let snapshot = ConfigSnapshot::new(vec![rule("203.0.113.7:40000", "192.168.25.44:5000")]);

        assert_eq!(
            snapshot.port_for(&"192.168.25.44:5000".parse().unwrap()),
            Some(40000)
        );
        assert_eq!(snapshot.port_for(&"192.168.25.44:5001".parse().unwrap()), None);
    }
}
