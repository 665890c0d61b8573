//! Allocation table and external port allocator
//!
//! An allocation binds one internal endpoint to one external port for as
//! long as any flow from that endpoint is alive, plus a cool-down. Releasing
//! the last reference does not free the port: the allocation is kept in
//! reserve so a reconnecting host lands on the same external port, and the
//! port only returns to the pool once [`AllocationTable::expire`] runs past
//! the reservation.

use chrono::{DateTime, Utc};
use fullcone_proto::{ConfigSnapshot, ForwardRule};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AllocationError {
    #[error("No free external port in {start}-{end} for {internal}")]
    PortSpaceExhausted {
        internal: SocketAddr,
        start: u16,
        end: u16,
    },

    #[error("No allocation for {0}")]
    NotAllocated(SocketAddr),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PortRangeError {
    #[error("Invalid port range format '{0}'. Expected: START-END (e.g., 10000-20000)")]
    Format(String),

    #[error("Invalid port: {0}")]
    Port(String),

    #[error("Start port must not exceed end port")]
    Inverted,

    #[error("Port 0 cannot be allocated")]
    ZeroPort,
}

/// Reservation state of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Active,
    CoolingDown { until: Instant },
}

/// Binding of an internal endpoint to an external port
#[derive(Debug, Clone)]
pub struct Allocation {
    pub internal: SocketAddr,
    /// Listen address and port on the external side
    pub external: SocketAddr,
    pub refs: u32,
    pub created_at: DateTime<Utc>,
    pub state: AllocationState,
}

impl Allocation {
    pub fn port(&self) -> u16 {
        self.external.port()
    }
}

/// How `acquire` satisfied a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// Endpoint already held an active allocation
    Shared,
    /// Endpoint's allocation was cooling down and got reactivated
    Reactivated,
    /// A fresh allocation was created
    Created,
}

/// Inclusive range of external ports with a free list
#[derive(Debug, Clone)]
pub struct PortPool {
    range_start: u16,
    range_end: u16,
    free: BTreeSet<u16>,
}

impl PortPool {
    pub fn new(range_start: u16, range_end: u16) -> Self {
        Self {
            range_start,
            range_end,
            free: (range_start..=range_end).collect(),
        }
    }

    /// Parse a "START-END" range string
    pub fn parse_range(range_str: &str) -> Result<(u16, u16), PortRangeError> {
        let (start, end) = range_str
            .split_once('-')
            .ok_or_else(|| PortRangeError::Format(range_str.to_string()))?;

        let start: u16 = start
            .trim()
            .parse()
            .map_err(|_| PortRangeError::Port(start.to_string()))?;
        let end: u16 = end
            .trim()
            .parse()
            .map_err(|_| PortRangeError::Port(end.to_string()))?;

        if start == 0 {
            return Err(PortRangeError::ZeroPort);
        }
        if start > end {
            return Err(PortRangeError::Inverted);
        }

        Ok((start, end))
    }

    pub fn range(&self) -> (u16, u16) {
        (self.range_start, self.range_end)
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.range_start && port <= self.range_end
    }

    pub fn is_free(&self, port: u16) -> bool {
        self.free.contains(&port)
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    fn put(&mut self, port: u16) {
        if self.contains(port) {
            self.free.insert(port);
        }
    }

    /// Deterministic preferred port for an endpoint
    fn hash_to_port(&self, internal: &SocketAddr) -> u16 {
        let mut hasher = DefaultHasher::new();
        internal.hash(&mut hasher);
        let hash = hasher.finish();

        let range_size = (self.range_end - self.range_start) as u64 + 1;
        self.range_start + (hash % range_size) as u16
    }

    /// Choose and take a free port
    ///
    /// Preference order: the port the kernel already translated to, a
    /// hash-derived port, its neighbours within ±10, then the lowest free
    /// port.
    fn take(&mut self, internal: &SocketAddr, hint: Option<u16>) -> Option<u16> {
        if let Some(port) = hint {
            if self.free.remove(&port) {
                return Some(port);
            }
        }

        let preferred = self.hash_to_port(internal);
        if self.free.remove(&preferred) {
            return Some(preferred);
        }

        for offset in 1..=10u16 {
            for port in [
                preferred.saturating_add(offset),
                preferred.saturating_sub(offset),
            ] {
                if self.contains(port) && self.free.remove(&port) {
                    return Some(port);
                }
            }
        }

        let fallback = self.free.iter().next().copied()?;
        self.free.remove(&fallback);
        Some(fallback)
    }
}

/// Owner of every allocation; all mutations go through `&mut self`
pub struct AllocationTable {
    pool: PortPool,
    by_endpoint: HashMap<SocketAddr, Allocation>,
    by_port: HashMap<u16, SocketAddr>,
    cooldown: Duration,
    generation: u64,
}

impl AllocationTable {
    pub fn new(pool: PortPool, cooldown: Duration) -> Self {
        Self {
            pool,
            by_endpoint: HashMap::new(),
            by_port: HashMap::new(),
            cooldown,
            generation: 0,
        }
    }

    /// Counter that moves whenever the rule set changes
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, internal: &SocketAddr) -> Option<&Allocation> {
        self.by_endpoint.get(internal)
    }

    /// Internal endpoint currently holding an external port
    pub fn holder(&self, port: u16) -> Option<SocketAddr> {
        self.by_port.get(&port).copied()
    }

    pub fn len(&self) -> usize {
        self.by_endpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_endpoint.is_empty()
    }

    pub fn pool(&self) -> &PortPool {
        &self.pool
    }

    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.by_endpoint.values()
    }

    /// Take a reference on the endpoint's allocation, creating it if needed
    ///
    /// `translated` is the post-NAT endpoint the kernel chose for the flow;
    /// its address becomes the listen address of a new allocation and its
    /// port is tried first.
    pub fn acquire(
        &mut self,
        internal: SocketAddr,
        translated: SocketAddr,
    ) -> Result<(u16, Acquisition), AllocationError> {
        if let Some(allocation) = self.by_endpoint.get_mut(&internal) {
            allocation.refs += 1;
            let port = allocation.port();

            // The external address moved (e.g. new WAN lease); follow it
            if allocation.external.ip() != translated.ip() {
                info!(
                    "Listen address for {} changed from {} to {}",
                    internal,
                    allocation.external.ip(),
                    translated.ip()
                );
                allocation.external.set_ip(translated.ip());
                self.generation += 1;
            }

            if let AllocationState::CoolingDown { .. } = allocation.state {
                allocation.state = AllocationState::Active;
                info!("Reusing reserved port {} for {}", port, internal);
                return Ok((port, Acquisition::Reactivated));
            }

            debug!(
                "Port {} for {} now has {} reference(s)",
                port, internal, allocation.refs
            );
            return Ok((port, Acquisition::Shared));
        }

        let hint = Some(translated.port()).filter(|port| self.pool.contains(*port));
        let (start, end) = self.pool.range();
        let port = self
            .pool
            .take(&internal, hint)
            .ok_or(AllocationError::PortSpaceExhausted {
                internal,
                start,
                end,
            })?;

        let allocation = Allocation {
            internal,
            external: SocketAddr::new(translated.ip(), port),
            refs: 1,
            created_at: Utc::now(),
            state: AllocationState::Active,
        };

        if hint == Some(port) {
            info!("Allocated port {} for {} (kernel mapping)", port, internal);
        } else {
            info!(
                "Allocated port {} for {} (kernel chose {})",
                port,
                internal,
                translated.port()
            );
        }

        self.by_port.insert(port, internal);
        self.by_endpoint.insert(internal, allocation);
        self.generation += 1;

        Ok((port, Acquisition::Created))
    }

    /// Drop one reference; the last one starts the cool-down
    ///
    /// Returns the remaining reference count.
    pub fn release(&mut self, internal: &SocketAddr, now: Instant) -> Result<u32, AllocationError> {
        let allocation = self
            .by_endpoint
            .get_mut(internal)
            .ok_or(AllocationError::NotAllocated(*internal))?;

        if allocation.refs == 0 {
            warn!("Release of {} with no outstanding references", internal);
            return Ok(0);
        }

        allocation.refs -= 1;
        if allocation.refs == 0 {
            let until = now + self.cooldown;
            allocation.state = AllocationState::CoolingDown { until };
            info!(
                "Port {} for {} reserved for {:?}",
                allocation.port(),
                internal,
                self.cooldown
            );
        }

        Ok(allocation.refs)
    }

    /// Remove allocations whose cool-down has elapsed and free their ports
    pub fn expire(&mut self, now: Instant) -> Vec<Allocation> {
        let expired: Vec<SocketAddr> = self
            .by_endpoint
            .iter()
            .filter_map(|(internal, allocation)| match allocation.state {
                AllocationState::CoolingDown { until } if until <= now => Some(*internal),
                _ => None,
            })
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for internal in expired {
            if let Some(allocation) = self.by_endpoint.remove(&internal) {
                self.by_port.remove(&allocation.port());
                self.pool.put(allocation.port());
                info!(
                    "Released port {} for {} after cool-down",
                    allocation.port(),
                    internal
                );
                removed.push(allocation);
            }
        }

        if !removed.is_empty() {
            self.generation += 1;
        }
        removed
    }

    /// Rules for every allocation, active or cooling down
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot::new(
            self.by_endpoint
                .values()
                .map(|allocation| ForwardRule {
                    listen: allocation.external,
                    target: allocation.internal,
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn table(start: u16, end: u16) -> AllocationTable {
        AllocationTable::new(PortPool::new(start, end), Duration::from_secs(60))
    }

    #[test]
    fn test_acquire_prefers_kernel_port() {
        let mut table = table(1024, 65535);

        let (port, how) = table
            .acquire(addr("192.168.25.44:5000"), addr("203.0.113.7:40000"))
            .unwrap();

        assert_eq!(port, 40000);
        assert_eq!(how, Acquisition::Created);
        assert_eq!(table.holder(40000), Some(addr("192.168.25.44:5000")));
        assert_eq!(
            table.get(&addr("192.168.25.44:5000")).unwrap().external,
            addr("203.0.113.7:40000")
        );
    }

    #[test]
    fn test_same_endpoint_shares_port() {
        let mut table = table(1024, 65535);
        let internal = addr("192.168.25.44:5000");

        let (first, _) = table.acquire(internal, addr("203.0.113.7:40000")).unwrap();
        let generation = table.generation();
        let (second, how) = table.acquire(internal, addr("203.0.113.7:40000")).unwrap();

        assert_eq!(first, second);
        assert_eq!(how, Acquisition::Shared);
        assert_eq!(table.get(&internal).unwrap().refs, 2);
        assert_eq!(table.generation(), generation);
    }

    #[test]
    fn test_port_held_by_other_endpoint_is_not_reused() {
        let mut table = table(1024, 65535);

        let (a, _) = table
            .acquire(addr("192.168.25.44:5000"), addr("203.0.113.7:40000"))
            .unwrap();
        let (b, _) = table
            .acquire(addr("192.168.25.45:5000"), addr("203.0.113.7:40000"))
            .unwrap();

        assert_eq!(a, 40000);
        assert_ne!(b, 40000);
        assert_eq!(table.holder(b), Some(addr("192.168.25.45:5000")));
    }

    #[test]
    fn test_kernel_port_outside_pool_falls_back() {
        let mut table = table(20000, 20009);

        let (port, _) = table
            .acquire(addr("192.168.25.44:5000"), addr("203.0.113.7:40000"))
            .unwrap();

        assert!((20000..=20009).contains(&port));
    }

    #[test]
    fn test_exhaustion() {
        let mut table = table(20000, 20001);

        table
            .acquire(addr("192.168.25.1:1"), addr("203.0.113.7:20000"))
            .unwrap();
        table
            .acquire(addr("192.168.25.2:1"), addr("203.0.113.7:20001"))
            .unwrap();

        let result = table.acquire(addr("192.168.25.3:1"), addr("203.0.113.7:20000"));
        assert!(matches!(
            result,
            Err(AllocationError::PortSpaceExhausted {
                start: 20000,
                end: 20001,
                ..
            })
        ));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_release_enters_cooldown_and_keeps_port() {
        let mut table = table(1024, 65535);
        let internal = addr("192.168.25.44:5000");
        let now = Instant::now();

        table.acquire(internal, addr("203.0.113.7:40000")).unwrap();
        assert_eq!(table.release(&internal, now).unwrap(), 0);

        let allocation = table.get(&internal).unwrap();
        assert!(matches!(
            allocation.state,
            AllocationState::CoolingDown { .. }
        ));
        assert!(!table.pool().is_free(40000));
        assert_eq!(table.snapshot().port_for(&internal), Some(40000));

        // Still reserved before the cool-down ends
        assert!(table.expire(now + Duration::from_secs(59)).is_empty());

        // A new flow during cool-down reactivates the same port
        let (port, how) = table.acquire(internal, addr("203.0.113.7:40123")).unwrap();
        assert_eq!(port, 40000);
        assert_eq!(how, Acquisition::Reactivated);
        assert!(table.expire(now + Duration::from_secs(120)).is_empty());
    }

    #[test]
    fn test_reacquire_follows_new_external_address() {
        let mut table = table(1024, 65535);
        let internal = addr("192.168.25.44:5000");
        let now = Instant::now();

        table.acquire(internal, addr("203.0.113.7:40000")).unwrap();
        table.release(&internal, now).unwrap();
        let generation = table.generation();

        // Reconnect during cool-down after the WAN address changed
        let (port, how) = table.acquire(internal, addr("198.51.100.9:41000")).unwrap();
        assert_eq!(port, 40000);
        assert_eq!(how, Acquisition::Reactivated);
        assert_eq!(
            table.get(&internal).unwrap().external,
            addr("198.51.100.9:40000")
        );
        assert_eq!(table.generation(), generation + 1);
        assert_eq!(
            table.snapshot().rules()[0].listen,
            addr("198.51.100.9:40000")
        );

        // A shared acquire on the new address leaves the rule set alone
        let generation = table.generation();
        let (_, how) = table.acquire(internal, addr("198.51.100.9:41001")).unwrap();
        assert_eq!(how, Acquisition::Shared);
        assert_eq!(table.generation(), generation);
    }

    #[test]
    fn test_expire_frees_port_and_bumps_generation() {
        let mut table = table(1024, 65535);
        let internal = addr("192.168.25.44:5000");
        let now = Instant::now();

        table.acquire(internal, addr("203.0.113.7:40000")).unwrap();
        table.release(&internal, now).unwrap();
        let generation = table.generation();

        let removed = table.expire(now + Duration::from_secs(60));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].port(), 40000);
        assert!(table.is_empty());
        assert!(table.pool().is_free(40000));
        assert_eq!(table.holder(40000), None);
        assert_eq!(table.generation(), generation + 1);
    }

    #[test]
    fn test_release_unknown_endpoint() {
        let mut table = table(1024, 65535);
        let result = table.release(&addr("192.168.25.44:5000"), Instant::now());
        assert!(matches!(result, Err(AllocationError::NotAllocated(_))));
    }

    #[test]
    fn test_hash_port_is_stable() {
        let pool = PortPool::new(1024, 65535);
        let internal = addr("192.168.25.44:5000");
        assert_eq!(pool.hash_to_port(&internal), pool.hash_to_port(&internal));
        assert!(pool.contains(pool.hash_to_port(&internal)));
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(PortPool::parse_range("10000-20000"), Ok((10000, 20000)));
        assert_eq!(PortPool::parse_range("5000-5000"), Ok((5000, 5000)));
        assert!(matches!(
            PortPool::parse_range("10000"),
            Err(PortRangeError::Format(_))
        ));
        assert!(matches!(
            PortPool::parse_range("abc-20000"),
            Err(PortRangeError::Port(_))
        ));
        assert_eq!(
            PortPool::parse_range("20000-10000"),
            Err(PortRangeError::Inverted)
        );
        assert_eq!(PortPool::parse_range("0-100"), Err(PortRangeError::ZeroPort));
    }

    #[test]
    fn test_no_port_collisions_across_many_endpoints() {
        let mut table = table(30000, 30063);

        for host in 0..64u16 {
            let internal = SocketAddr::new(
                std::net::IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 25, (host % 250) as u8)),
                5000 + host,
            );
            table.acquire(internal, addr("203.0.113.7:30000")).unwrap();
        }

        let snapshot = table.snapshot();
        let mut ports: Vec<u16> = snapshot.rules().iter().map(|r| r.listen.port()).collect();
        ports.dedup();
        assert_eq!(ports.len(), 64);
        assert_eq!(table.pool().free_count(), 0);
    }
}
