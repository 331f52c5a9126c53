use parking_lot::{Condvar, Mutex};
use serde::{Serialize,Deserialize};
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

/// Capacity settings for a [`ConnectionScheduler`](crate::ConnectionScheduler).
///
/// A limit of zero means unlimited.
#[derive(Clone,Copy,Debug,Default,PartialEq,Eq,Serialize,Deserialize)]
#[serde(default)]
pub struct AdmissionLimits
{
    /// Maximum number of admitted sessions across all peers
    pub max_connections: usize,
    /// Maximum number of admitted sessions from a single peer address
    pub max_connections_per_peer: usize,
}

#[derive(Debug,Default)]
struct AdmissionCounts
{
    total: usize,
    per_peer: HashMap<IpAddr, usize>,
}

/// Tracks admitted sessions against an [`AdmissionLimits`].
///
/// The counts are only ever changed by [`try_acquire`](Self::try_acquire) and by
/// dropping the resulting [`AdmissionPermit`], both under the same lock, so the
/// limits hold however many threads submit at once.
#[derive(Debug)]
pub struct AdmissionControl
{
    limits: AdmissionLimits,
    counts: Mutex<AdmissionCounts>,
    idle: Condvar,
}

/// Proof of admission for one session. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit
{
    control: Arc<AdmissionControl>,
    peer: IpAddr,
}

impl AdmissionLimits
{
    fn allows(limit: usize, current: usize) -> bool
    {
        limit == 0 || current < limit
    }
}

impl AdmissionControl
{
    pub fn new(limits: AdmissionLimits) -> Arc<Self>
    {
        Arc::new(Self {
            limits,
            counts: Mutex::new(AdmissionCounts::default()),
            idle: Condvar::new(),
        })
    }

    pub fn limits(&self) -> AdmissionLimits
    {
        self.limits
    }

    /// Number of sessions currently holding a permit
    pub fn admitted(&self) -> usize
    {
        self.counts.lock().total
    }

    /// Number of sessions currently holding a permit for the given peer
    pub fn admitted_from(&self, peer: IpAddr) -> usize
    {
        self.counts.lock().per_peer.get(&peer).copied().unwrap_or(0)
    }

    /// Block until every permit has been released, or `timeout` passes.
    /// Returns whether the count reached zero.
    pub fn wait_idle(&self, timeout: Duration) -> bool
    {
        let deadline = Instant::now() + timeout;
        let mut counts = self.counts.lock();

        while counts.total > 0
        {
            if self.idle.wait_until(&mut counts, deadline).timed_out()
            {
                return counts.total == 0;
            }
        }
        true
    }

    /// Take a slot for a session from `peer`, if both limits allow it.
    pub fn try_acquire(self: &Arc<Self>, peer: IpAddr) -> Option<AdmissionPermit>
    {
        let mut counts = self.counts.lock();

        let from_peer = counts.per_peer.get(&peer).copied().unwrap_or(0);
        if !AdmissionLimits::allows(self.limits.max_connections, counts.total)
            || !AdmissionLimits::allows(self.limits.max_connections_per_peer, from_peer)
        {
            return None;
        }

        counts.total += 1;
        *counts.per_peer.entry(peer).or_insert(0) += 1;

        Some(AdmissionPermit {
            control: Arc::clone(self),
            peer,
        })
    }

    fn release(&self, peer: IpAddr)
    {
        let mut counts = self.counts.lock();

        counts.total = counts.total.saturating_sub(1);
        if let Some(count) = counts.per_peer.get_mut(&peer)
        {
            *count -= 1;
            if *count == 0
            {
                counts.per_peer.remove(&peer);
            }
        }

        if counts.total == 0
        {
            self.idle.notify_all();
        }
    }
}

impl AdmissionPermit
{
    pub fn peer(&self) -> IpAddr
    {
        self.peer
    }
}

impl Drop for AdmissionPermit
{
    fn drop(&mut self)
    {
        self.control.release(self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Barrier;

    const PEER_A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const PEER_B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[test]
    fn unlimited_by_default() {
        let control = AdmissionControl::new(AdmissionLimits::default());

        let permits: Vec<_> = (0..100).map(|_| control.try_acquire(PEER_A).unwrap()).collect();
        assert_eq!(control.admitted(), 100);

        drop(permits);
        assert_eq!(control.admitted(), 0);
    }

    #[test]
    fn global_limit() {
        let control = AdmissionControl::new(AdmissionLimits {
            max_connections: 2,
            max_connections_per_peer: 0,
        });

        let first = control.try_acquire(PEER_A).unwrap();
        let _second = control.try_acquire(PEER_B).unwrap();
        assert!(control.try_acquire(PEER_A).is_none());

        drop(first);
        assert!(control.try_acquire(PEER_B).is_some());
    }

    #[test]
    fn per_peer_limit() {
        let control = AdmissionControl::new(AdmissionLimits {
            max_connections: 0,
            max_connections_per_peer: 1,
        });

        let first = control.try_acquire(PEER_A).unwrap();
        assert!(control.try_acquire(PEER_A).is_none());
        let _other = control.try_acquire(PEER_B).unwrap();

        assert_eq!(control.admitted_from(PEER_A), 1);
        drop(first);
        assert_eq!(control.admitted_from(PEER_A), 0);
        assert_eq!(control.admitted(), 1);
    }

    #[test]
    fn concurrent_burst_respects_limit() {
        const LIMIT: usize = 5;
        const THREADS: usize = 32;

        let control = AdmissionControl::new(AdmissionLimits {
            max_connections: LIMIT,
            max_connections_per_peer: 0,
        });
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let control = Arc::clone(&control);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    control.try_acquire(PEER_A)
                })
            })
            .collect();

        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(permits.len(), LIMIT);
        assert_eq!(control.admitted(), LIMIT);
    }

    #[test]
    fn wait_idle_sees_last_release() {
        let control = AdmissionControl::new(AdmissionLimits::default());
        assert!(control.wait_idle(Duration::ZERO));

        let permit = control.try_acquire(PEER_A).unwrap();
        assert!(!control.wait_idle(Duration::from_millis(20)));

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(permit);
        });

        assert!(control.wait_idle(Duration::from_secs(10)));
        assert_eq!(control.admitted(), 0);
        releaser.join().unwrap();
    }
}
