//! Synchronization of the peer address set with the mesh topology.
//!
//! The address set holds the private IPs of every node in the local
//! location, so encapsulation-exemption rules can match intra-location
//! traffic. Its contents are always replaced wholesale.

use std::collections::HashSet;
use std::net::IpAddr;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::error::{CompatError, Result};
use crate::types::{Encapsulation, Topology};

/// A named, externally maintained set of IP addresses.
pub trait AddressSet {
    /// Name of the set.
    fn name(&self) -> &str;

    /// Starts supervising the set until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if supervision cannot start. Later failures are sent
    /// on the returned channel.
    fn run(&self, cancel: &CancellationToken) -> Result<mpsc::Receiver<CompatError>>;

    /// Removes the set. Succeeds if the set does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the set exists but cannot be removed.
    fn clean_up(&self) -> Result<()>;

    /// Replaces the set's contents with `addrs`.
    ///
    /// # Errors
    ///
    /// Returns an error if the contents cannot be replaced.
    fn set(&self, addrs: &[IpAddr]) -> Result<()>;
}

/// Returns the private IPs of the segment at `location`.
///
/// Duplicates are dropped, first occurrence wins. An unknown location yields
/// an empty list.
#[must_use]
pub fn peer_ips(topology: &Topology, location: &str) -> Vec<IpAddr> {
    let Some(segment) = topology.segment(location) else {
        return Vec::new();
    };
    let mut seen = HashSet::with_capacity(segment.private_ips.len());
    segment
        .private_ips
        .iter()
        .copied()
        .filter(|ip| seen.insert(*ip))
        .collect()
}

/// Keeps an [`AddressSet`] equal to the local segment's private IPs.
///
/// Callers serialize `apply`; the set is assumed to have a single writer.
#[derive(Debug)]
pub struct PeerSetSync<S> {
    set: S,
    applied: Mutex<Option<Vec<IpAddr>>>,
}

impl<S: AddressSet> PeerSetSync<S> {
    /// Creates a synchronizer over `set`.
    #[must_use]
    pub fn new(set: S) -> Self {
        Self {
            set,
            applied: Mutex::new(None),
        }
    }

    /// Returns the underlying address set.
    #[must_use]
    pub fn address_set(&self) -> &S {
        &self.set
    }

    /// Reconciles the address set with `topology`.
    ///
    /// Does nothing when traffic is never encapsulated. Otherwise the set is
    /// replaced with the IPs of the segment at `location`, or emptied when
    /// no segment matches. Contents equal to the last successful apply are
    /// not pushed again.
    ///
    /// # Errors
    ///
    /// Returns the address set's error if the replace fails.
    pub fn apply(&self, topology: &Topology, mode: Encapsulation, location: &str) -> Result<()> {
        if mode == Encapsulation::Never {
            trace!(set = %self.set.name(), "encapsulation disabled, skipping peer set");
            return Ok(());
        }

        let ips = peer_ips(topology, location);
        let mut applied = self.applied.lock();
        if applied.as_deref() == Some(ips.as_slice()) {
            trace!(set = %self.set.name(), "peer set unchanged");
            return Ok(());
        }

        if topology.segment(location).is_none() {
            debug!(location = %location, "no segment for local location, emptying peer set");
        }

        if let Err(e) = self.set.set(&ips) {
            error!(set = %self.set.name(), error = %e, "failed to update peer set");
            return Err(e);
        }

        info!(
            set = %self.set.name(),
            location = %location,
            peers = ips.len(),
            "updated peer set"
        );
        *applied = Some(ips);
        Ok(())
    }

    /// Starts the address set's supervisor.
    ///
    /// # Errors
    ///
    /// Returns the address set's error if it cannot start.
    pub fn run(&self, cancel: &CancellationToken) -> Result<mpsc::Receiver<CompatError>> {
        let errors = self.set.run(cancel)?;
        self.applied.lock().take();
        Ok(errors)
    }

    /// Removes the address set. Safe to call without a prior [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// Returns the address set's error if removal fails.
    pub fn clean_up(&self) -> Result<()> {
        self.set.clean_up()?;
        self.applied.lock().take();
        debug!(set = %self.set.name(), "peer set cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeAddressSet;
    use crate::types::Segment;
    use proptest::prelude::*;
    use test_case::test_case;

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("valid IP")
    }

    fn scenario() -> Topology {
        Topology::new(vec![
            Segment::new("a", vec![ip("10.0.0.1"), ip("10.0.0.2")]),
            Segment::new("b", vec![ip("10.1.0.1")]),
        ])
    }

    // ==================== APPLY TESTS ====================

    #[test_case("b", &["10.1.0.1"] ; "second segment")]
    #[test_case("a", &["10.0.0.1", "10.0.0.2"] ; "first segment")]
    #[test_case("c", &[] ; "no matching segment")]
    fn test_apply_scenario(location: &str, expected: &[&str]) {
        let sync = PeerSetSync::new(FakeAddressSet::new("peers"));

        sync.apply(&scenario(), Encapsulation::Always, location)
            .expect("apply");

        let expected: Vec<IpAddr> = expected.iter().map(|s| ip(s)).collect();
        assert_eq!(sync.address_set().contents(), Some(expected));
    }

    #[test]
    fn test_apply_no_match_pushes_explicit_empty_set() {
        let sync = PeerSetSync::new(FakeAddressSet::new("peers"));
        sync.apply(&scenario(), Encapsulation::Always, "a").expect("apply");

        sync.apply(&scenario(), Encapsulation::Always, "c").expect("apply");

        assert_eq!(sync.address_set().contents(), Some(vec![]));
        assert_eq!(sync.address_set().set_count(), 2);
    }

    #[test]
    fn test_apply_never_is_noop() {
        let sync = PeerSetSync::new(FakeAddressSet::new("peers"));
        sync.apply(&scenario(), Encapsulation::Never, "a").expect("apply");
        assert_eq!(sync.address_set().contents(), None);
        assert_eq!(sync.address_set().set_count(), 0);
    }

    #[test]
    fn test_apply_cross_subnet_updates_set() {
        let sync = PeerSetSync::new(FakeAddressSet::new("peers"));
        sync.apply(&scenario(), Encapsulation::CrossSubnet, "b")
            .expect("apply");
        assert_eq!(sync.address_set().contents(), Some(vec![ip("10.1.0.1")]));
    }

    #[test]
    fn test_apply_deduplicates() {
        let topology = Topology::new(vec![Segment::new(
            "a",
            vec![ip("10.0.0.2"), ip("10.0.0.1"), ip("10.0.0.2")],
        )]);
        let sync = PeerSetSync::new(FakeAddressSet::new("peers"));
        sync.apply(&topology, Encapsulation::Always, "a").expect("apply");
        assert_eq!(
            sync.address_set().contents(),
            Some(vec![ip("10.0.0.2"), ip("10.0.0.1")])
        );
    }

    #[test]
    fn test_apply_failure_is_returned_and_retried() {
        let sync = PeerSetSync::new(FakeAddressSet::new("peers"));
        sync.address_set()
            .fail_next_set(CompatError::address_set("set", "operation not permitted"));

        let result = sync.apply(&scenario(), Encapsulation::Always, "a");
        assert!(matches!(result, Err(CompatError::AddressSet { .. })));
        assert_eq!(sync.address_set().contents(), None);

        sync.apply(&scenario(), Encapsulation::Always, "a").expect("retry");
        assert_eq!(
            sync.address_set().contents(),
            Some(vec![ip("10.0.0.1"), ip("10.0.0.2")])
        );
    }

    // ==================== LIFECYCLE TESTS ====================

    #[test]
    fn test_clean_up_without_run() {
        let sync = PeerSetSync::new(FakeAddressSet::new("peers"));
        assert!(sync.clean_up().is_ok());
        assert!(sync.clean_up().is_ok());
    }

    #[test]
    fn test_clean_up_forgets_applied_contents() {
        let sync = PeerSetSync::new(FakeAddressSet::new("peers"));
        sync.apply(&scenario(), Encapsulation::Always, "b").expect("apply");
        sync.clean_up().expect("clean up");
        assert_eq!(sync.address_set().contents(), None);

        sync.apply(&scenario(), Encapsulation::Always, "b").expect("apply");
        assert_eq!(sync.address_set().contents(), Some(vec![ip("10.1.0.1")]));
    }

    #[tokio::test]
    async fn test_run_surfaces_supervisor_errors() {
        let sync = PeerSetSync::new(FakeAddressSet::new("peers"));
        let cancel = CancellationToken::new();
        let mut errors = sync.run(&cancel).expect("run");

        sync.address_set()
            .report(CompatError::address_set("restore", "set vanished"))
            .await;

        assert_eq!(
            errors.recv().await,
            Some(CompatError::address_set("restore", "set vanished"))
        );
        cancel.cancel();
        assert_eq!(errors.recv().await, None);
    }

    // ==================== PROPERTIES ====================

    fn arb_topology() -> impl Strategy<Value = Topology> {
        let segment = (
            prop::sample::select(vec!["a", "b", "c"]),
            prop::collection::vec(any::<[u8; 4]>(), 0..6),
        )
            .prop_map(|(location, octets)| {
                Segment::new(location, octets.into_iter().map(IpAddr::from).collect())
            });
        prop::collection::vec(segment, 0..4).prop_map(Topology::new)
    }

    proptest! {
        #[test]
        fn prop_never_encapsulate_never_mutates(topology in arb_topology(), location in "[a-d]") {
            let sync = PeerSetSync::new(FakeAddressSet::new("peers"));
            sync.apply(&topology, Encapsulation::Never, &location).expect("apply");
            prop_assert_eq!(sync.address_set().set_count(), 0);
            prop_assert_eq!(sync.address_set().contents(), None);
        }

        #[test]
        fn prop_apply_is_idempotent(topology in arb_topology(), location in "[a-d]") {
            let sync = PeerSetSync::new(FakeAddressSet::new("peers"));
            sync.apply(&topology, Encapsulation::Always, &location).expect("first");
            let contents = sync.address_set().contents();
            let count = sync.address_set().set_count();

            sync.apply(&topology, Encapsulation::Always, &location).expect("second");
            prop_assert_eq!(sync.address_set().contents(), contents);
            prop_assert_eq!(sync.address_set().set_count(), count);
        }

        #[test]
        fn prop_contents_match_local_segment(topology in arb_topology(), location in "[a-d]") {
            let sync = PeerSetSync::new(FakeAddressSet::new("peers"));
            sync.apply(&topology, Encapsulation::Always, &location).expect("apply");

            let contents = sync.address_set().contents().expect("set pushed");
            let expected: HashSet<IpAddr> = topology
                .segment(&location)
                .map(|s| s.private_ips.iter().copied().collect())
                .unwrap_or_default();
            prop_assert_eq!(contents.iter().copied().collect::<HashSet<_>>(), expected);
            prop_assert_eq!(contents.len(), contents.iter().collect::<HashSet<_>>().len());
        }
    }
}
