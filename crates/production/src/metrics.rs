//! Prometheus metrics for the router.

use beacon_core::NodeEvent;
use prometheus::{IntCounter, IntGauge, Registry};

/// Consensus and DKG metrics, updated from published node events.
#[derive(Clone)]
pub struct Metrics {
    /// Height of the latest committed block.
    pub height: IntGauge,
    /// Round of the height in progress.
    pub round: IntGauge,
    /// Total committed blocks since start.
    pub committed_blocks: IntCounter,
    /// Polkas observed.
    pub polkas: IntCounter,
    /// DKG rounds certified.
    pub dkg_rounds_certified: IntCounter,
    /// DKG rounds aborted.
    pub dkg_rounds_aborted: IntCounter,
}

impl Metrics {
    /// Create and register the metric family.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let height = IntGauge::new("beacon_consensus_height", "Latest committed block height")?;
        let round = IntGauge::new("beacon_consensus_round", "Current consensus round")?;
        let committed_blocks = IntCounter::new(
            "beacon_consensus_committed_blocks_total",
            "Committed blocks since start",
        )?;
        let polkas = IntCounter::new("beacon_consensus_polkas_total", "Observed polkas")?;
        let dkg_rounds_certified = IntCounter::new(
            "beacon_dkg_rounds_certified_total",
            "DKG rounds that produced a verifier",
        )?;
        let dkg_rounds_aborted =
            IntCounter::new("beacon_dkg_rounds_aborted_total", "Aborted DKG rounds")?;

        registry.register(Box::new(height.clone()))?;
        registry.register(Box::new(round.clone()))?;
        registry.register(Box::new(committed_blocks.clone()))?;
        registry.register(Box::new(polkas.clone()))?;
        registry.register(Box::new(dkg_rounds_certified.clone()))?;
        registry.register(Box::new(dkg_rounds_aborted.clone()))?;

        Ok(Metrics {
            height,
            round,
            committed_blocks,
            polkas,
            dkg_rounds_certified,
            dkg_rounds_aborted,
        })
    }

    /// Unregistered metrics for tests.
    pub fn noop() -> Self {
        Metrics::new(&Registry::new()).expect("fresh registry accepts all metrics")
    }

    /// Update from a published node event.
    pub fn observe(&self, event: &NodeEvent) {
        match event {
            NodeEvent::NewBlock { height, .. } => {
                self.height.set(*height as i64);
                self.committed_blocks.inc();
            }
            NodeEvent::NewRound { round, .. } => self.round.set(*round as i64),
            NodeEvent::Polka { .. } => self.polkas.inc(),
            NodeEvent::DkgInstanceCertified { .. } => self.dkg_rounds_certified.inc(),
            NodeEvent::DkgRoundAborted { .. } => self.dkg_rounds_aborted.inc(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_types::Hash;

    #[test]
    fn observes_commits() {
        let metrics = Metrics::noop();
        metrics.observe(&NodeEvent::NewBlock {
            height: 7,
            block_hash: Hash::ZERO,
            random_hash: Hash::ZERO,
        });
        assert_eq!(metrics.height.get(), 7);
        assert_eq!(metrics.committed_blocks.get(), 1);
    }
}
