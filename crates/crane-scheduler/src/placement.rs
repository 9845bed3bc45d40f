//! Lease placement decisions

use crane_core::{NodeId, ResourceClaim, ResourceVector};

/// A node eligible for placement, with its current free capacity
#[derive(Debug, Clone)]
pub struct CandidateNode {
    pub id: NodeId,
    pub available: ResourceVector,
    pub gpu_type: Option<String>,
}

/// Nodes chosen for a claim, ascending by id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDecision {
    pub nodes: Vec<NodeId>,
}

/// Strategy for choosing nodes for a claim
pub trait PlacementStrategy: Send + Sync {
    /// Pick `claim.nodes` distinct nodes from `candidates`, or `None` if the
    /// claim does not fit
    fn place(&self, claim: &ResourceClaim, candidates: &[CandidateNode]) -> Option<PlacementDecision>;
}

/// Best-fit: prefer the nodes left with the least free capacity.
///
/// Leftover is compared lexicographically on (gpu, cpu, memory); ties go to
/// the lowest node id.
pub struct BestFitPlacement;

impl PlacementStrategy for BestFitPlacement {
    fn place(&self, claim: &ResourceClaim, candidates: &[CandidateNode]) -> Option<PlacementDecision> {
        let wanted = claim.nodes as usize;
        if wanted == 0 {
            return None;
        }

        let mut fits: Vec<(_, &NodeId)> = candidates
            .iter()
            .filter(|c| claim.constraints.admits(&c.id))
            .filter(|c| match &claim.gpu_type {
                None => true,
                Some(t) => c.gpu_type.as_deref() == Some(t.as_str()),
            })
            .filter(|c| claim.resources.fits_within(&c.available))
            .map(|c| (c.available.saturating_sub(&claim.resources).fit_key(), &c.id))
            .collect();

        if fits.len() < wanted {
            return None;
        }

        fits.sort();
        let mut nodes: Vec<NodeId> = fits.into_iter().take(wanted).map(|(_, id)| id.clone()).collect();
        nodes.sort();
        Some(PlacementDecision { nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crane_core::PlacementConstraints;

    fn candidate(id: &str, gpus: u32) -> CandidateNode {
        CandidateNode {
            id: NodeId::from(id),
            available: ResourceVector::new(gpus, 16, 1 << 30),
            gpu_type: Some("a100".to_string()),
        }
    }

    fn claim(gpus: u32) -> ResourceClaim {
        ResourceClaim::new(ResourceVector::gpus(gpus))
    }

    #[test]
    fn test_best_fit_picks_tightest_node() {
        let candidates = vec![candidate("n1", 8), candidate("n2", 2), candidate("n3", 4)];
        let decision = BestFitPlacement.place(&claim(2), &candidates).unwrap();
        assert_eq!(decision.nodes, vec![NodeId::from("n2")]);
    }

    #[test]
    fn test_ties_break_on_lowest_id() {
        let candidates = vec![candidate("n3", 4), candidate("n1", 4), candidate("n2", 4)];
        let decision = BestFitPlacement.place(&claim(1), &candidates).unwrap();
        assert_eq!(decision.nodes, vec![NodeId::from("n1")]);
    }

    #[test]
    fn test_multi_node_claim() {
        let candidates = vec![candidate("n1", 8), candidate("n2", 2), candidate("n3", 4)];
        let decision = BestFitPlacement
            .place(&claim(2).spanning(2), &candidates)
            .unwrap();
        assert_eq!(decision.nodes, vec![NodeId::from("n2"), NodeId::from("n3")]);

        assert!(BestFitPlacement
            .place(&claim(4).spanning(3), &candidates)
            .is_none());
    }

    #[test]
    fn test_insufficient_capacity() {
        let candidates = vec![candidate("n1", 1)];
        assert!(BestFitPlacement.place(&claim(2), &candidates).is_none());
        assert!(BestFitPlacement.place(&claim(1), &[]).is_none());
    }

    #[test]
    fn test_gpu_type_and_constraints_filter() {
        let mut other = candidate("n0", 8);
        other.gpu_type = Some("h100".to_string());
        let candidates = vec![other, candidate("n1", 8), candidate("n2", 8)];

        let typed = claim(1).with_gpu_type("h100");
        assert_eq!(
            BestFitPlacement.place(&typed, &candidates).unwrap().nodes,
            vec![NodeId::from("n0")]
        );

        let constrained = claim(1).with_constraints(PlacementConstraints {
            excluded_nodes: vec![NodeId::from("n0"), NodeId::from("n1")],
            ..Default::default()
        });
        assert_eq!(
            BestFitPlacement.place(&constrained, &candidates).unwrap().nodes,
            vec![NodeId::from("n2")]
        );
    }
}
