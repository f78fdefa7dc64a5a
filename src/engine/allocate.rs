use ulid::Ulid;

// ── Best-fit allocation ───────────────────────────────────────────

/// Order candidates for a party: capacity-sufficient only, smallest capacity
/// first (least wasted seats), ties broken by lowest id for determinism.
pub fn rank_candidates(mut candidates: Vec<(u32, Ulid)>, party_size: u32) -> Vec<Ulid> {
    candidates.retain(|(capacity, _)| *capacity >= party_size);
    candidates.sort();
    candidates.into_iter().map(|(_, id)| id).collect()
}

/// The single best-fit choice, or None when nothing can seat the party.
pub fn best_fit(candidates: Vec<(u32, Ulid)>, party_size: u32) -> Option<Ulid> {
    rank_candidates(candidates, party_size).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> Ulid {
        Ulid::from_parts(0, n as u128)
    }

    #[test]
    fn smallest_sufficient_capacity_wins() {
        let candidates = vec![(8, id(1)), (2, id(2)), (4, id(3))];
        assert_eq!(best_fit(candidates, 3), Some(id(3)));
    }

    #[test]
    fn exact_fit_preferred() {
        let candidates = vec![(6, id(1)), (4, id(2))];
        assert_eq!(best_fit(candidates, 4), Some(id(2)));
    }

    #[test]
    fn capacity_tie_broken_by_lowest_id() {
        let candidates = vec![(4, id(9)), (4, id(3)), (4, id(7))];
        assert_eq!(best_fit(candidates, 2), Some(id(3)));
    }

    #[test]
    fn undersized_candidates_filtered() {
        let candidates = vec![(2, id(1)), (4, id(2))];
        assert_eq!(rank_candidates(candidates, 3), vec![id(2)]);
    }

    #[test]
    fn nothing_fits() {
        let candidates = vec![(2, id(1)), (4, id(2))];
        assert_eq!(best_fit(candidates, 6), None);
        assert_eq!(best_fit(Vec::new(), 1), None);
    }

    #[test]
    fn rank_orders_fallback_candidates() {
        let candidates = vec![(8, id(1)), (2, id(2)), (4, id(3)), (4, id(4))];
        assert_eq!(
            rank_candidates(candidates, 3),
            vec![id(3), id(4), id(1)]
        );
    }
}
