//! Pool selection.

use rand::seq::SliceRandom;
use rand::Rng;

/// Anything the balancer can choose between.
pub trait Balanced {
    fn is_healthy(&self) -> bool;

    /// Idle headroom; larger means less loaded.
    fn size(&self) -> usize;
}

/// Pick the healthy candidate with the most idle headroom.
///
/// Equal headroom goes to the later candidate. When every healthy candidate is
/// saturated, one is picked uniformly at random so no pool is favored once
/// capacity frees up. `None` means no candidate is healthy.
pub fn select<T: Balanced>(candidates: &[T]) -> Option<&T> {
    select_with(candidates, &mut rand::thread_rng())
}

/// [`select`] with an explicit random source.
pub fn select_with<'a, T: Balanced, R: Rng + ?Sized>(
    candidates: &'a [T],
    rng: &mut R,
) -> Option<&'a T> {
    if let [only] = candidates {
        return only.is_healthy().then_some(only);
    }

    let mut best: Option<(&T, usize)> = None;
    let mut healthy = 0;
    for candidate in candidates.iter().filter(|c| c.is_healthy()) {
        healthy += 1;
        let size = candidate.size();
        match best {
            Some((_, top)) if size < top => {}
            _ => best = Some((candidate, size)),
        }
    }

    match best {
        Some((_, 0)) if healthy > 1 => {
            let saturated: Vec<&T> = candidates.iter().filter(|c| c.is_healthy()).collect();
            saturated.choose(rng).copied()
        }
        Some((candidate, _)) => Some(candidate),
        None => None,
    }
}

/// Pick the candidate with the most idle headroom regardless of health.
///
/// Used when reserving tenant capacity; `None` when the candidates have no idle
/// headroom at all.
pub fn select_most_idle<T: Balanced>(candidates: &[T]) -> Option<&T> {
    let mut best: Option<(&T, usize)> = None;
    for candidate in candidates {
        let size = candidate.size();
        match best {
            Some((_, top)) if size < top => {}
            _ => best = Some((candidate, size)),
        }
    }
    best.filter(|(_, size)| *size > 0).map(|(candidate, _)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[derive(Debug, PartialEq)]
    struct Candidate {
        name: &'static str,
        idle: usize,
        healthy: bool,
    }

    impl Balanced for Candidate {
        fn is_healthy(&self) -> bool {
            self.healthy
        }

        fn size(&self) -> usize {
            self.idle
        }
    }

    fn up(name: &'static str, idle: usize) -> Candidate {
        Candidate { name, idle, healthy: true }
    }

    fn down(name: &'static str, idle: usize) -> Candidate {
        Candidate { name, idle, healthy: false }
    }

    #[test]
    fn test_most_headroom_wins_every_time() {
        let pools = [up("a", 3), up("b", 5)];
        for _ in 0..100 {
            assert_eq!(select(&pools).unwrap().name, "b");
        }
    }

    #[test]
    fn test_ties_go_to_last_candidate() {
        let pools = [up("a", 4), up("b", 4), up("c", 1)];
        assert_eq!(select(&pools).unwrap().name, "b");
    }

    #[test]
    fn test_unhealthy_pools_are_excluded() {
        let pools = [up("a", 1), down("b", 9)];
        assert_eq!(select(&pools).unwrap().name, "a");

        let all_down = [down("a", 1), down("b", 2)];
        assert!(select(&all_down).is_none());
        assert!(select::<Candidate>(&[]).is_none());
    }

    #[test]
    fn test_single_candidate_respects_health() {
        assert_eq!(select(&[up("a", 0)]).unwrap().name, "a");
        assert!(select(&[down("a", 3)]).is_none());
    }

    #[test]
    fn test_saturated_pools_split_evenly() {
        let pools = [up("a", 0), up("b", 0), down("c", 0)];
        let mut rng = StdRng::seed_from_u64(7);
        let trials = 10_000;
        let picked_a = (0..trials)
            .filter(|_| select_with(&pools, &mut rng).unwrap().name == "a")
            .count();

        let share = picked_a as f64 / trials as f64;
        assert!((0.45..0.55).contains(&share), "share of a was {share}");
    }

    #[test]
    fn test_most_idle_ignores_health_and_rejects_empty_capacity() {
        let pools = [up("a", 1), down("b", 2)];
        assert_eq!(select_most_idle(&pools).unwrap().name, "b");

        let drained = [up("a", 0), up("b", 0)];
        assert!(select_most_idle(&drained).is_none());
    }
}
