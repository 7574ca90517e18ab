use crate::identity::RouterId;
use rand::seq::SliceRandom;
use std::collections::HashSet;

/// Chooses routers for a path one hop at a time
pub trait HopSelection: Send {
    /// Pick hop `hop` (zero based) of a `num_hops` path
    ///
    /// `prev` is the router chosen for the previous hop. Returning `None`
    /// aborts the build.
    fn select_hop(
        &self,
        candidates: &[RouterId],
        prev: Option<&RouterId>,
        hop: usize,
        num_hops: usize,
    ) -> Option<RouterId>;
}

fn pick_random(
    candidates: &[RouterId],
    prev: Option<&RouterId>,
    excluded: &HashSet<RouterId>,
) -> Option<RouterId> {
    let available: Vec<_> = candidates
        .iter()
        .filter(|r| Some(*r) != prev && !excluded.contains(*r))
        .collect();
    available.choose(&mut rand::thread_rng()).map(|r| **r)
}

/// Uniformly random hops, used for the endpoint's own paths
#[derive(Debug, Clone, Default)]
pub struct RandomHops {
    excluded: HashSet<RouterId>,
}

impl RandomHops {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude(mut self, router: RouterId) -> Self {
        self.excluded.insert(router);
        self
    }
}

impl HopSelection for RandomHops {
    fn select_hop(
        &self,
        candidates: &[RouterId],
        prev: Option<&RouterId>,
        _hop: usize,
        _num_hops: usize,
    ) -> Option<RouterId> {
        pick_random(candidates, prev, &self.excluded)
    }
}

/// Random hops, except the last one which must be `terminal`
///
/// Used to reach a remote service: the path has to end at the relay named
/// by the chosen introduction.
#[derive(Debug, Clone)]
pub struct TerminalHop {
    terminal: RouterId,
    excluded: HashSet<RouterId>,
}

impl TerminalHop {
    pub fn new(terminal: RouterId) -> Self {
        let mut excluded = HashSet::new();
        excluded.insert(terminal);
        Self { terminal, excluded }
    }

    pub fn terminal(&self) -> &RouterId {
        &self.terminal
    }
}

impl HopSelection for TerminalHop {
    fn select_hop(
        &self,
        candidates: &[RouterId],
        prev: Option<&RouterId>,
        hop: usize,
        num_hops: usize,
    ) -> Option<RouterId> {
        if hop + 1 >= num_hops {
            return Some(self.terminal);
        }
        pick_random(candidates, prev, &self.excluded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routers(n: u8) -> Vec<RouterId> {
        (1..=n).map(|i| RouterId::from_bytes([i; 32])).collect()
    }

    #[test]
    fn test_terminal_hop_pins_last_hop() {
        let terminal = RouterId::from_bytes([99; 32]);
        let selector = TerminalHop::new(terminal);
        let candidates = routers(5);

        assert_eq!(selector.select_hop(&candidates, None, 2, 3), Some(terminal));
        // single hop path goes straight to the terminal
        assert_eq!(selector.select_hop(&candidates, None, 0, 1), Some(terminal));
    }

    #[test]
    fn test_terminal_hop_not_used_early() {
        let terminal = RouterId::from_bytes([1; 32]);
        let selector = TerminalHop::new(terminal);
        let candidates = routers(3);

        for _ in 0..20 {
            let hop = selector.select_hop(&candidates, None, 0, 3).unwrap();
            assert_ne!(hop, terminal);
        }
    }

    #[test]
    fn test_random_hops_avoid_previous() {
        let candidates = routers(2);
        let selector = RandomHops::new();
        for _ in 0..20 {
            let hop = selector
                .select_hop(&candidates, Some(&candidates[0]), 1, 3)
                .unwrap();
            assert_eq!(hop, candidates[1]);
        }
    }

    #[test]
    fn test_no_candidates() {
        let candidates = routers(1);
        let selector = RandomHops::new().exclude(candidates[0]);
        assert_eq!(selector.select_hop(&candidates, None, 0, 3), None);
    }
}
