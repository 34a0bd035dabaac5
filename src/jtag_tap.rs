//! The 16-state IEEE 1149.1 TAP controller graph and shortest-path TMS
//! sequencing, ported from `JtagStateMachine` in
//! `original_source/python/tinyfpgaa.py`.

use std::collections::HashMap;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[allow(clippy::upper_case_acronyms)]
pub enum TapState {
    Reset,
    Idle,
    DrSelect,
    DrCapture,
    DrShift,
    DrExit1,
    DrPause,
    DrExit2,
    DrUpdate,
    IrSelect,
    IrCapture,
    IrShift,
    IrExit1,
    IrPause,
    IrExit2,
    IrUpdate,
}

use TapState::*;

const ALL_STATES: [TapState; 16] = [
    Reset, Idle, DrSelect, DrCapture, DrShift, DrExit1, DrPause, DrExit2, DrUpdate, IrSelect,
    IrCapture, IrShift, IrExit1, IrPause, IrExit2, IrUpdate,
];

/// `(tms=0 successor, tms=1 successor)` for each state, reproducing the
/// adjacency table verbatim from the original `JtagStateMachine.states`.
const fn transitions(state: TapState) -> (TapState, TapState) {
    match state {
        Reset => (Idle, Reset),
        Idle => (Idle, DrSelect),
        DrSelect => (DrCapture, IrSelect),
        DrCapture => (DrShift, DrExit1),
        DrShift => (DrShift, DrExit1),
        DrExit1 => (DrPause, DrUpdate),
        DrPause => (DrPause, DrExit2),
        DrExit2 => (DrShift, DrUpdate),
        DrUpdate => (Idle, DrSelect),
        IrSelect => (IrCapture, Reset),
        IrCapture => (IrShift, IrExit1),
        IrShift => (IrShift, IrExit1),
        IrExit1 => (IrPause, IrUpdate),
        IrPause => (IrPause, IrExit2),
        IrExit2 => (IrShift, IrUpdate),
        IrUpdate => (Idle, DrSelect),
    }
}

impl TapState {
    fn step(self, tms: bool) -> TapState {
        let (t0, t1) = transitions(self);
        if tms {
            t1
        } else {
            t0
        }
    }
}

/// Shortest-path TMS sequencer with per-instance memoization, keyed on
/// `(source, target)` as spec.md §3 requires.
#[derive(Default)]
pub struct TapNavigator {
    memo: HashMap<(TapState, TapState), Vec<bool>>,
}

impl TapNavigator {
    pub fn new() -> Self {
        TapNavigator { memo: HashMap::new() }
    }

    /// Single-source shortest path over the unit-weight 16-node graph
    /// (Dijkstra, following `JtagStateMachine.shortest_path` directly;
    /// a compile-time 16x16 TMS table would also satisfy spec.md §9's
    /// design note, but a runtime search keeps the memoization table's
    /// own invariant — that repeated lookups are structurally identical,
    /// per spec.md §8 — a meaningfully testable property of this type
    /// rather than of a baked-in constant).
    fn shortest_path(source: TapState, target: TapState) -> Vec<TapState> {
        const INFINITY: u32 = 1000;

        let mut dist: HashMap<TapState, u32> = ALL_STATES.iter().map(|&s| (s, INFINITY)).collect();
        let mut prev: HashMap<TapState, Option<TapState>> = ALL_STATES.iter().map(|&s| (s, None)).collect();
        let mut unvisited: Vec<TapState> = ALL_STATES.to_vec();
        dist.insert(source, 0);

        while !unvisited.is_empty() {
            let (idx, &u) = unvisited
                .iter()
                .enumerate()
                .min_by_key(|(_, &s)| dist[&s])
                .expect("unvisited is non-empty");
            unvisited.remove(idx);

            let (t0, t1) = transitions(u);
            for v in [t0, t1] {
                let alt = dist[&u] + 1;
                if alt < dist[&v] {
                    dist.insert(v, alt);
                    prev.insert(v, Some(u));
                }
            }
        }

        let mut path = Vec::new();
        let mut u = target;
        while let Some(p) = prev[&u] {
            path.push(u);
            u = p;
        }
        path.push(u);
        path.reverse();
        path
    }

    fn tms_between(a: TapState, b: TapState) -> bool {
        let (t0, t1) = transitions(a);
        if t0 == b {
            false
        } else if t1 == b {
            true
        } else {
            unreachable!("shortest_path only ever emits adjacent state pairs")
        }
    }

    /// The minimum-length TMS sequence that drives `source` to `target`.
    /// Empty when `source == target`. Memoized per spec.md §8.
    pub fn get_tms_sequence(&mut self, source: TapState, target: TapState) -> Vec<bool> {
        if let Some(seq) = self.memo.get(&(source, target)) {
            return seq.clone();
        }

        let path = Self::shortest_path(source, target);
        let seq: Vec<bool> = path.windows(2).map(|w| Self::tms_between(w[0], w[1])).collect();

        self.memo.insert((source, target), seq.clone());
        seq
    }
}

/// Tracks the TAP's current state across a session and forces a reset
/// entry sequence whenever that state is unknown.
pub struct TapTracker {
    current: Option<TapState>,
    nav: TapNavigator,
}

impl Default for TapTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TapTracker {
    /// Number of TMS=1 pulses used to force RESET from an unknown state.
    /// spec.md §4.6 requires at least 5; this implementation uses 25,
    /// safe for any realistic scan chain length.
    pub const RESET_PULSES: usize = 25;

    pub fn new() -> Self {
        TapTracker { current: None, nav: TapNavigator::new() }
    }

    pub fn current(&self) -> Option<TapState> {
        self.current
    }

    /// Compute the TMS sequence to reach `target`, prepending a forced
    /// reset if the current state is unknown, and update the tracked
    /// state to `target`.
    pub fn route_to(&mut self, target: TapState) -> Vec<bool> {
        let mut sequence = Vec::new();
        let from = match self.current {
            Some(state) => state,
            None => {
                sequence.extend(std::iter::repeat(true).take(Self::RESET_PULSES));
                Reset
            }
        };
        sequence.extend(self.nav.get_tms_sequence(from, target));
        self.current = Some(target);
        sequence
    }

    /// Record a state transition that happened implicitly, outside of
    /// `route_to` (e.g. the exit-1 transition triggered by a shift's
    /// last-phase overlay, spec.md §4.7).
    pub fn set_current(&mut self, state: TapState) {
        self.current = Some(state);
    }

    /// Apply a single TMS bit to the tracked state, if known.
    pub fn step(&mut self, tms: bool) {
        if let Some(state) = self.current {
            self.current = Some(state.step(tms));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_to_irshift_is_1100() {
        let mut nav = TapNavigator::new();
        let seq = nav.get_tms_sequence(Idle, IrShift);
        assert_eq!(seq, vec![true, true, false, false]);
    }

    #[test]
    fn reset_to_idle_is_0() {
        let mut nav = TapNavigator::new();
        assert_eq!(nav.get_tms_sequence(Reset, Idle), vec![false]);
    }

    #[test]
    fn same_state_sequence_is_empty() {
        let mut nav = TapNavigator::new();
        for &s in ALL_STATES.iter() {
            assert!(nav.get_tms_sequence(s, s).is_empty());
        }
    }

    #[test]
    fn memoized_sequences_are_structurally_identical() {
        let mut nav = TapNavigator::new();
        let first = nav.get_tms_sequence(Idle, IrPause);
        let second = nav.get_tms_sequence(Idle, IrPause);
        assert_eq!(first, second);
    }

    #[test]
    fn every_sequence_lands_exactly_on_target() {
        let mut nav = TapNavigator::new();
        for &source in ALL_STATES.iter() {
            for &target in ALL_STATES.iter() {
                let seq = nav.get_tms_sequence(source, target);
                let mut state = source;
                for tms in &seq {
                    state = state.step(*tms);
                }
                assert_eq!(state, target, "{:?} -> {:?} via {:?}", source, target, seq);
            }
        }
    }

    #[test]
    fn sequence_length_is_shortest() {
        // IDLE -> IRSHIFT takes 4 hops; no shorter TMS sequence exists.
        let mut nav = TapNavigator::new();
        assert_eq!(nav.get_tms_sequence(Idle, IrShift).len(), 4);
    }

    #[test]
    fn unknown_state_forces_reset_first() {
        let mut tracker = TapTracker::new();
        let seq = tracker.route_to(Idle);
        assert!(seq.len() >= TapTracker::RESET_PULSES);
        assert!(seq[..TapTracker::RESET_PULSES].iter().all(|&b| b));
        assert_eq!(tracker.current(), Some(Idle));
    }

    #[test]
    fn every_state_has_two_outgoing_edges() {
        for &s in ALL_STATES.iter() {
            let (t0, t1) = transitions(s);
            assert!(ALL_STATES.contains(&t0));
            assert!(ALL_STATES.contains(&t1));
        }
    }
}
