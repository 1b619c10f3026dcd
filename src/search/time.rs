// src/search/time.rs
//
// Wall-clock budget for one move. `movetime` is taken verbatim; otherwise a
// slice of the remaining clock plus the increment, capped so the flag is
// never left hanging. Depth/node-limited and infinite searches get no
// deadline at all.

use crate::search::SearchLimits;
use chess::Color;
use std::time::{Duration, Instant};

const MOVE_OVERHEAD_MS: u64 = 30;

pub struct TimeManager {
    start: Instant,
    deadline: Option<Instant>,
}

impl Default for TimeManager {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            deadline: None,
        }
    }
}

impl TimeManager {
    pub fn init(&mut self, limits: &SearchLimits, side: Color, ply: u32) {
        self.start = limits.start;
        self.deadline = Self::allocate(limits, side, ply).map(|d| limits.start + d);
    }

    fn allocate(limits: &SearchLimits, side: Color, ply: u32) -> Option<Duration> {
        if limits.infinite {
            return None;
        }
        if limits.move_time > 0 {
            let budget = limits.move_time.saturating_sub(MOVE_OVERHEAD_MS).max(1);
            return Some(Duration::from_millis(budget));
        }

        let time_left = limits.time[side as usize];
        if time_left == 0 {
            return None;
        }
        let inc = limits.inc[side as usize];

        // Estimate remaining moves: start near 50, taper towards 20 as the
        // game gets longer.
        let mtg = (50u64.saturating_sub(ply as u64 * 2 / 5)).clamp(20, 50);
        let mut budget = time_left / mtg + inc;
        let cap = time_left.saturating_sub(MOVE_OVERHEAD_MS);
        if budget > cap {
            budget = cap;
        }
        Some(Duration::from_millis(budget.max(1)))
    }

    #[inline]
    pub fn start(&self) -> Instant {
        self.start
    }

    /// Remaining budget, if this search has one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn out_of_time(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}
