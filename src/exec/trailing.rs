//! Runner trailing stop: ATR (Wilder-smoothed, k × ATR off the close) or
//! PIVOT (most recent pivot extreme over a lookback window). Candidates
//! only ever tighten the stop — higher for LONG, lower for SHORT.

use std::collections::VecDeque;

use crate::config::TrailMode;
use crate::events::Ohlcv;

const ATR_PERIOD: f64 = 14.0;

/// Per-position trailing state, fed one bar at a time. Rebuilt from the
/// bar stream after a restart; the persisted runner stop keeps the
/// monotonic floor across the gap.
#[derive(Debug, Clone)]
pub struct TrailState {
    atr: Option<f64>,
    prev_close: Option<f64>,
    lows: VecDeque<f64>,
    highs: VecDeque<f64>,
    pivot_bars: usize,
}

impl TrailState {
    pub fn new(pivot_bars: usize) -> Self {
        Self {
            atr: None,
            prev_close: None,
            lows: VecDeque::with_capacity(pivot_bars + 1),
            highs: VecDeque::with_capacity(pivot_bars + 1),
            pivot_bars: pivot_bars.max(1),
        }
    }

    pub fn observe(&mut self, bar: &Ohlcv) {
        let tr = match self.prev_close {
            Some(pc) => (bar.high - bar.low)
                .max((bar.high - pc).abs())
                .max((bar.low - pc).abs()),
            None => bar.high - bar.low,
        };
        self.atr = Some(match self.atr {
            Some(atr) => (atr * (ATR_PERIOD - 1.0) + tr) / ATR_PERIOD,
            None => tr,
        });
        self.prev_close = Some(bar.close);

        self.lows.push_back(bar.low);
        self.highs.push_back(bar.high);
        while self.lows.len() > self.pivot_bars {
            self.lows.pop_front();
        }
        while self.highs.len() > self.pivot_bars {
            self.highs.pop_front();
        }
    }

    /// Candidate stop for the current state, before monotonic filtering.
    pub fn candidate(&self, mode: TrailMode, is_long: bool, close: f64, atr_mult: f64) -> Option<f64> {
        match mode {
            TrailMode::Atr => {
                let atr = self.atr?;
                Some(if is_long { close - atr_mult * atr } else { close + atr_mult * atr })
            }
            TrailMode::Pivot => {
                if is_long {
                    self.lows.iter().cloned().fold(None, |acc: Option<f64>, v| {
                        Some(acc.map_or(v, |a| a.min(v)))
                    })
                } else {
                    self.highs.iter().cloned().fold(None, |acc: Option<f64>, v| {
                        Some(acc.map_or(v, |a| a.max(v)))
                    })
                }
            }
        }
    }
}

/// Monotonic non-regression: accept the candidate only when it is
/// stricter than the current stop.
pub fn tighten(current: Option<f64>, candidate: f64, is_long: bool) -> Option<f64> {
    match current {
        None => Some(candidate),
        Some(cur) => {
            let stricter = if is_long { candidate > cur } else { candidate < cur };
            if stricter {
                Some(candidate)
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Ohlcv {
        Ohlcv { open, high, low, close, volume: 1.0 }
    }

    #[test]
    fn test_atr_candidate_tracks_close() {
        let mut t = TrailState::new(5);
        t.observe(&bar(100.0, 110.0, 95.0, 105.0));
        // First TR = high - low = 15, ATR seeded with it.
        let c = t.candidate(TrailMode::Atr, true, 105.0, 2.0).unwrap();
        assert_eq!(c, 105.0 - 30.0);
        // SHORT mirrors above the close.
        let s = t.candidate(TrailMode::Atr, false, 105.0, 2.0).unwrap();
        assert_eq!(s, 105.0 + 30.0);
    }

    #[test]
    fn test_pivot_candidate_uses_window_extreme() {
        let mut t = TrailState::new(2);
        t.observe(&bar(100.0, 105.0, 90.0, 104.0));
        t.observe(&bar(104.0, 112.0, 101.0, 110.0));
        t.observe(&bar(110.0, 118.0, 107.0, 116.0));
        // Window of 2: the 90 low has rolled out.
        assert_eq!(t.candidate(TrailMode::Pivot, true, 116.0, 0.0), Some(101.0));
        assert_eq!(t.candidate(TrailMode::Pivot, false, 116.0, 0.0), Some(118.0));
    }

    #[test]
    fn test_tighten_is_monotonic() {
        // LONG: only higher candidates pass.
        assert_eq!(tighten(Some(100.0), 103.0, true), Some(103.0));
        assert_eq!(tighten(Some(103.0), 101.0, true), None);
        assert_eq!(tighten(Some(103.0), 103.0, true), None);
        // SHORT: only lower.
        assert_eq!(tighten(Some(100.0), 97.0, false), Some(97.0));
        assert_eq!(tighten(Some(97.0), 99.0, false), None);
        // Unset stop accepts anything.
        assert_eq!(tighten(None, 50.0, true), Some(50.0));
    }
}
