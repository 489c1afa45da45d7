//! OHLC path matcher for paper/backtest fills.
//!
//! Intra-bar ordering is resolved with the path heuristic: a green bar is
//! walked open → high → low → close, a red bar open → low → high → close.
//! Levels are filled at their trigger price in path order. A stop fill
//! closes the entire remainder and ends the walk.
//!
//! Stop adjustments earned inside a bar (break-even after TP1, runner
//! trailing after TP2) arm on the next bar: the walk checks the stop the
//! position carried into the bar.

use crate::events::Ohlcv;
use crate::exec::types::{ExitReason, Position};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimEventKind {
    Tp1,
    Tp2,
    StopOut(ExitReason),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimEvent {
    pub kind: SimEventKind,
    pub price: f64,
    pub qty: f64,
}

/// Segment endpoints in path order.
fn path(bar: &Ohlcv) -> [f64; 4] {
    if bar.close >= bar.open {
        [bar.open, bar.high, bar.low, bar.close]
    } else {
        [bar.open, bar.low, bar.high, bar.close]
    }
}

fn spans(a: f64, b: f64, level: f64) -> bool {
    level >= a.min(b) && level <= a.max(b)
}

/// Walk one bar against a position's levels. Pure: no state is mutated,
/// the caller applies the returned events.
pub fn match_bar(pos: &Position, bar: &Ohlcv) -> Vec<SimEvent> {
    let mut events = Vec::new();
    let mut remaining = pos.qty_total;
    let mut tp1_done = pos.meta.tp1_filled;
    let mut tp2_done = pos.meta.tp2_filled;

    let stop = pos.current_stop_price;
    let stop_reason = if tp1_done || tp2_done {
        ExitReason::SecondarySlExit
    } else {
        ExitReason::PrimarySlHit
    };

    let p = path(bar);
    for seg in p.windows(2) {
        let (a, b) = (seg[0], seg[1]);
        // Candidate levels crossed by this segment, ordered along the
        // direction of travel.
        let mut levels: Vec<(f64, SimEventKind)> = Vec::new();
        if spans(a, b, stop) {
            levels.push((stop, SimEventKind::StopOut(stop_reason)));
        }
        if !tp1_done && spans(a, b, pos.meta.tp1_price) {
            levels.push((pos.meta.tp1_price, SimEventKind::Tp1));
        }
        if !tp2_done && spans(a, b, pos.meta.tp2_price) {
            levels.push((pos.meta.tp2_price, SimEventKind::Tp2));
        }
        if b >= a {
            levels.sort_by(|x, y| x.0.partial_cmp(&y.0).unwrap());
        } else {
            levels.sort_by(|x, y| y.0.partial_cmp(&x.0).unwrap());
        }

        for (price, kind) in levels {
            match kind {
                SimEventKind::StopOut(reason) => {
                    if remaining > 0.0 {
                        events.push(SimEvent {
                            kind: SimEventKind::StopOut(reason),
                            price,
                            qty: remaining,
                        });
                    }
                    return events;
                }
                SimEventKind::Tp1 => {
                    let qty = pos.meta.tp1_qty.min(remaining);
                    if qty > 0.0 {
                        events.push(SimEvent { kind, price, qty });
                        remaining -= qty;
                        tp1_done = true;
                    }
                }
                SimEventKind::Tp2 => {
                    let qty = pos.meta.tp2_qty.min(remaining);
                    if qty > 0.0 {
                        events.push(SimEvent { kind, price, qty });
                        remaining -= qty;
                        tp2_done = true;
                    }
                }
            }
            if remaining <= 0.0 {
                return events;
            }
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PlanSide, RunnerRule, Timeframe, TpRule, TradePlan};
    use std::collections::HashMap;

    fn long_plan() -> TradePlan {
        TradePlan {
            plan_id: "pl".into(),
            idempotency_key: "ik".into(),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::H1,
            side: PlanSide::Buy,
            entry_price: 30_000.0,
            primary_sl_price: 29_000.0,
            tp1: TpRule { r_multiple: 1.0, qty_pct: 0.4, reduce_only: true },
            tp2: TpRule { r_multiple: 2.0, qty_pct: 0.4, reduce_only: true },
            runner: RunnerRule { qty_pct: 0.2, trail_mode: "ATR".into(), reduce_only: true },
            setup_id: None,
            trigger_id: None,
            status: "ACTIVE".into(),
            valid_from_ms: 0,
            expires_at_ms: i64::MAX,
            hist_entry: None,
            ext: HashMap::new(),
        }
    }

    fn long_pos() -> Position {
        Position::open_from_plan(&long_plan(), 0.05, 0)
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Ohlcv {
        Ohlcv { open, high, low, close, volume: 1.0 }
    }

    #[test]
    fn test_s1_bar_a_hits_tp1_only() {
        let pos = long_pos();
        let events = match_bar(&pos, &bar(30_000.0, 31_000.0, 29_900.0, 30_800.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SimEventKind::Tp1);
        assert_eq!(events[0].price, 31_000.0);
        assert_eq!(events[0].qty, 0.02);
    }

    #[test]
    fn test_s1_bar_b_hits_tp2_after_break_even_stop() {
        let mut pos = long_pos();
        // State after bar A: TP1 filled, stop at entry.
        pos.qty_total = 0.03;
        pos.meta.tp1_filled = true;
        pos.current_stop_price = 30_000.0;
        let events = match_bar(&pos, &bar(30_800.0, 32_500.0, 30_700.0, 32_200.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SimEventKind::Tp2);
        assert_eq!(events[0].price, 32_000.0);
        assert_eq!(events[0].qty, 0.02);
    }

    #[test]
    fn test_s2_red_bar_hits_primary_sl_first() {
        let pos = long_pos();
        // Red bar: walked open → low first, so the stop fires before the
        // high could have reached anything.
        let events = match_bar(&pos, &bar(30_000.0, 30_100.0, 28_900.0, 29_100.0));
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].kind,
            SimEventKind::StopOut(ExitReason::PrimarySlHit)
        );
        assert_eq!(events[0].price, 29_000.0);
        assert_eq!(events[0].qty, 0.05);
    }

    #[test]
    fn test_green_bar_tp_before_stop() {
        let pos = long_pos();
        // Green bar spanning both TP1 and the stop: up-leg first fills
        // TP1, down-leg then stops out the remainder.
        let events = match_bar(&pos, &bar(30_000.0, 31_100.0, 28_900.0, 30_500.0));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, SimEventKind::Tp1);
        assert_eq!(
            events[1].kind,
            SimEventKind::StopOut(ExitReason::PrimarySlHit)
        );
        assert_eq!(events[1].qty, 0.03);
    }

    #[test]
    fn test_tp1_and_tp2_same_bar() {
        let pos = long_pos();
        let events = match_bar(&pos, &bar(30_000.0, 32_600.0, 29_900.0, 32_500.0));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, SimEventKind::Tp1);
        assert_eq!(events[1].kind, SimEventKind::Tp2);
        // Order follows the upward leg: 31000 before 32000.
        assert!(events[0].price < events[1].price);
    }

    #[test]
    fn test_runner_stop_is_secondary_exit() {
        let mut pos = long_pos();
        pos.qty_total = 0.01;
        pos.meta.tp1_filled = true;
        pos.meta.tp2_filled = true;
        pos.current_stop_price = 31_500.0;
        pos.runner_stop_price = Some(31_500.0);
        let events = match_bar(&pos, &bar(32_000.0, 32_100.0, 31_400.0, 31_450.0));
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].kind,
            SimEventKind::StopOut(ExitReason::SecondarySlExit)
        );
        assert_eq!(events[0].price, 31_500.0);
        assert_eq!(events[0].qty, 0.01);
    }

    #[test]
    fn test_short_mirror() {
        let mut plan = long_plan();
        plan.side = PlanSide::Sell;
        plan.primary_sl_price = 31_000.0;
        let pos = Position::open_from_plan(&plan, 0.05, 0);
        // SHORT: TP1 at 29000, TP2 at 28000, stop at 31000.
        let events = match_bar(&pos, &bar(30_000.0, 30_200.0, 28_900.0, 29_500.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SimEventKind::Tp1);
        assert_eq!(events[0].price, 29_000.0);

        let events = match_bar(&pos, &bar(30_000.0, 31_200.0, 29_900.0, 30_900.0));
        assert_eq!(
            events[0].kind,
            SimEventKind::StopOut(ExitReason::PrimarySlHit)
        );
        assert_eq!(events[0].price, 31_000.0);
    }

    #[test]
    fn test_quiet_bar_no_events() {
        let pos = long_pos();
        assert!(match_bar(&pos, &bar(30_000.0, 30_400.0, 29_800.0, 30_200.0)).is_empty());
    }

    #[test]
    fn test_replay_is_deterministic() {
        let pos = long_pos();
        let b = bar(30_000.0, 31_100.0, 28_900.0, 30_500.0);
        assert_eq!(match_bar(&pos, &b), match_bar(&pos, &b));
    }
}
