//! Admission gate pipeline for incoming trade plans.
//!
//! Gates run against a `GateContext` snapshot gathered by the executor,
//! in the fixed order: kill switch → plan expiry → risk circuit →
//! cooldown → max positions → same-symbol-side mutex. The first failure
//! short-circuits. (Gate zero, the distributed idempotency lock, happens
//! before the snapshot is taken.)

use serde_json::{json, Value};

use crate::config::MutexUpgradeAction;
use crate::events::TradePlan;
use crate::exec::types::RejectReason;

/// Same-(symbol, side) peer considered by the mutex gate.
#[derive(Debug, Clone)]
pub struct MutexPeer {
    pub position_id: String,
    pub priority: u8,
    /// A peer still unwinding from a previous upgrade blocks outright.
    pub closing: bool,
}

#[derive(Debug, Clone)]
pub struct GateContext {
    pub now_ms: i64,
    pub kill_switch: bool,
    pub risk_circuit_enabled: bool,
    pub soft_halt: bool,
    pub hard_halt: bool,
    pub risk_kill_switch: bool,
    pub cooldown_until_ms: Option<i64>,
    pub open_count: usize,
    pub max_open: usize,
    pub same_side_peers: Vec<MutexPeer>,
    pub upgrade_action: MutexUpgradeAction,
}

#[derive(Debug, Clone)]
pub enum Admission {
    Admit,
    /// Close the listed lower-priority peers at market, then open.
    UpgradeThenAdmit { displace: Vec<String> },
    Reject { reason: RejectReason, detail: Value },
}

pub fn admit(plan: &TradePlan, ctx: &GateContext) -> Admission {
    // 2. Kill switch
    if ctx.kill_switch {
        return Admission::Reject {
            reason: RejectReason::KillSwitchOn,
            detail: json!({ "symbol": plan.symbol }),
        };
    }

    // 3. Plan expiry
    if plan.expires_at_ms < ctx.now_ms {
        return Admission::Reject {
            reason: RejectReason::SignalExpired,
            detail: json!({
                "expires_at_ms": plan.expires_at_ms,
                "now_ms": ctx.now_ms,
            }),
        };
    }

    // 4. Risk circuit (soft halt blocks entries only; exits elsewhere
    //    never consult this gate)
    if ctx.risk_circuit_enabled && (ctx.soft_halt || ctx.hard_halt || ctx.risk_kill_switch) {
        return Admission::Reject {
            reason: RejectReason::RiskCircuitHalt,
            detail: json!({
                "soft_halt": ctx.soft_halt,
                "hard_halt": ctx.hard_halt,
                "kill_switch": ctx.risk_kill_switch,
            }),
        };
    }

    // 5. Cooldown
    if let Some(until) = ctx.cooldown_until_ms {
        return Admission::Reject {
            reason: RejectReason::CooldownBlocked,
            detail: json!({ "until_ts_ms": until }),
        };
    }

    // 6. Max positions
    if ctx.open_count >= ctx.max_open {
        return Admission::Reject {
            reason: RejectReason::MaxPositionsBlocked,
            detail: json!({ "open": ctx.open_count, "max": ctx.max_open }),
        };
    }

    // 7. Same-symbol-side mutex with timeframe priority
    if !ctx.same_side_peers.is_empty() {
        let incoming = plan.timeframe.priority();
        let mut displace = Vec::new();
        for peer in &ctx.same_side_peers {
            if peer.closing || incoming <= peer.priority {
                return Admission::Reject {
                    reason: RejectReason::PositionMutexBlocked,
                    detail: json!({
                        "existing_position_id": peer.position_id,
                        "existing_priority": peer.priority,
                        "incoming_priority": incoming,
                        "closing": peer.closing,
                    }),
                };
            }
            displace.push(peer.position_id.clone());
        }
        return match ctx.upgrade_action {
            MutexUpgradeAction::CloseLowerAndOpen => Admission::UpgradeThenAdmit { displace },
            MutexUpgradeAction::Block => Admission::Reject {
                reason: RejectReason::PositionMutexBlocked,
                detail: json!({
                    "incoming_priority": incoming,
                    "upgrade_action": "BLOCK",
                }),
            },
        };
    }

    Admission::Admit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PlanSide, RunnerRule, Timeframe, TpRule};
    use std::collections::HashMap;

    fn plan(tf: Timeframe) -> TradePlan {
        TradePlan {
            plan_id: "pl".into(),
            idempotency_key: "ik".into(),
            symbol: "BTCUSDT".into(),
            timeframe: tf,
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
            expires_at_ms: 10_000,
            hist_entry: None,
            ext: HashMap::new(),
        }
    }

    fn ctx() -> GateContext {
        GateContext {
            now_ms: 1_000,
            kill_switch: false,
            risk_circuit_enabled: true,
            soft_halt: false,
            hard_halt: false,
            risk_kill_switch: false,
            cooldown_until_ms: None,
            open_count: 0,
            max_open: 5,
            same_side_peers: vec![],
            upgrade_action: MutexUpgradeAction::CloseLowerAndOpen,
        }
    }

    fn reason_of(a: Admission) -> RejectReason {
        match a {
            Admission::Reject { reason, .. } => reason,
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn test_clean_plan_admitted() {
        assert!(matches!(admit(&plan(Timeframe::H1), &ctx()), Admission::Admit));
    }

    #[test]
    fn test_kill_switch_first() {
        let mut c = ctx();
        c.kill_switch = true;
        // Even an expired plan reports the kill switch: gate order is fixed.
        let mut p = plan(Timeframe::H1);
        p.expires_at_ms = 0;
        assert_eq!(reason_of(admit(&p, &c)), RejectReason::KillSwitchOn);
    }

    #[test]
    fn test_expired_plan() {
        let mut p = plan(Timeframe::H1);
        p.expires_at_ms = 999;
        assert_eq!(reason_of(admit(&p, &ctx())), RejectReason::SignalExpired);
    }

    #[test]
    fn test_risk_circuit_halts() {
        let mut c = ctx();
        c.soft_halt = true;
        assert_eq!(reason_of(admit(&plan(Timeframe::H1), &c)), RejectReason::RiskCircuitHalt);

        // Disabled circuit lets the same state through.
        c.risk_circuit_enabled = false;
        assert!(matches!(admit(&plan(Timeframe::H1), &c), Admission::Admit));
    }

    #[test]
    fn test_cooldown_blocks() {
        let mut c = ctx();
        c.cooldown_until_ms = Some(5_000);
        assert_eq!(reason_of(admit(&plan(Timeframe::H1), &c)), RejectReason::CooldownBlocked);
    }

    #[test]
    fn test_max_positions() {
        let mut c = ctx();
        c.open_count = 5;
        assert_eq!(
            reason_of(admit(&plan(Timeframe::H1), &c)),
            RejectReason::MaxPositionsBlocked
        );
    }

    #[test]
    fn test_mutex_same_or_higher_priority_blocks() {
        let mut c = ctx();
        c.same_side_peers = vec![MutexPeer {
            position_id: "p-4h".into(),
            priority: Timeframe::H4.priority(),
            closing: false,
        }];
        // 1h (priority 1) vs existing 4h (priority 2): blocked.
        assert_eq!(
            reason_of(admit(&plan(Timeframe::H1), &c)),
            RejectReason::PositionMutexBlocked
        );
        // Equal priority also blocked.
        assert_eq!(
            reason_of(admit(&plan(Timeframe::H4), &c)),
            RejectReason::PositionMutexBlocked
        );
    }

    #[test]
    fn test_mutex_upgrade_displaces_lower() {
        let mut c = ctx();
        c.same_side_peers = vec![MutexPeer {
            position_id: "p-1h".into(),
            priority: Timeframe::H1.priority(),
            closing: false,
        }];
        match admit(&plan(Timeframe::H4), &c) {
            Admission::UpgradeThenAdmit { displace } => assert_eq!(displace, vec!["p-1h"]),
            other => panic!("expected upgrade, got {other:?}"),
        }
    }

    #[test]
    fn test_mutex_block_action_rejects_even_higher_priority() {
        let mut c = ctx();
        c.upgrade_action = MutexUpgradeAction::Block;
        c.same_side_peers = vec![MutexPeer {
            position_id: "p-1h".into(),
            priority: Timeframe::H1.priority(),
            closing: false,
        }];
        assert_eq!(
            reason_of(admit(&plan(Timeframe::H4), &c)),
            RejectReason::PositionMutexBlocked
        );
    }

    #[test]
    fn test_mutex_closing_peer_blocks_upgrade() {
        let mut c = ctx();
        c.same_side_peers = vec![MutexPeer {
            position_id: "p-1h".into(),
            priority: Timeframe::H1.priority(),
            closing: true,
        }];
        // A half-unwound peer must finish before a new plan may overlap.
        assert_eq!(
            reason_of(admit(&plan(Timeframe::H4), &c)),
            RejectReason::PositionMutexBlocked
        );
    }
}
