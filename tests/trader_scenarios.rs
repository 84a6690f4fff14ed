//! Order state machine scenarios against the simulated market.

use bar_signal_trader::market::sim::{FillBehavior, SimulatedMarket};
use bar_signal_trader::notify::{EventType, MemorySink};
use bar_signal_trader::retry::RetryPolicy;
use bar_signal_trader::signal::Signal;
use bar_signal_trader::trader::{
    transition, LiveGateway, Phase, ShadowGateway, TradeEvent, Trader, TraderConfig,
};
use bar_signal_trader::types::{Frequency, Instrument, OrderId, Side};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

const PRICE: f64 = 100.0;
const BUY: Option<Signal> = Some(Signal { buy: true, sell: false });
const SELL: Option<Signal> = Some(Signal { buy: false, sell: true });

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap()
}

fn cfg() -> TraderConfig {
    TraderConfig {
        percentage_used: 1.0,
        max_quote_per_trade: 500.0,
        min_qty: 0.01,
        qty_step: 0.01,
        price_tick: 0.01,
        limit_price_adjustment: 0.0,
        order_timeout_secs: 60,
        ..TraderConfig::default()
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        call_timeout_ms: 1_000,
        ..RetryPolicy::default()
    }
}

fn market(fills: FillBehavior) -> Arc<SimulatedMarket> {
    let sim = Arc::new(SimulatedMarket::new(Frequency::minutes(5), "BTC", "USDT"));
    sim.set_balance("USDT", 10_000.0);
    sim.set_fill_behavior(fills);
    sim
}

fn live_trader(sim: &Arc<SimulatedMarket>) -> Trader {
    let gateway = Arc::new(LiveGateway::new(sim.clone(), fast_retry()));
    Trader::new(Instrument("BTCUSDT".into()), cfg(), gateway)
}

fn pending_id(trader: &Trader) -> OrderId {
    trader.state().pending.as_ref().unwrap().order_id.clone()
}

// ============================================================================
// Entry, fill and timeout
// ============================================================================

#[tokio::test]
async fn buy_signal_places_one_order_and_fill_opens_position() {
    let sim = market(FillBehavior::Never);
    let sink = Arc::new(MemorySink::new());
    let mut trader = live_trader(&sim).with_notifier(sink.clone());

    let report = trader.apply(t0(), BUY, Some(0.8), Some(PRICE)).await;
    assert!(report.fault.is_none());
    assert_eq!(trader.phase(), Phase::Entering);
    assert_eq!(sim.place_calls(), 1);
    let id = pending_id(&trader);
    let (order, _) = sim.order(&id).unwrap();
    assert_eq!(order.price, PRICE);
    assert!((order.qty - 5.0).abs() < 1e-9);

    // not filled yet, still inside the timeout
    trader.apply(t0() + Duration::seconds(30), None, None, Some(PRICE)).await;
    assert_eq!(trader.phase(), Phase::Entering);

    assert!(sim.fill_order(&id));
    let report = trader.apply(t0() + Duration::seconds(40), None, None, Some(PRICE)).await;
    assert_eq!(trader.phase(), Phase::Open);
    assert_eq!(report.transitions.len(), 1);
    assert_eq!(report.transitions[0].event, TradeEvent::Fill);
    assert!((trader.state().qty - 5.0).abs() < 1e-9);
    assert_eq!(trader.state().entry_price, Some(PRICE));
    assert!(trader.state().pending.is_none());
    assert_eq!(sim.place_calls(), 1);
    assert_eq!(sink.event_types(), vec![EventType::EntryPlaced, EventType::EntryFilled]);
}

#[tokio::test]
async fn unfilled_entry_is_cancelled_after_timeout() {
    let sim = market(FillBehavior::Never);
    let mut trader = live_trader(&sim);
    trader.apply(t0(), BUY, None, Some(PRICE)).await;
    let id = pending_id(&trader);

    let report = trader.apply(t0() + Duration::seconds(61), None, None, Some(PRICE)).await;
    assert!(report.fault.is_none());
    assert_eq!(sim.cancel_calls(), 1);
    assert_eq!(trader.phase(), Phase::Flat);
    assert_eq!(trader.state().qty, 0.0);
    assert_eq!(report.transitions[0].event, TradeEvent::Timeout);
    assert!(sim.order(&id).unwrap().1.is_terminal());
}

#[tokio::test]
async fn exit_timeout_returns_to_open() {
    let sim = market(FillBehavior::Immediate);
    let mut trader = live_trader(&sim);
    trader.apply(t0(), BUY, None, Some(PRICE)).await;
    trader.apply(t0() + Duration::seconds(10), None, None, Some(PRICE)).await;
    assert_eq!(trader.phase(), Phase::Open);

    sim.set_fill_behavior(FillBehavior::Never);
    trader.apply(t0() + Duration::seconds(20), SELL, None, Some(PRICE)).await;
    assert_eq!(trader.phase(), Phase::Exiting);
    let report = trader.apply(t0() + Duration::seconds(90), None, None, Some(PRICE)).await;
    assert_eq!(trader.phase(), Phase::Open);
    assert_eq!(report.transitions[0].event, TradeEvent::Timeout);
    assert!((trader.state().qty - 5.0).abs() < 1e-9);
}

// ============================================================================
// Partial fills and venue-side outcomes
// ============================================================================

#[tokio::test]
async fn partial_entry_fill_is_confirmed_at_timeout() {
    let sim = market(FillBehavior::Partial(0.5));
    let mut trader = live_trader(&sim);
    trader.apply(t0(), BUY, None, Some(PRICE)).await;
    assert_eq!(trader.phase(), Phase::Entering);

    let report = trader.apply(t0() + Duration::seconds(60), None, None, Some(PRICE)).await;
    assert_eq!(sim.cancel_calls(), 1);
    assert_eq!(trader.phase(), Phase::Open);
    assert_eq!(report.transitions[0].event, TradeEvent::Fill);
    assert!((trader.state().qty - 2.5).abs() < 1e-9);

    // balances agree with the confirmed quantity, so no override
    let report = trader.apply(t0() + Duration::seconds(120), None, None, Some(PRICE)).await;
    assert!(report.reconciliations.is_empty());
    assert_eq!(trader.phase(), Phase::Open);
}

#[tokio::test]
async fn dust_partial_fill_counts_as_timeout() {
    let sim = market(FillBehavior::Partial(0.001));
    let mut trader = live_trader(&sim);
    trader.apply(t0(), BUY, None, Some(PRICE)).await;

    let report = trader.apply(t0() + Duration::seconds(61), None, None, Some(PRICE)).await;
    assert_eq!(trader.phase(), Phase::Flat);
    assert_eq!(report.transitions[0].event, TradeEvent::Timeout);

    // 0.005 BTC of dust is below min_qty, the account still reads flat
    let report = trader.apply(t0() + Duration::seconds(120), None, None, Some(PRICE)).await;
    assert!(report.reconciliations.is_empty());
}

#[tokio::test]
async fn venue_cancel_is_treated_as_rejection() {
    let sim = market(FillBehavior::Never);
    let sink = Arc::new(MemorySink::new());
    let mut trader = live_trader(&sim).with_notifier(sink.clone());
    trader.apply(t0(), BUY, None, Some(PRICE)).await;
    assert!(sim.cancel_externally(&pending_id(&trader)));

    let report = trader.apply(t0() + Duration::seconds(5), None, None, Some(PRICE)).await;
    assert_eq!(trader.phase(), Phase::Flat);
    assert_eq!(report.transitions[0].event, TradeEvent::Rejected);
    assert_eq!(sim.cancel_calls(), 0);
    assert_eq!(sink.event_types().last(), Some(&EventType::OrderRejected));
}

#[tokio::test]
async fn failed_placement_leaves_phase_unchanged() {
    let sim = market(FillBehavior::Never);
    let mut trader = live_trader(&sim);
    sim.fail_next_order_calls(1);

    let report = trader.apply(t0(), BUY, None, Some(PRICE)).await;
    assert!(report.fault.is_some());
    assert_eq!(trader.phase(), Phase::Flat);
    assert!(trader.state().pending.is_none());
    assert!(trader.history().is_empty());
    // placement is never retried within a cycle
    assert_eq!(sim.place_calls(), 1);

    let report = trader.apply(t0() + Duration::seconds(300), BUY, None, Some(PRICE)).await;
    assert!(report.fault.is_none());
    assert_eq!(trader.phase(), Phase::Entering);
}

// ============================================================================
// Reconciliation and ignored signals
// ============================================================================

#[tokio::test]
async fn market_balance_overrides_local_phase() {
    let sim = market(FillBehavior::Never);
    let sink = Arc::new(MemorySink::new());
    let mut trader = live_trader(&sim).with_notifier(sink.clone());
    sim.set_balance("BTC", 2.0);

    let report = trader.apply(t0(), None, None, Some(PRICE)).await;
    assert_eq!(report.reconciliations.len(), 1);
    assert!(report.transitions.is_empty());
    let rec = &report.reconciliations[0];
    assert_eq!((rec.local_phase, rec.market_phase), (Phase::Flat, Phase::Open));
    assert_eq!(trader.phase(), Phase::Open);
    assert!((trader.state().qty - 2.0).abs() < 1e-9);
    assert_eq!(sink.event_types(), vec![EventType::ReconciliationMismatch]);

    // a manual sell-off outside the bot flips it back
    sim.set_balance("BTC", 0.0);
    let report = trader.apply(t0() + Duration::seconds(300), None, None, Some(PRICE)).await;
    assert_eq!(report.reconciliations.len(), 1);
    assert_eq!(trader.phase(), Phase::Flat);
}

#[tokio::test]
async fn signals_outside_their_phase_are_ignored() {
    let sim = market(FillBehavior::Immediate);
    let mut trader = live_trader(&sim);

    let report = trader.apply(t0(), SELL, None, Some(PRICE)).await;
    assert_eq!(report.ignored, Some((Side::Sell, Phase::Flat)));
    assert_eq!(sim.place_calls(), 0);

    trader.apply(t0(), BUY, None, Some(PRICE)).await;
    trader.apply(t0() + Duration::seconds(1), None, None, Some(PRICE)).await;
    assert_eq!(trader.phase(), Phase::Open);

    let report = trader.apply(t0() + Duration::seconds(2), BUY, None, Some(PRICE)).await;
    assert!(report.ignored.is_some());
    assert_eq!(sim.place_calls(), 1);
    assert_eq!(trader.phase(), Phase::Open);
}

// ============================================================================
// Shadow mode
// ============================================================================

#[tokio::test]
async fn shadow_and_live_take_identical_transitions() {
    let sim = market(FillBehavior::Immediate);
    let mut live = live_trader(&sim);
    let shadow_gw = Arc::new(ShadowGateway::new("BTC", "USDT", 10_000.0));
    let mut shadow = Trader::new(Instrument("BTCUSDT".into()), cfg(), shadow_gw.clone());
    assert!(shadow.is_shadow());
    assert!(!live.is_shadow());

    let plan = [BUY, None, None, SELL, None, BUY, None, SELL, None];
    for (i, signal) in plan.into_iter().enumerate() {
        let now = t0() + Duration::seconds(300 * i as i64);
        live.apply(now, signal, Some(0.5), Some(PRICE)).await;
        shadow.apply(now, signal, Some(0.5), Some(PRICE)).await;
        assert_eq!(live.phase(), shadow.phase(), "step {i}");
    }

    let key = |t: &Trader| {
        t.history()
            .iter()
            .map(|r| (r.from, r.to, r.event, r.side, r.price, r.qty))
            .collect::<Vec<_>>()
    };
    assert_eq!(key(&live), key(&shadow));
    assert_eq!(live.history().len(), 8);
    assert_eq!(shadow_gw.recorded_orders().len(), 4);
    assert_eq!(sim.place_calls(), 4);
}

// ============================================================================
// Random event sequences
// ============================================================================

#[derive(Clone, Debug)]
enum Step {
    Signal(bool),
    Idle,
    FillPending,
    VenueCancel,
    Wait(i64),
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => any::<bool>().prop_map(Step::Signal),
        2 => Just(Step::Idle),
        2 => Just(Step::FillPending),
        1 => Just(Step::VenueCancel),
        2 => (1i64..90).prop_map(Step::Wait),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn random_event_sequences_respect_the_table(steps in prop::collection::vec(arb_step(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let sim = market(FillBehavior::Never);
            let mut trader = live_trader(&sim);
            let mut now = t0();
            let mut seen: BTreeSet<OrderId> = BTreeSet::new();

            for step in steps {
                let signal = match step {
                    Step::Signal(true) => BUY,
                    Step::Signal(false) => SELL,
                    Step::FillPending => {
                        if let Some(p) = &trader.state().pending {
                            sim.fill_order(&p.order_id);
                        }
                        None
                    }
                    Step::VenueCancel => {
                        if let Some(p) = &trader.state().pending {
                            sim.cancel_externally(&p.order_id);
                        }
                        None
                    }
                    Step::Wait(secs) => {
                        now += Duration::seconds(secs);
                        None
                    }
                    Step::Idle => None,
                };
                let report = trader.apply(now, signal, None, Some(PRICE)).await;
                prop_assert!(report.fault.is_none());

                let state = trader.state();
                let transitional = matches!(state.phase, Phase::Entering | Phase::Exiting);
                prop_assert_eq!(state.pending.is_some(), transitional);
                prop_assert!(state.qty >= 0.0);
                if state.phase == Phase::Flat {
                    prop_assert_eq!(state.qty, 0.0);
                }
                if let Some(p) = &state.pending {
                    seen.insert(p.order_id.clone());
                }
                let live_orders = seen
                    .iter()
                    .filter(|id| sim.order(id).map(|(_, s)| !s.is_terminal()).unwrap_or(false))
                    .count();
                prop_assert!(live_orders <= 1);
                // one position at most: 500 USDT at 100 is 5 BTC
                prop_assert!(sim.balances_now().get("BTC") <= 5.0 + 1e-9);
            }

            for rec in trader.history() {
                prop_assert_eq!(transition(rec.from, rec.event), Some(rec.to));
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
