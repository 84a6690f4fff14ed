//! Cycle scheduling, skipping and failure containment end to end.

use bar_signal_trader::collector::CollectorConfig;
use bar_signal_trader::config::{BotConfig, ModelsConfig};
use bar_signal_trader::features::GeneratorSpec;
use bar_signal_trader::market::sim::{FillBehavior, SimulatedMarket};
use bar_signal_trader::metrics::RuntimeMetrics;
use bar_signal_trader::model::{Estimator, ModelArtifact, ModelStore, ScoreConfig};
use bar_signal_trader::notify::{MemorySink, NotificationSink};
use bar_signal_trader::orchestrator::{CycleReport, SkipReason};
use bar_signal_trader::retry::RetryPolicy;
use bar_signal_trader::trader::{Phase, TradeEvent, TraderConfig};
use bar_signal_trader::types::{Bar, Frequency};
use bar_signal_trader::{BotError, Context, CycleOutcome, Orchestrator};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

/// On the 5m grid.
const T: i64 = 1_700_000_100;
const STEP: i64 = 300;

/// Scores the last one-bar return, scaled so a 1% move is a score of 1.
struct Momentum;

impl Estimator for Momentum {
    fn predict(&self, row: &[f64]) -> anyhow::Result<f64> {
        Ok(row[0] * 100.0)
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn bar(ts: i64, close: f64) -> Bar {
    Bar {
        ts: at(ts),
        open: close,
        high: close + 0.5,
        low: close - 0.5,
        close,
        volume: 10.0,
    }
}

/// Bars up to (but not including) `T`, all closing at 100.
fn history() -> Vec<Bar> {
    (1..=100).rev().map(|i| bar(T - i * STEP, 100.0)).collect()
}

/// Cycle time right after the bar starting at `ts` has closed.
fn after(ts: i64) -> DateTime<Utc> {
    at(ts + STEP + 5)
}

fn config(shadow: bool) -> BotConfig {
    BotConfig {
        frequency: Frequency::minutes(5),
        train_length: 100,
        features: vec![GeneratorSpec::Returns {
            column: "close".into(),
            periods: vec![1],
        }],
        models: ModelsConfig {
            labels: vec!["momentum".into()],
            algorithms: vec!["test".into()],
            ..ModelsConfig::default()
        },
        trader: TraderConfig {
            shadow,
            shadow_starting_quote: 1_000.0,
            ..TraderConfig::default()
        },
        retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            call_timeout_ms: 2_000,
            ..RetryPolicy::default()
        },
        collector: CollectorConfig {
            enabled: false,
            ..Default::default()
        },
        ..BotConfig::default()
    }
}

fn models() -> ModelStore {
    ModelStore::from_artifacts(
        vec![ModelArtifact {
            label: "momentum".into(),
            algorithm: "test".into(),
            features: vec!["close_ret_1".into()],
            scaler: None,
            estimator: Arc::new(Momentum),
            digest: None,
        }],
        ScoreConfig::default(),
    )
    .unwrap()
}

struct Harness {
    sim: Arc<SimulatedMarket>,
    metrics: Arc<RuntimeMetrics>,
    sink: Arc<MemorySink>,
    orch: Orchestrator,
}

async fn harness(shadow: bool) -> Harness {
    harness_with(config(shadow), models()).await
}

async fn harness_with(cfg: BotConfig, models: ModelStore) -> Harness {
    let sim = Arc::new(SimulatedMarket::new(Frequency::minutes(5), "BTC", "USDT"));
    sim.set_balance("USDT", 1_000.0);
    sim.set_fill_behavior(FillBehavior::Immediate);
    sim.push_bars(history());

    let metrics = Arc::new(RuntimeMetrics::new());
    let sink = Arc::new(MemorySink::new());
    let notifier: Arc<dyn NotificationSink> = sink.clone();
    let ctx = Context::new(cfg, models, None, notifier, metrics.clone()).unwrap();
    let orch = Orchestrator::start(Arc::new(ctx), sim.clone(), at(T + 5)).await.unwrap();
    Harness {
        sim,
        metrics,
        sink,
        orch,
    }
}

async fn phases(h: &Harness) -> Vec<Phase> {
    let state = h.orch.state().lock().await;
    state.trader.history().iter().map(|r| r.to).collect()
}

fn completed(outcome: CycleOutcome) -> CycleReport {
    match outcome {
        CycleOutcome::Completed(report) => report,
        other => panic!("expected a completed cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn cold_start_then_every_cycle_completes() {
    let h = harness(false).await;
    assert_eq!(h.orch.state().lock().await.window.len(), 100);
    assert_eq!(h.orch.state().lock().await.frame.len(), 100);

    let first = completed(h.orch.run_cycle_at(at(T + 5)).await);
    assert!(first.healthy);
    assert_eq!(first.new_bars, 0);
    assert_eq!(first.score, Some(0.0));

    for i in 0..6 {
        let ts = T + i * STEP;
        h.sim.push_bars([bar(ts, 100.0)]);
        let report = completed(h.orch.run_cycle_at(after(ts)).await);
        assert!(report.healthy);
        assert_eq!(report.new_bars, 1);
        assert_eq!(report.score, Some(0.0));
        assert!(report.transitions.is_empty());
    }
    assert_eq!(h.metrics.cycles_completed(), 7);
    let state = h.orch.state().lock().await;
    assert_eq!(state.window.len(), 100);
    assert_eq!(state.window.last_ts(), Some(at(T + 5 * STEP)));
    assert_eq!(state.frame.last_ts(), state.window.last_ts());
}

#[tokio::test]
async fn a_second_tick_while_a_cycle_runs_is_dropped() {
    let h = harness(false).await;
    h.sim.set_bar_delay(std::time::Duration::from_millis(200));

    let first = h.orch.tick(at(T + 5)).expect("first tick spawns a cycle");
    assert!(h.orch.tick(at(T + 5)).is_none());
    assert!(matches!(h.orch.run_cycle_at(at(T + 5)).await, CycleOutcome::Dropped));
    assert_eq!(h.metrics.cycles_dropped(), 2);

    assert!(matches!(first.await.unwrap(), CycleOutcome::Completed(_)));
    assert_eq!(h.metrics.cycles_completed(), 1);
    // the lock is free again
    assert!(h.orch.tick(at(T + STEP + 5)).is_some());
}

#[tokio::test]
async fn slow_cycle_overruns_its_soft_deadline_but_still_completes() {
    let cfg = BotConfig {
        cycle_soft_deadline_secs: 0,
        ..config(false)
    };
    let h = harness_with(cfg, models()).await;
    h.sim.set_bar_delay(std::time::Duration::from_millis(50));
    h.sim.push_bars([bar(T, 100.0)]);

    let report = completed(h.orch.run_cycle_at(after(T)).await);
    assert_eq!(report.new_bars, 1);
    let kv = h.metrics.snapshot_kv();
    assert_eq!(kv["cycles.deadline_overruns"], "1");
    assert_eq!(kv["cycles.completed"], "1");
}

/// Stands in for an estimator with a bug.
struct Explodes;

impl Estimator for Explodes {
    fn predict(&self, _row: &[f64]) -> anyhow::Result<f64> {
        panic!("estimator bug")
    }
}

#[tokio::test]
async fn a_panicking_cycle_is_reported_and_releases_the_lock() {
    let exploding = ModelStore::from_artifacts(
        vec![ModelArtifact {
            label: "momentum".into(),
            algorithm: "test".into(),
            features: vec!["close_ret_1".into()],
            scaler: None,
            estimator: Arc::new(Explodes),
            digest: None,
        }],
        ScoreConfig::default(),
    )
    .unwrap();
    let h = harness_with(config(false), exploding).await;

    let handle = h.orch.tick(at(T + 5)).expect("cycle spawned");
    assert!(h.orch.join_cycle(handle).await.is_none());
    assert_eq!(h.metrics.cycles_completed(), 0);
    // the guard was dropped while unwinding
    assert!(h.orch.state().try_lock().is_ok());
    assert!(h.orch.tick(at(T + STEP + 5)).is_some());
}

#[tokio::test]
async fn order_timeout_is_enforced_at_the_next_cycle() {
    let h = harness(false).await;
    h.sim.set_fill_behavior(FillBehavior::Never);
    h.sim.push_bars([bar(T, 101.0)]);
    completed(h.orch.run_cycle_at(after(T)).await);
    assert_eq!(phases(&h).await, vec![Phase::Entering]);

    // the 60s timeout passed long before this cycle, which is the first to see it
    h.sim.push_bars([bar(T + STEP, 101.0)]);
    let report = completed(h.orch.run_cycle_at(after(T + STEP)).await);
    assert_eq!(report.transitions.len(), 1);
    assert_eq!(report.transitions[0].event, TradeEvent::Timeout);
    assert_eq!(report.transitions[0].ts, after(T + STEP));
    assert_eq!(h.sim.cancel_calls(), 1);
    assert_eq!(phases(&h).await, vec![Phase::Entering, Phase::Flat]);
}

#[tokio::test]
async fn ingestion_failure_skips_the_cycle() {
    let h = harness(false).await;
    h.sim.push_bars([bar(T, 101.0)]);
    h.sim.fail_next_bar_calls(2);

    let outcome = h.orch.run_cycle_at(after(T)).await;
    assert!(matches!(outcome, CycleOutcome::Skipped(SkipReason::Ingestion(_))));
    assert_eq!(h.orch.state().lock().await.window.last_ts(), Some(at(T - STEP)));
    assert_eq!(h.sim.place_calls(), 0);
    assert_eq!(h.metrics.snapshot_kv()["cycles.skipped"], "1");

    // failures are used up, the next cycle catches up and acts on the bar
    let report = completed(h.orch.run_cycle_at(after(T) + Duration::seconds(10)).await);
    assert_eq!(report.new_bars, 1);
    assert!(report.signal.unwrap().buy);
    assert_eq!(h.sim.place_calls(), 1);
}

#[tokio::test]
async fn non_finite_features_abort_inference_without_touching_the_trader() {
    let h = harness(false).await;
    h.sim.push_bars([bar(T, f64::NAN)]);

    let outcome = h.orch.run_cycle_at(after(T)).await;
    assert!(matches!(outcome, CycleOutcome::Skipped(SkipReason::Generation(_))));
    assert_eq!(h.metrics.snapshot_kv()["cycles.failed"], "1");
    let state = h.orch.state().lock().await;
    assert_eq!(state.trader.phase(), Phase::Flat);
    assert!(state.trader.history().is_empty());
    assert_eq!(h.sim.place_calls(), 0);
    assert!(h.sink.notifications().is_empty());
}

#[tokio::test]
async fn gap_marks_the_window_unhealthy() {
    let h = harness(false).await;
    // skip the slot at T
    h.sim.push_bars([bar(T + STEP, 105.0)]);
    let report = completed(h.orch.run_cycle_at(after(T + STEP)).await);
    assert!(!report.healthy);
    assert_eq!(report.score, None);
    assert!(report.signal.is_none());

    // contiguous again once the required history is past the gap
    h.sim.push_bars([bar(T + 2 * STEP, 105.0)]);
    let report = completed(h.orch.run_cycle_at(after(T + 2 * STEP)).await);
    assert!(report.healthy);
    assert_eq!(report.score, Some(0.0));
}

#[tokio::test]
async fn shadow_mode_matches_live_transitions_without_orders() {
    let live = harness(false).await;
    let shadow = harness(true).await;
    let closes = [101.0, 101.0, 99.0, 99.0];

    for (i, close) in closes.into_iter().enumerate() {
        let ts = T + i as i64 * STEP;
        live.sim.push_bars([bar(ts, close)]);
        shadow.sim.push_bars([bar(ts, close)]);
        let a = completed(live.orch.run_cycle_at(after(ts)).await);
        let b = completed(shadow.orch.run_cycle_at(after(ts)).await);
        assert_eq!(a.signal, b.signal, "cycle {i}");
        let key = |r: &CycleReport| {
            r.transitions
                .iter()
                .map(|t| (t.from, t.to, t.event, t.side, t.price, t.qty))
                .collect::<Vec<_>>()
        };
        assert_eq!(key(&a), key(&b), "cycle {i}");
    }

    let expected = vec![Phase::Entering, Phase::Open, Phase::Exiting, Phase::Flat];
    assert_eq!(phases(&live).await, expected);
    assert_eq!(phases(&shadow).await, expected);

    assert_eq!(live.sim.place_calls(), 2);
    assert_eq!(shadow.sim.place_calls(), 0);
    assert_eq!(shadow.sim.status_calls(), 0);
    assert_eq!(live.sink.event_types(), shadow.sink.event_types());
}

#[tokio::test]
async fn run_returns_once_shutdown_fires() {
    let h = harness(true).await;
    h.orch.run(async {}).await;
    assert_eq!(h.metrics.cycles_completed(), 0);
}

#[tokio::test]
async fn startup_rejects_models_reading_unknown_features() {
    let store = ModelStore::from_artifacts(
        vec![ModelArtifact {
            label: "momentum".into(),
            algorithm: "test".into(),
            features: vec!["close_ret_4".into()],
            scaler: None,
            estimator: Arc::new(Momentum),
            digest: None,
        }],
        ScoreConfig::default(),
    )
    .unwrap();
    let notifier: Arc<dyn NotificationSink> = Arc::new(MemorySink::new());
    let err = Context::new(config(false), store, None, notifier, Arc::new(RuntimeMetrics::new())).err();
    assert!(matches!(err, Some(BotError::Config(_))));
}
