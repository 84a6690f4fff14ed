//! Cold start, the periodic cycle, and failure containment.
//!
//! Per-instrument state sits behind one `tokio::sync::Mutex`. A tick takes it
//! with `try_lock_owned` before spawning the cycle task, so at most one cycle
//! is in flight and a colliding tick is dropped rather than queued.

use crate::collector::SnapshotStore;
use crate::config::BotConfig;
use crate::error::{BotError, BotResult};
use crate::features::{FeatureFrame, FeatureRegistry, GeneratorInputs, BASE_COLUMNS};
use crate::ingest::Ingestor;
use crate::market::MarketClient;
use crate::metrics::RuntimeMetrics;
use crate::model::ModelStore;
use crate::notify::NotificationSink;
use crate::signal::Signal;
use crate::trader::{LiveGateway, OrderGateway, ShadowGateway, Trader, TransitionRecord};
use crate::types::{BookSnapshot, Frequency};
use crate::window::RollingWindow;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Process-wide, read-only after startup.
pub struct Context {
    pub config: Arc<BotConfig>,
    pub models: Arc<ModelStore>,
    pub registry: Arc<FeatureRegistry>,
    pub snapshots: Option<Arc<SnapshotStore>>,
    pub notifier: Arc<dyn NotificationSink>,
    pub metrics: Arc<RuntimeMetrics>,
}

impl Context {
    /// Validates the config and checks that every model input is generated.
    pub fn new(
        config: BotConfig,
        models: ModelStore,
        snapshots: Option<Arc<SnapshotStore>>,
        notifier: Arc<dyn NotificationSink>,
        metrics: Arc<RuntimeMetrics>,
    ) -> BotResult<Self> {
        config.validate()?;
        let registry = config.registry()?;
        let outputs = registry.output_columns();
        models.check_features(BASE_COLUMNS.iter().copied().chain(outputs.iter().map(String::as_str)))?;
        if registry.needs_snapshots() && snapshots.is_none() {
            return Err(BotError::Config("order_flow features need a snapshot store".into()));
        }
        if config.trader.order_timeout_secs < config.frequency.as_secs() {
            warn!(
                order_timeout_secs = config.trader.order_timeout_secs,
                frequency = %config.frequency,
                "order timeout is shorter than the cycle period, orders expire at the next cycle"
            );
        }
        Ok(Self {
            config: Arc::new(config),
            models: Arc::new(models),
            registry: Arc::new(registry),
            snapshots,
            notifier,
            metrics,
        })
    }
}

/// Mutable per-instrument state, owned by whichever cycle holds the lock.
pub struct CycleState {
    pub window: RollingWindow,
    pub frame: FeatureFrame,
    pub trader: Trader,
    pub last_cycle: Option<DateTime<Utc>>,
    /// Timestamp of the last bar that went through inference.
    pub last_scored: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SkipReason {
    Ingestion(String),
    Generation(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CycleReport {
    pub ts: DateTime<Utc>,
    pub new_bars: usize,
    pub healthy: bool,
    pub score: Option<f64>,
    pub signal: Option<Signal>,
    pub transitions: Vec<TransitionRecord>,
    pub reconciliations: usize,
    pub execution_fault: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    Skipped(SkipReason),
    /// Another cycle for the instrument was still running.
    Dropped,
}

pub struct Orchestrator {
    ctx: Arc<Context>,
    ingestor: Ingestor,
    state: Arc<Mutex<CycleState>>,
}

impl Orchestrator {
    /// Backfills the window, builds the initial frame and reconciles the
    /// trader once. Failures here are logged and left for the first cycle to
    /// retry; only configuration and model faults (raised by [`Context::new`])
    /// stop the process.
    pub async fn start(ctx: Arc<Context>, client: Arc<dyn MarketClient>, now: DateTime<Utc>) -> BotResult<Self> {
        let cfg = ctx.config.clone();
        let gateway: Arc<dyn OrderGateway> = if cfg.trader.shadow {
            Arc::new(ShadowGateway::new(
                cfg.trader.base_asset.clone(),
                cfg.trader.quote_asset.clone(),
                cfg.trader.shadow_starting_quote,
            ))
        } else {
            Arc::new(LiveGateway::new(client.clone(), cfg.retry.clone()))
        };
        let ingestor = Ingestor::new(
            client,
            cfg.instrument.clone(),
            cfg.frequency,
            cfg.train_length,
            cfg.retry.clone(),
        );

        let mut window = RollingWindow::new(cfg.frequency, cfg.train_length);
        match ingestor.backfill(now).await {
            Ok(bars) => {
                let report = window.append(bars);
                info!(instrument = %cfg.instrument, bars = window.len(), gaps = report.gaps, "window backfilled");
            }
            Err(e) => warn!(instrument = %cfg.instrument, error = %e, "backfill failed, first cycle will retry"),
        }

        let mut frame = FeatureFrame::default();
        if let Err(e) = extend_frame(&ctx, &mut frame, &window).await {
            warn!(instrument = %cfg.instrument, error = %e, "initial feature computation failed");
        }

        let mut trader = Trader::new(cfg.instrument.clone(), cfg.trader.clone(), gateway)
            .with_notifier(ctx.notifier.clone());
        if let Err(e) = trader.recover(now).await {
            warn!(instrument = %cfg.instrument, error = %e, "startup reconciliation failed, first cycle will retry");
        }

        Ok(Self {
            ctx,
            ingestor,
            state: Arc::new(Mutex::new(CycleState {
                window,
                frame,
                trader,
                last_cycle: None,
                last_scored: None,
            })),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn state(&self) -> &Arc<Mutex<CycleState>> {
        &self.state
    }

    /// Spawns a cycle for `now`, or drops the tick when one is in flight.
    pub fn tick(&self, now: DateTime<Utc>) -> Option<JoinHandle<CycleOutcome>> {
        let guard = self.try_acquire(now)?;
        let ctx = self.ctx.clone();
        let ingestor = self.ingestor.clone();
        Some(tokio::spawn(async move { run_locked(ctx, ingestor, guard, now).await }))
    }

    /// Runs one cycle on the calling task.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleOutcome {
        match self.try_acquire(now) {
            Some(guard) => run_locked(self.ctx.clone(), self.ingestor.clone(), guard, now).await,
            None => CycleOutcome::Dropped,
        }
    }

    fn try_acquire(&self, now: DateTime<Utc>) -> Option<OwnedMutexGuard<CycleState>> {
        match self.state.clone().try_lock_owned() {
            Ok(guard) => Some(guard),
            Err(_) => {
                self.ctx.metrics.cycle_dropped();
                warn!(instrument = %self.ctx.config.instrument, tick = %now, "previous cycle still running, tick dropped");
                None
            }
        }
    }

    /// Fires a cycle at every `boundary + cycle_offset` until `shutdown`
    /// resolves, then waits for the in-flight cycle to finish.
    pub async fn run<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let cfg = &self.ctx.config;
        let offset = ChronoDuration::seconds(cfg.cycle_offset_secs as i64);
        info!(instrument = %cfg.instrument, frequency = %cfg.frequency, offset_secs = cfg.cycle_offset_secs, "scheduler started");
        let mut in_flight: Option<JoinHandle<CycleOutcome>> = None;
        loop {
            let now = Utc::now();
            let fire = next_fire(cfg.frequency, offset, now);
            let wait = (fire - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(wait) => {}
            }
            // A new cycle only spawns once the previous one released the lock.
            if let Some(previous) = self.tick(fire).and_then(|h| in_flight.replace(h)) {
                self.join_cycle(previous).await;
            }
        }
        if let Some(last) = in_flight.take() {
            self.join_cycle(last).await;
        }
        let _idle = self.state.lock().await;
        info!(instrument = %cfg.instrument, "scheduler stopped");
    }

    /// Waits for a spawned cycle. A cycle that panicked or was cancelled is
    /// logged and yields `None`; the state lock is already released by then.
    pub async fn join_cycle(&self, handle: JoinHandle<CycleOutcome>) -> Option<CycleOutcome> {
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_panic() => {
                error!(instrument = %self.ctx.config.instrument, error = %e, "cycle task panicked");
                None
            }
            Err(e) => {
                warn!(instrument = %self.ctx.config.instrument, error = %e, "cycle task cancelled");
                None
            }
        }
    }
}

/// First `boundary + offset` strictly after `now`.
pub fn next_fire(freq: Frequency, offset: ChronoDuration, now: DateTime<Utc>) -> DateTime<Utc> {
    let candidate = freq.floor(now) + offset;
    if candidate > now {
        candidate
    } else {
        candidate + freq.duration()
    }
}

async fn run_locked(
    ctx: Arc<Context>,
    ingestor: Ingestor,
    mut guard: OwnedMutexGuard<CycleState>,
    now: DateTime<Utc>,
) -> CycleOutcome {
    let started = Instant::now();
    let outcome = cycle(&ctx, &ingestor, &mut guard, now).await;
    let elapsed = started.elapsed();
    match &outcome {
        CycleOutcome::Completed(_) => ctx.metrics.cycle_completed(elapsed),
        CycleOutcome::Skipped(SkipReason::Ingestion(_)) => ctx.metrics.cycle_skipped(),
        CycleOutcome::Skipped(SkipReason::Generation(_)) => ctx.metrics.cycle_failed(),
        CycleOutcome::Dropped => {}
    }
    let deadline = Duration::from_secs(ctx.config.cycle_soft_deadline_secs);
    if elapsed > deadline {
        ctx.metrics.deadline_overrun();
        warn!(
            instrument = %ctx.config.instrument,
            elapsed_ms = elapsed.as_millis() as u64,
            deadline_ms = deadline.as_millis() as u64,
            "cycle overran its soft deadline"
        );
    }
    guard.last_cycle = Some(now);
    outcome
}

async fn cycle(ctx: &Context, ingestor: &Ingestor, state: &mut CycleState, now: DateTime<Utc>) -> CycleOutcome {
    let cfg = &ctx.config;
    let instrument = &cfg.instrument;

    let bars = match ingestor.fetch_since(state.window.last_ts(), now).await {
        Ok(bars) => bars,
        Err(e) => {
            warn!(%instrument, error = %e, "ingestion failed, cycle skipped");
            return CycleOutcome::Skipped(SkipReason::Ingestion(e.to_string()));
        }
    };
    let appended = state.window.append(bars);
    if appended.gaps > 0 {
        warn!(%instrument, gaps = appended.gaps, "gap in bar sequence");
    }

    let required = ctx.registry.required_history();
    let healthy = state.window.len() >= required && state.window.is_healthy(required);
    let pending = state.window.last_ts().is_some() && state.window.last_ts() > state.last_scored;

    let mut score = None;
    let mut signal = None;
    if healthy && pending {
        if let Err(e) = extend_frame(ctx, &mut state.frame, &state.window).await {
            error!(%instrument, error = %e, "feature generation failed, cycle aborted");
            return CycleOutcome::Skipped(SkipReason::Generation(e.to_string()));
        }
        let inference_started = Instant::now();
        let scored = if state.frame.last_ts() == state.window.last_ts() {
            ctx.models.score_latest(&state.frame)
        } else {
            Err(BotError::generation("inference", "feature frame is behind the window"))
        };
        ctx.metrics.inference(inference_started.elapsed());
        match scored {
            Ok(s) => {
                let sig = cfg.signal.generate(&s);
                debug!(%instrument, trade_score = s.trade_score, buy = sig.buy, sell = sig.sell, "scored latest bar");
                score = Some(s.trade_score);
                signal = Some(sig);
                state.last_scored = state.window.last_ts();
            }
            Err(e) => {
                error!(%instrument, error = %e, "inference failed, cycle aborted");
                return CycleOutcome::Skipped(SkipReason::Generation(e.to_string()));
            }
        }
    } else if !healthy {
        warn!(
            %instrument,
            bars = state.window.len(),
            required,
            gaps = ?state.window.gap_starts(),
            "ingestion unhealthy, inference skipped"
        );
    }

    let price = state.window.last().map(|b| b.close);
    let report = state.trader.apply(now, signal, score, price).await;
    for _ in &report.transitions {
        ctx.metrics.transition();
    }
    for _ in &report.reconciliations {
        ctx.metrics.reconciliation_mismatch();
    }
    if report.fault.is_some() {
        ctx.metrics.execution_fault();
    }

    info!(
        %instrument,
        new_bars = appended.appended,
        healthy,
        score,
        phase = %state.trader.phase(),
        transitions = report.transitions.len(),
        "cycle complete"
    );
    CycleOutcome::Completed(CycleReport {
        ts: now,
        new_bars: appended.appended,
        healthy,
        score,
        signal,
        transitions: report.transitions,
        reconciliations: report.reconciliations.len(),
        execution_fault: report.fault.map(|e| e.to_string()),
    })
}

/// Brings `frame` up to date with `window`, reading stored book snapshots on
/// the blocking pool when a generator needs them.
async fn extend_frame(ctx: &Context, frame: &mut FeatureFrame, window: &RollingWindow) -> BotResult<usize> {
    if window.is_empty() {
        return Ok(0);
    }
    let freq = window.frequency();
    let snapshots = if ctx.registry.needs_snapshots() {
        load_snapshots(ctx, frame, window).await
    } else {
        Vec::new()
    };
    let inputs = GeneratorInputs {
        freq,
        snapshots: &snapshots,
    };
    ctx.registry.extend(frame, window, &inputs)
}

async fn load_snapshots(ctx: &Context, frame: &FeatureFrame, window: &RollingWindow) -> Vec<BookSnapshot> {
    let Some(store) = ctx.snapshots.clone() else {
        return Vec::new();
    };
    let Some(last) = window.last_ts() else {
        return Vec::new();
    };
    let span = ctx.registry.rows_to_compute(frame, window) + ctx.registry.required_history() - 1;
    let from = window.tail(span).first().map(|b| b.ts).unwrap_or(last);
    // Open ended: snapshots past the last bar show how far the store is durable.
    let to = DateTime::<Utc>::MAX_UTC;
    let instrument = ctx.config.instrument.clone();
    let timeout = Duration::from_millis(ctx.config.collector.read_timeout_ms);

    let read = tokio::task::spawn_blocking(move || store.load_range(&instrument, from, to));
    match tokio::time::timeout(timeout, read).await {
        Ok(Ok(Ok(snaps))) => snaps,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "snapshot read failed, order-flow features unavailable");
            Vec::new()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "snapshot read task failed");
            Vec::new()
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "snapshot read timed out");
            Vec::new()
        }
    }
}
