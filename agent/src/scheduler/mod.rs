//! The activation loop.
//!
//! Each cycle walks every identity whose machine code is still under quota,
//! makes it the live fingerprint, runs one activation on a pooled handle and
//! books the resulting machine code. Between cycles the scheduler sleeps for
//! the configured interval in short slices so a stop request is honored
//! promptly.

use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use rotary_db::{
    models::Identity,
    storage::{Recorded, short_code},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    context::SchedulerContext,
    engines::{ActivationService, EngineError, SpoofingService},
    error::SchedulerError,
    pool::{DEFAULT_RELEASE_TIMEOUT, HandlePool, PoolConfig, PoolError},
    util::retry::{RetryPolicy, retry},
};


/// Lifecycle of an [`ActivationScheduler`], published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Initializing,
    CycleRunning,
    Waiting,
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Initializing => "initializing",
            SchedulerState::CycleRunning => "cycle running",
            SchedulerState::Waiting => "waiting",
            SchedulerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Granularity of the inter-cycle sleep; bounds stop latency.
    pub poll_interval: Duration,

    /// Stop after this many cycles. `None` runs until stopped.
    pub max_cycles: Option<u32>,

    pub release_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_cycles: None,
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }
}

/// A successful activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub identity_id: u32,
    pub version: String,
    pub machine_code: String,
    pub cursor: (i32, i32),

    /// Ledger count for `machine_code` after this activation was booked.
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityFailure {
    pub identity_id: u32,
    pub kind: &'static str,
    pub message: String,
}

/// Outcome of one pass over the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub eligible: usize,
    pub succeeded: usize,

    /// Identities skipped because their machine code is at quota.
    pub exhausted: Vec<u32>,

    pub activations: Vec<Activation>,
    pub failures: Vec<IdentityFailure>,

    /// Catalog or ledger writes that failed after a successful activation.
    pub persistence_failures: usize,

    /// The cycle ended early because a stop was requested.
    pub cancelled: bool,
}

impl CycleReport {
    pub fn made_progress(&self) -> bool {
        self.succeeded > 0
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} succeeded", self.succeeded, self.eligible)
    }
}

pub struct ActivationScheduler {
    ctx: SchedulerContext,
    spoofer: Arc<dyn SpoofingService>,
    activation: Arc<dyn ActivationService>,
    options: SchedulerOptions,

    /// Created on first use so a run where nothing is eligible never loads
    /// an activation engine.
    pool: Option<Arc<HandlePool>>,

    /// Identity whose fingerprint is currently applied.
    live_identity: Option<u32>,

    /// Activations booked by this process, used when the quota is per run.
    run_counts: HashMap<String, u32>,

    shutdown: CancellationToken,
    state: watch::Sender<SchedulerState>,
    initialized: bool,
    cleaned_up: bool,
}

impl ActivationScheduler {
    pub fn new(
        ctx: SchedulerContext,
        spoofer: Arc<dyn SpoofingService>,
        activation: Arc<dyn ActivationService>,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);

        Self {
            ctx,
            spoofer,
            activation,
            options: SchedulerOptions::default(),
            pool: None,
            live_identity: None,
            run_counts: HashMap::new(),
            shutdown: CancellationToken::new(),
            state,
            initialized: false,
            cleaned_up: false,
        }
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    /// Use an externally owned token, e.g. one cancelled by a signal handler.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn live_identity(&self) -> Option<u32> {
        self.live_identity
    }

    pub fn pool(&self) -> Option<&Arc<HandlePool>> {
        self.pool.as_ref()
    }

    /// Request a stop. The current identity finishes; the loop exits at the
    /// next check.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("stop requested");
        }
        self.shutdown.cancel();
    }

    /// Load the spoofing engine and make sure the catalog has identities.
    /// Safe to call more than once.
    #[instrument(skip(self))]
    pub fn initialize(&mut self) -> Result<(), SchedulerError> {
        if self.initialized {
            return Ok(());
        }
        self.set_state(SchedulerState::Initializing);

        if let Err(e) = self.try_initialize() {
            error!(kind = e.kind(), error = %e, "initialization failed");
            self.set_state(SchedulerState::Stopped);
            return Err(e);
        }

        // The state stays `Initializing` until the first cycle starts.
        self.initialized = true;
        Ok(())
    }

    fn try_initialize(&self) -> Result<(), SchedulerError> {
        let spoofer = &self.spoofer;
        retry(self.retry_policy(), EngineError::is_transient, || {
            spoofer.init()
        })
        .map_err(SchedulerError::EngineInitFailed)?;
        info!("spoofing engine initialized");

        if self.ctx.catalog.is_empty() {
            let count = self.ctx.config.identity_count as usize;
            info!(count, "identity catalog is empty, generating identities");
            self.ctx
                .catalog
                .generate(count)
                .map_err(|source| SchedulerError::PersistenceFailed {
                    what: "identity catalog",
                    source,
                })?;
        }

        info!(
            identities = self.ctx.catalog.len(),
            ledger = %self.ctx.ledger.summary(),
            "loaded identities"
        );
        Ok(())
    }

    /// Split the catalog into identities to process this cycle and the ids
    /// of those whose machine code already reached its quota.
    pub fn eligible_identities(&self) -> (Vec<Identity>, Vec<u32>) {
        let cap = self.ctx.config.max_activations_per_code;
        let mut eligible = Vec::new();
        let mut exhausted = Vec::new();

        for identity in self.ctx.catalog.list() {
            let Some(code) = identity.machine_code.as_deref() else {
                eligible.push(identity);
                continue;
            };

            let count = self.count_for(code);
            if count < cap {
                eligible.push(identity);
            } else {
                info!(
                    identity_id = identity.id,
                    machine_code = %short_code(code),
                    count,
                    cap,
                    "machine code reached its activation quota, skipping"
                );
                exhausted.push(identity.id);
            }
        }

        (eligible, exhausted)
    }

    /// One pass over the eligible identities. Per-identity failures are
    /// logged and recorded in the report; they never abort the cycle.
    #[instrument(skip(self))]
    pub fn run_cycle(&mut self) -> CycleReport {
        self.set_state(SchedulerState::CycleRunning);
        info!("starting activation cycle");

        let (eligible, exhausted) = self.eligible_identities();
        let mut report = CycleReport {
            eligible: eligible.len(),
            exhausted,
            ..Default::default()
        };

        if eligible.is_empty() {
            info!("every machine code has reached its quota, nothing to do");
            return report;
        }

        let total = eligible.len();
        for (index, identity) in eligible.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                info!("stop requested, ending cycle early");
                report.cancelled = true;
                break;
            }

            info!(identity_id = identity.id, "processing identity {}/{total}", index + 1);

            match self.process_identity(identity) {
                Ok(mut activation) => {
                    report.persistence_failures += self.book(&mut activation);
                    report.succeeded += 1;
                    report.activations.push(activation);
                }
                Err(e) => {
                    warn!(
                        identity_id = identity.id,
                        kind = e.kind(),
                        error = %e,
                        "skipping identity"
                    );
                    report.failures.push(IdentityFailure {
                        identity_id: identity.id,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            succeeded = report.succeeded,
            eligible = report.eligible,
            "cycle finished: {report}"
        );
        report
    }

    /// Make `identity` live if it is not already, then activate once on a
    /// pooled handle.
    fn process_identity(&mut self, identity: &Identity) -> Result<Activation, SchedulerError> {
        let identity_id = identity.id;
        let policy = self.retry_policy();

        if self.live_identity != Some(identity_id) {
            let spoofer = &self.spoofer;
            retry(policy, EngineError::is_transient, || {
                spoofer.apply_identity(identity)
            })
            .map_err(|source| {
                // A partial apply leaves no identity we can vouch for.
                self.live_identity = None;
                SchedulerError::IdentityApplyFailed {
                    identity_id,
                    source,
                }
            })?;

            self.live_identity = Some(identity_id);
            if let Some(pool) = &self.pool {
                let destroyed = pool.invalidate_all();
                debug!(identity_id, destroyed, "invalidated handles after identity switch");
            }
            info!(identity_id, "identity applied");
        }

        let pool = self.ensure_pool();
        let timeout = self.ctx.config.acquire_timeout();
        let mut handle = retry(policy, is_transient_pool_error, || pool.acquire(timeout))
            .map_err(|source| SchedulerError::HandleUnavailable {
                identity_id,
                source,
            })?;

        let call = |source: EngineError| SchedulerError::EngineCall {
            identity_id,
            source,
        };

        let config = &self.ctx.config;
        let reply = handle
            .activate(&config.license_code, &config.additional_code)
            .map_err(call)?;
        if !reply.is_success() {
            return Err(SchedulerError::ActivationFailed {
                identity_id,
                status: reply.status,
                message: reply.message,
            });
        }

        let version = handle.version().map_err(call)?;
        let machine_code = handle.machine_code().map_err(call)?;
        let cursor = handle.cursor_position().map_err(call)?;
        handle.release();

        info!(
            identity_id,
            version = %version,
            machine_code = %short_code(&machine_code),
            cursor_x = cursor.0,
            cursor_y = cursor.1,
            "activation succeeded"
        );

        Ok(Activation {
            identity_id,
            version,
            machine_code,
            cursor,
            count: 0,
        })
    }

    /// Record a successful activation in the ledger and the catalog. Returns
    /// the number of writes that failed.
    fn book(&mut self, activation: &mut Activation) -> usize {
        let cap = self.ctx.config.max_activations_per_code;
        let identity_id = activation.identity_id;
        let code = activation.machine_code.clone();
        let mut failures = 0;

        if self.count_for(&code) >= cap {
            warn!(
                identity_id,
                machine_code = %short_code(&code),
                cap,
                "machine code is already at quota, not counting this activation"
            );
            activation.count = self.ctx.ledger.count(&code);
        } else {
            *self.run_counts.entry(code.clone()).or_default() += 1;

            match self.ctx.ledger.record(&code, identity_id, cap) {
                Ok(Recorded::Incremented(count) | Recorded::AtCap(count)) => {
                    activation.count = count;
                }
                Err(source) => {
                    activation.count = self.ctx.ledger.count(&code);
                    report_persistence(SchedulerError::PersistenceFailed {
                        what: "progress ledger",
                        source,
                    });
                    failures += 1;
                }
            }
        }

        match self.ctx.catalog.set_machine_code(identity_id, &code) {
            Ok(true) => {}
            Ok(false) => warn!(identity_id, "identity left the catalog before its machine code was saved"),
            Err(source) => {
                report_persistence(SchedulerError::PersistenceFailed {
                    what: "identity catalog",
                    source,
                });
                failures += 1;
            }
        }

        info!(
            identity_id,
            machine_code = %short_code(&code),
            count = activation.count,
            cap,
            "activation booked"
        );
        failures
    }

    /// Initialize, then run cycles until stopped or `max_cycles` is reached.
    #[instrument(skip(self))]
    pub fn run(&mut self) -> Result<(), SchedulerError> {
        self.initialize()?;

        let mut cycles = 0u32;
        while !self.shutdown.is_cancelled() {
            let report = self.run_cycle();
            cycles += 1;

            if !report.made_progress() {
                debug!(cycles, "cycle made no progress");
            }

            let done = self.options.max_cycles.is_some_and(|max| cycles >= max);
            if done || self.shutdown.is_cancelled() {
                break;
            }

            self.set_state(SchedulerState::Waiting);
            let interval = self.ctx.config.interval();
            let next = chrono::Local::now()
                + chrono::Duration::minutes(i64::from(self.ctx.config.interval_minutes));
            info!(
                minutes = self.ctx.config.interval_minutes,
                next_cycle = %next.format("%H:%M:%S"),
                "waiting for next cycle"
            );
            if !self.wait(interval) {
                break;
            }
        }

        self.set_state(SchedulerState::Stopped);
        info!(cycles, "activation loop stopped");
        Ok(())
    }

    /// Release the handle pool and the spoofing engine. Idempotent.
    pub fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        if self.initialized {
            self.spoofer.cleanup();
        }
        self.live_identity = None;
        self.set_state(SchedulerState::Stopped);
        info!("scheduler resources released");
    }

    /// Sleep for `interval` in `poll_interval` slices. Returns `false` if a
    /// stop interrupted the wait.
    fn wait(&self, interval: Duration) -> bool {
        let deadline = Instant::now() + interval;
        let slice = self.options.poll_interval.max(Duration::from_millis(1));

        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }

    fn ensure_pool(&mut self) -> Arc<HandlePool> {
        let activation = &self.activation;
        let config = PoolConfig {
            size: self.ctx.config.pool_size,
            release_timeout: self.options.release_timeout,
        };

        self.pool
            .get_or_insert_with(|| HandlePool::new(activation.clone(), config))
            .clone()
    }

    fn count_for(&self, machine_code: &str) -> u32 {
        if self.ctx.config.reset_quota_on_start {
            self.run_counts.get(machine_code).copied().unwrap_or(0)
        } else {
            self.ctx.ledger.count(machine_code)
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.ctx.config.retry_attempts,
            self.ctx.config.retry_base_delay(),
        )
    }

    fn set_state(&self, state: SchedulerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "scheduler state changed");
        }
    }
}

impl Drop for ActivationScheduler {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn is_transient_pool_error(e: &PoolError) -> bool {
    matches!(e, PoolError::Create(source) if source.is_transient())
}

fn report_persistence(e: SchedulerError) {
    error!(kind = e.kind(), error = %e, "failed to persist activation");
}
