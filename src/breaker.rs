// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::fmt::Result as FmtResult;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;

// Default thresholds for the lazy breaker.
const DEFAULT_VOLUME_THRESHOLD: u64 = 20;
const DEFAULT_ERROR_PERCENTAGE: u8 = 50;
const DEFAULT_SLEEP_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_ROLLING_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_CANARY_TIMEOUT: Duration = Duration::from_secs(5);

/// Classifies a completion as success or failure for breaker accounting.
pub type CompletionJudge = Arc<dyn Fn(Option<&Error>) -> bool + Send + Sync>;

/// Invoked when an open breaker is ready to probe its connection. The
/// callback must not block; the pipeline client's implementation hands the
/// probe to a short-lived thread.
pub type CanaryFn = Box<dyn Fn() + Send + Sync>;

/// Configuration for the per-connection circuit breakers.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// When false, connections use a no-op breaker that admits everything.
    pub enabled: bool,
    /// Minimum completions within the rolling window before the error rate
    /// is considered meaningful.
    pub volume_threshold: u64,
    /// Failure percentage at or above which the breaker opens.
    pub error_threshold_percentage: u8,
    /// How long an open breaker waits before probing with a canary.
    pub sleep_window: Duration,
    /// Width of the completion-accounting window.
    pub rolling_window: Duration,
    /// How long a canary probe may take before it is counted as a failure.
    pub canary_timeout: Duration,
    /// Optional override for success/failure classification. The default
    /// counts any error as a failure.
    pub completion_judge: Option<CompletionJudge>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            enabled: true,
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            error_threshold_percentage: DEFAULT_ERROR_PERCENTAGE,
            sleep_window: DEFAULT_SLEEP_WINDOW,
            rolling_window: DEFAULT_ROLLING_WINDOW,
            canary_timeout: DEFAULT_CANARY_TIMEOUT,
            completion_judge: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> FmtResult {
        f.debug_struct("CircuitBreakerConfig")
            .field("enabled", &self.enabled)
            .field("volume_threshold", &self.volume_threshold)
            .field(
                "error_threshold_percentage",
                &self.error_threshold_percentage,
            )
            .field("sleep_window", &self.sleep_window)
            .field("rolling_window", &self.rolling_window)
            .field("canary_timeout", &self.canary_timeout)
            .finish()
    }
}

/// Per-connection health gate.
///
/// The breaker both admits outbound sends (`allows_request`) and observes
/// completions through a hook the pipeline client installs on each request,
/// so application-level retries interact correctly with its accounting.
pub trait CircuitBreaker: Send + Sync {
    fn allows_request(&self) -> bool;
    fn mark_successful(&self);
    fn mark_failure(&self);
    /// True when the completion should count as a success.
    fn completion_callback(&self, err: Option<&Error>) -> bool;
    fn reset(&self);
    fn canary_timeout(&self) -> Duration;
}

/// The breaker used when breaking is disabled: everything is admitted and
/// nothing is recorded.
pub struct NoopCircuitBreaker;

impl CircuitBreaker for NoopCircuitBreaker {
    fn allows_request(&self) -> bool {
        true
    }

    fn mark_successful(&self) {}

    fn mark_failure(&self) {}

    fn completion_callback(&self, _err: Option<&Error>) -> bool {
        true
    }

    fn reset(&self) {}

    fn canary_timeout(&self) -> Duration {
        Duration::ZERO
    }
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

struct Window {
    started: Instant,
    total: u64,
    failed: u64,
}

impl Window {
    fn fresh() -> Self {
        Window {
            started: Instant::now(),
            total: 0,
            failed: 0,
        }
    }
}

/// A lazily-probing breaker.
///
/// Closed until the failure rate over the rolling window crosses the
/// configured threshold, then open. After the sleep window the first
/// admission check flips it to half-open and fires the canary callback; the
/// canary's outcome either closes the breaker or re-opens it for another
/// sleep window. Exactly one state transition happens per canary.
pub struct LazyCircuitBreaker {
    state: AtomicU8,
    window: Mutex<Window>,
    opened_at: Mutex<Instant>,
    volume_threshold: u64,
    error_threshold_percentage: u8,
    sleep_window: Duration,
    rolling_window: Duration,
    canary_timeout: Duration,
    judge: CompletionJudge,
    canary: CanaryFn,
}

impl LazyCircuitBreaker {
    pub fn new(cfg: &CircuitBreakerConfig, canary: CanaryFn) -> Self {
        let judge = cfg
            .completion_judge
            .clone()
            .unwrap_or_else(|| Arc::new(|err: Option<&Error>| err.is_none()));
        LazyCircuitBreaker {
            state: AtomicU8::new(STATE_CLOSED),
            window: Mutex::new(Window::fresh()),
            opened_at: Mutex::new(Instant::now()),
            volume_threshold: cfg.volume_threshold,
            error_threshold_percentage: cfg.error_threshold_percentage,
            sleep_window: cfg.sleep_window,
            rolling_window: cfg.rolling_window,
            canary_timeout: cfg.canary_timeout,
            judge,
            canary,
        }
    }

    fn maybe_rotate(&self, window: &mut Window) {
        if window.started.elapsed() > self.rolling_window {
            *window = Window::fresh();
        }
    }

    fn open(&self, from: u8) -> bool {
        if self
            .state
            .compare_exchange(from, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.opened_at.lock().unwrap() = Instant::now();
            true
        } else {
            false
        }
    }
}

impl CircuitBreaker for LazyCircuitBreaker {
    fn allows_request(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => true,
            STATE_OPEN => {
                let slept = self.opened_at.lock().unwrap().elapsed() >= self.sleep_window;
                if slept
                    && self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    (self.canary)();
                }
                false
            }
            _ => false,
        }
    }

    fn mark_successful(&self) {
        if self
            .state
            .compare_exchange(
                STATE_HALF_OPEN,
                STATE_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.reset();
            return;
        }
        let mut window = self.window.lock().unwrap();
        self.maybe_rotate(&mut window);
        window.total += 1;
    }

    fn mark_failure(&self) {
        // A failed canary re-opens for another sleep window.
        if self.open(STATE_HALF_OPEN) {
            return;
        }
        let mut window = self.window.lock().unwrap();
        self.maybe_rotate(&mut window);
        window.total += 1;
        window.failed += 1;
        if window.total > 0
            && window.total >= self.volume_threshold
            && window.failed * 100 / window.total >= u64::from(self.error_threshold_percentage)
        {
            self.open(STATE_CLOSED);
        }
    }

    fn completion_callback(&self, err: Option<&Error>) -> bool {
        (self.judge)(err)
    }

    fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        *self.window.lock().unwrap() = Window::fresh();
    }

    fn canary_timeout(&self) -> Duration {
        self.canary_timeout
    }
}
