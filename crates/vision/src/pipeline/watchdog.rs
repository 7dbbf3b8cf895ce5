//! Watchdog for the two failure modes cooperative scheduling cannot bound on
//! its own: a background task that never reaches a checkpoint, and a host that
//! stops driving ticks or render opportunities.
//!
//! Runaway tasks get their token cancelled once they exceed the task budget.
//! Stalled heartbeats are reported, not acted on; the host owns its cadence.

use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{error, info, warn};

use crate::pipeline::{task_queue::ThrottledTaskQueue, telemetry};

/// Sleep interval between watchdog health checks.
pub const WATCHDOG_POLL_INTERVAL_MS: u64 = 250;
/// Time without a heartbeat before a component is considered stalled.
pub const WATCHDOG_STALE_THRESHOLD_MS: u64 = 1_500;
/// Grace period at startup allowing components to warm up before monitoring.
pub const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Logical components monitored by the watchdog.
pub enum HealthComponent {
    /// Frames arriving from the source.
    Capture,
    /// Render opportunities from the host.
    Render,
    /// Background task that overran its budget.
    Task,
}

impl HealthComponent {
    /// Human readable label used in log messages and metrics.
    pub fn label(self) -> &'static str {
        match self {
            HealthComponent::Capture => "capture",
            HealthComponent::Render => "render",
            HealthComponent::Task => "task",
        }
    }
}

pub struct PipelineHealth {
    capture: AtomicU64,
    render: AtomicU64,
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHealth {
    /// Initialise the health tracker with grace periods for each component.
    pub fn new() -> Self {
        let grace_deadline = current_millis().saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            capture: AtomicU64::new(grace_deadline),
            render: AtomicU64::new(grace_deadline),
        }
    }

    /// Register a heartbeat for the supplied component.
    pub fn beat(&self, component: HealthComponent) {
        let now = current_millis();
        match component {
            HealthComponent::Capture => self.capture.store(now, Ordering::Relaxed),
            HealthComponent::Render => self.render.store(now, Ordering::Relaxed),
            HealthComponent::Task => {}
        }
    }

    /// Returns the first component that has not produced a heartbeat recently.
    pub fn stale_component(&self, now: u64) -> Option<HealthComponent> {
        if now.saturating_sub(self.capture.load(Ordering::Relaxed)) > WATCHDOG_STALE_THRESHOLD_MS {
            return Some(HealthComponent::Capture);
        }
        if now.saturating_sub(self.render.load(Ordering::Relaxed)) > WATCHDOG_STALE_THRESHOLD_MS {
            return Some(HealthComponent::Render);
        }
        None
    }
}

/// Trip history shared with the supervisor.
pub struct WatchdogState {
    trips: AtomicU64,
    last: Mutex<Option<HealthComponent>>,
}

impl Default for WatchdogState {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchdogState {
    pub fn new() -> Self {
        Self {
            trips: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    /// Record a trip caused by `component`.
    pub fn trip(&self, component: HealthComponent) {
        if let Ok(mut guard) = self.last.lock() {
            *guard = Some(component);
        }
        self.trips.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("vision_watchdog_trips_total", "component" => component.label())
            .increment(1);
    }

    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::SeqCst)
    }

    /// Component behind the most recent trip, if any.
    pub fn last_reason(&self) -> Option<HealthComponent> {
        match self.last.lock() {
            Ok(guard) => *guard,
            Err(_) => None,
        }
    }
}

/// Cancel the in-flight task when it has run longer than `budget`.
///
/// Returns `true` if a task was cancelled by this check.
pub fn enforce_task_budget(
    queue: &ThrottledTaskQueue,
    budget: Duration,
    state: &WatchdogState,
) -> bool {
    let Some(task) = queue.in_flight() else {
        return false;
    };
    if task.elapsed <= budget || task.token.is_cancelled() {
        return false;
    }
    error!(
        "Watchdog cancelling task #{} after {:?} (budget {:?})",
        task.id, task.elapsed, budget
    );
    task.token.cancel();
    state.trip(HealthComponent::Task);
    true
}

/// Spawn the watchdog thread.
pub fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    queue: Arc<ThrottledTaskQueue>,
    task_budget: Duration,
    shutdown: Arc<AtomicBool>,
    state: Arc<WatchdogState>,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("vision-watchdog", move || {
        let mut stalled: Option<HealthComponent> = None;
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
            enforce_task_budget(&queue, task_budget, &state);

            match (health.stale_component(current_millis()), stalled) {
                (Some(component), previous) if previous != Some(component) => {
                    warn!("Watchdog detected stalled {} stage", component.label());
                    state.trip(component);
                    stalled = Some(component);
                }
                (None, Some(component)) => {
                    info!("{} stage recovered", component.label());
                    stalled = None;
                }
                _ => {}
            }
        }
    })
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
