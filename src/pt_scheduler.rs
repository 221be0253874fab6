// Execution scheduler
//
// Participants are statically partitioned over a number of execution contexts.
// Each context is one thread that owns its participants outright, processes
// their pending events and fires their periodic timers. Within a context work
// is strictly sequential; contexts run in parallel with no ordering between
// them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::pt_interface::Transport;

/// Sleep between passes of a context that found nothing to do.
const IDLE_BACKOFF: Duration = Duration::from_micros(50);

/// What an execution context needs from the units it drives.
pub trait Schedulable: Send {
    /// Period of the self-triggered action, `None` for purely event-driven units.
    fn period(&self) -> Option<Duration>;

    /// Whether pending events are dispatched on every pass rather than only
    /// from within `tick`.
    fn event_driven(&self) -> bool;

    /// Process one pending event. Returns false when there was nothing to do.
    fn dispatch_one(&mut self, transport: &dyn Transport) -> bool;

    /// Periodic action. Failures are the unit's own business and must not
    /// escape into the context.
    fn tick(&mut self, transport: &dyn Transport);
}

// ============================================================================
// Periodic timer
// ============================================================================

/// Drift-free periodic timer anchored at a fixed start instant.
///
/// Expiration `k` is due at `start + k * period`. When a context falls behind
/// by several periods the timer fires once and skips the missed expirations.
#[derive(Debug, Clone)]
pub struct PeriodicTimer {
    start: Instant,
    period: Duration,
    expirations: u128,
    fired: u64,
}

impl PeriodicTimer {
    pub fn new(start: Instant, period: Duration) -> Self {
        Self {
            start,
            period,
            expirations: 0,
            fired: 0,
        }
    }

    /// Returns true at most once per elapsed period.
    pub fn poll(&mut self, now: Instant) -> bool {
        let period_ns = self.period.as_nanos().max(1);
        let expirations = now.saturating_duration_since(self.start).as_nanos() / period_ns;

        if expirations > self.expirations {
            self.expirations = expirations;
            self.fired += 1;
            true
        } else {
            false
        }
    }

    pub fn next_deadline(&self) -> Instant {
        let next = (self.expirations + 1).min(u32::MAX as u128) as u32;
        self.start + self.period * next
    }

    pub fn fired(&self) -> u64 {
        self.fired
    }
}

// ============================================================================
// Execution context
// ============================================================================

struct Unit<P> {
    index: usize,
    participant: P,
    timer: Option<PeriodicTimer>,
}

struct ExecutionContext<P> {
    id: usize,
    units: Vec<Unit<P>>,
    ticking: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
}

impl<P: Schedulable> ExecutionContext<P> {
    fn run(mut self) -> Vec<(usize, P)> {
        debug!("context {} started with {} unit(s)", self.id, self.units.len());

        while self.running.load(Ordering::Acquire) {
            let did_work = self.spin_once(Instant::now());

            if !did_work {
                let now = Instant::now();
                let backoff = self
                    .next_deadline()
                    .map(|d| d.saturating_duration_since(now).min(IDLE_BACKOFF))
                    .unwrap_or(IDLE_BACKOFF);
                thread::sleep(backoff);
            }
        }

        debug!("context {} stopped", self.id);
        self.units
            .into_iter()
            .map(|unit| (unit.index, unit.participant))
            .collect()
    }

    /// One pass over every unit. Returns whether anything was processed.
    fn spin_once(&mut self, now: Instant) -> bool {
        let ticking = self.ticking.load(Ordering::Acquire);
        let transport = self.transport.as_ref();
        let mut did_work = false;

        for unit in &mut self.units {
            if ticking {
                if let Some(timer) = unit.timer.as_mut() {
                    if timer.poll(now) {
                        unit.participant.tick(transport);
                        did_work = true;
                    }
                }
            }

            // after stop every unit drains, so in-flight exchanges can finish
            if unit.participant.event_driven() || !ticking {
                while unit.participant.dispatch_one(transport) {
                    did_work = true;
                }
            }
        }

        did_work
    }

    fn next_deadline(&self) -> Option<Instant> {
        if !self.ticking.load(Ordering::Acquire) {
            return None;
        }
        self.units
            .iter()
            .filter_map(|u| u.timer.as_ref().map(|t| t.next_deadline()))
            .min()
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Assigns participants to execution contexts and drives them.
///
/// `contexts == 0` gives every participant its own context; `n >= 1`
/// partitions participants round-robin over `min(n, participants)` shared
/// contexts.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionScheduler {
    contexts: usize,
}

impl ExecutionScheduler {
    pub fn new(contexts: usize) -> Self {
        Self { contexts }
    }

    /// Static partition of participant indices over execution contexts.
    pub fn partition(&self, participants: usize) -> Vec<Vec<usize>> {
        let buckets = if self.contexts == 0 {
            participants
        } else {
            self.contexts.min(participants)
        };

        let mut partition: Vec<Vec<usize>> = vec![Vec::new(); buckets];
        for index in 0..participants {
            partition[index % buckets].push(index);
        }
        partition
    }

    /// Start all contexts in the background. Timers are anchored at the
    /// moment of this call.
    pub fn start<P>(&self, participants: Vec<P>, transport: Arc<dyn Transport>) -> SchedulerHandle<P>
    where
        P: Schedulable + 'static,
    {
        let started_at = Instant::now();
        let ticking = Arc::new(AtomicBool::new(true));
        let running = Arc::new(AtomicBool::new(true));
        let total = participants.len();

        let partition = self.partition(total);
        let mut slots: Vec<Option<P>> = participants.into_iter().map(Some).collect();

        let mut threads = Vec::with_capacity(partition.len());
        for (id, indices) in partition.into_iter().enumerate() {
            let units = indices
                .into_iter()
                .filter_map(|index| {
                    slots[index].take().map(|participant| {
                        let timer = participant
                            .period()
                            .map(|period| PeriodicTimer::new(started_at, period));
                        Unit {
                            index,
                            participant,
                            timer,
                        }
                    })
                })
                .collect();

            let context = ExecutionContext {
                id,
                units,
                ticking: ticking.clone(),
                running: running.clone(),
                transport: transport.clone(),
            };

            let spawned = thread::Builder::new()
                .name(format!("pt-context-{}", id))
                .spawn(move || context.run());

            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => error!("failed to spawn execution context {}: {}", id, e),
            }
        }

        SchedulerHandle {
            ticking,
            running,
            threads,
            total,
            started_at,
        }
    }

    /// Blocking convenience: run for `duration`, stop ticking, keep draining
    /// for `grace`, then tear down and hand the participants back in their
    /// original order.
    pub fn spin<P>(
        &self,
        participants: Vec<P>,
        transport: Arc<dyn Transport>,
        duration: Duration,
        grace: Duration,
    ) -> Vec<P>
    where
        P: Schedulable + 'static,
    {
        let handle = self.start(participants, transport);
        sleep_until(handle.started_at() + duration);
        handle.stop_ticking();
        thread::sleep(grace);
        handle.shutdown()
    }
}

/// Cancellable handle to running execution contexts.
///
/// Dropping the handle without `shutdown` still stops the contexts, but the
/// participants they own are lost.
pub struct SchedulerHandle<P> {
    ticking: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<Vec<(usize, P)>>>,
    total: usize,
    started_at: Instant,
}

impl<P> SchedulerHandle<P> {
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn is_ticking(&self) -> bool {
        self.ticking.load(Ordering::Acquire)
    }

    /// Stop all periodic actions. Contexts keep dispatching events.
    pub fn stop_ticking(&self) {
        self.ticking.store(false, Ordering::Release);
    }

    /// Tear down every context and return the participants in the order
    /// they were handed to `start`.
    pub fn shutdown(mut self) -> Vec<P> {
        self.ticking.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);

        let mut returned: Vec<(usize, P)> = Vec::with_capacity(self.total);
        for handle in std::mem::take(&mut self.threads) {
            match handle.join() {
                Ok(units) => returned.extend(units),
                Err(_) => error!("execution context panicked, its participants are lost"),
            }
        }

        returned.sort_by_key(|(index, _)| *index);
        returned.into_iter().map(|(_, p)| p).collect()
    }
}

impl<P> Drop for SchedulerHandle<P> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Sleep on the monotonic clock until `deadline`, tolerating early wakeups.
pub fn sleep_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(deadline - now);
    }
}
