//! Lifecycle of scenarios: when impairments are applied, for how long, and by whom
//!
//! Persistent scenarios are applied as soon as they are added. Transient scenarios start at the
//! occurrences of their schedule (or when triggered manually) and end once their duration has
//! elapsed.
//!
//! All scheduler state lives behind a single lock. Driver work never happens while holding it:
//! an activation is reserved under the lock, performed without it, and committed under the lock
//! again. Every scenario entry carries a generation number that changes when the scenario is
//! removed, which lets a late activation notice it has been superseded and undo its impairment.
//!
//! Driver work for a scenario id (activating, ending, undoing, removing) is serialized by a lock
//! that outlives the entry, so undoing a superseded activation always reaches the driver before
//! a newer activation of the same id.

mod timer;

use crate::event::{Event, EventKind, EventLog, Severity};
use crate::impairment::{ApplicationReport, ImpairmentEngine};
use crate::scenario::schedule::{Schedule, SchedulingError};
use crate::scenario::target::Target;
use crate::scenario::{ImpairmentSpec, ScenarioKind, ScenarioSpec};
use crate::scheduler::timer::{Clock, TimerAction, TimerId, TimerQueue};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScenarioState {
    /// Known to the scheduler, but not scheduled
    Registered,
    /// Waiting for the next occurrence of its schedule
    Scheduled,
    /// A transient scenario whose impairment is in place
    Active,
    /// A persistent scenario whose impairment is in place
    Applied,
    Failed,
    Removed,
}

impl Display for ScenarioState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            ScenarioState::Registered => "registered",
            ScenarioState::Scheduled => "scheduled",
            ScenarioState::Active => "active",
            ScenarioState::Applied => "applied",
            ScenarioState::Failed => "failed",
            ScenarioState::Removed => "removed",
        };
        f.write_str(state)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActiveScenarioInstance {
    pub scenario_id: Arc<str>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerOutcome {
    Activated(ActiveScenarioInstance),
    /// The scenario was active (or being activated) already; nothing was done
    AlreadyActive,
    /// The impairment could not be applied
    Failed,
    /// The scenario was removed while it was being activated
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("scenario `{0}` is already registered")]
    DuplicateScenario(Arc<str>),
    #[error("unknown scenario `{0}`")]
    UnknownScenario(Arc<str>),
    #[error("scenario `{0}` is persistent and cannot be triggered")]
    NotTransient(Arc<str>),
    #[error("scenario `{id}` cannot be activated: {source}")]
    Scheduling {
        id: Arc<str>,
        #[source]
        source: SchedulingError,
    },
    #[error("the scheduler has been shut down")]
    ShutDown,
}

/// A summary line of [`ScenarioScheduler::status`]
#[derive(Clone, Debug, Serialize)]
pub struct ScenarioStatus {
    pub id: Arc<str>,
    pub kind: ScenarioKind,
    pub state: ScenarioState,
    pub next_start: Option<DateTime<Utc>>,
    pub active: Option<ActiveScenarioInstance>,
}

struct ScenarioEntry {
    spec: Arc<ScenarioSpec>,
    /// `None` when the target could not be parsed, which leaves the scenario failed
    target: Option<Target>,
    impairment: Arc<ImpairmentSpec>,
    schedule: Option<Arc<Schedule>>,
    duration: Result<Duration, SchedulingError>,
    state: ScenarioState,
    generation: u64,
    /// An activation has been reserved and is in flight
    activating: bool,
    start_timer: Option<(TimerId, DateTime<Utc>)>,
    end_timer: Option<TimerId>,
    active: Option<ActiveScenarioInstance>,
}

impl ScenarioEntry {
    /// Where a transient scenario goes once it stops being active
    fn idle_state(&self) -> ScenarioState {
        if self.start_timer.is_some() {
            ScenarioState::Scheduled
        } else {
            ScenarioState::Registered
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    entries: HashMap<Arc<str>, ScenarioEntry>,
    /// Registration order, for status reports
    order: Vec<Arc<str>>,
    timers: TimerQueue,
    next_generation: u64,
    shut_down: bool,
    /// Kept per id rather than per entry, since a removed id can be added again
    driver_locks: HashMap<Arc<str>, Arc<AsyncMutex<()>>>,
}

impl SchedulerState {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn arm_start(&mut self, clock: &Clock, id: &Arc<str>, occurrence: DateTime<Utc>) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };

        let timer = self.timers.arm(
            clock.instant_at(occurrence),
            TimerAction::Start {
                scenario: id.clone(),
                occurrence,
            },
        );
        entry.start_timer = Some((timer, occurrence));
        if entry.state == ScenarioState::Registered {
            entry.state = ScenarioState::Scheduled;
        }
    }

    fn cancel_timers(&mut self, id: &Arc<str>) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };

        if let Some((timer, _)) = entry.start_timer.take() {
            self.timers.cancel(timer);
        }
        if let Some(timer) = entry.end_timer.take() {
            self.timers.cancel(timer);
        }
    }
}

struct SchedulerInner {
    engine: Arc<ImpairmentEngine>,
    events: EventLog,
    clock: Clock,
    state: Mutex<SchedulerState>,
    timers_changed: Notify,
}

/// Everything an activation needs, captured while reserving it
struct Reservation {
    target: Target,
    impairment: Arc<ImpairmentSpec>,
    generation: u64,
    kind: ScenarioKind,
    duration: Duration,
}

pub struct ScenarioScheduler {
    inner: Arc<SchedulerInner>,
    cancel: CancellationToken,
    timer_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ScenarioScheduler {
    pub fn new(engine: Arc<ImpairmentEngine>, events: EventLog) -> Self {
        Self::with_clock_origin(engine, events, Utc::now())
    }

    /// Creates a scheduler whose wall clock reads `origin` right now
    pub fn with_clock_origin(
        engine: Arc<ImpairmentEngine>,
        events: EventLog,
        origin: DateTime<Utc>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                engine,
                events,
                clock: Clock::starting_at(origin),
                state: Mutex::new(SchedulerState::default()),
                timers_changed: Notify::new(),
            }),
            cancel: CancellationToken::new(),
            timer_loop: Mutex::new(None),
        }
    }

    /// Starts firing timers; scenarios added before this call keep their place in the schedule
    pub fn start(&self) {
        let mut timer_loop = self.timer_loop.lock();
        if timer_loop.is_none() {
            *timer_loop = Some(tokio::spawn(run_timer_loop(
                Arc::downgrade(&self.inner),
                self.cancel.clone(),
            )));
        }
    }

    /// The scheduler's current wall-clock time
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Registers a scenario and returns the state it ended up in
    ///
    /// Persistent scenarios are applied right away. Problems that only concern this scenario
    /// (an unresolvable target, a malformed schedule, a driver failure) are reported as events
    /// and reflected in the returned state, not as errors.
    pub async fn add_scenario(&self, spec: ScenarioSpec) -> Result<ScenarioState, SchedulerError> {
        self.inner.add_scenario(spec).await
    }

    pub async fn add_scenarios(
        &self,
        specs: impl IntoIterator<Item = ScenarioSpec>,
    ) -> Vec<(Arc<str>, Result<ScenarioState, SchedulerError>)> {
        let mut results = Vec::new();
        for spec in specs {
            let id = spec.id.clone();
            results.push((id, self.add_scenario(spec).await));
        }

        results
    }

    /// Activates a transient scenario now, regardless of its schedule
    pub async fn trigger(&self, id: &str) -> Result<TriggerOutcome, SchedulerError> {
        self.inner.activate(Arc::from(id), true).await
    }

    pub async fn remove_scenario(&self, id: &str) -> Result<(), SchedulerError> {
        self.inner.remove(Arc::from(id)).await
    }

    pub fn state(&self, id: &str) -> Option<ScenarioState> {
        self.inner.state.lock().entries.get(id).map(|e| e.state)
    }

    pub fn active_instance(&self, id: &str) -> Option<ActiveScenarioInstance> {
        self.inner
            .state
            .lock()
            .entries
            .get(id)
            .and_then(|e| e.active.clone())
    }

    pub fn active_instances(&self) -> Vec<ActiveScenarioInstance> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .filter_map(|e| e.active.clone())
            .collect()
    }

    pub fn status(&self) -> Vec<ScenarioStatus> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|e| ScenarioStatus {
                id: e.spec.id.clone(),
                kind: e.spec.kind,
                state: e.state,
                next_start: e.start_timer.map(|(_, occurrence)| occurrence),
                active: e.active.clone(),
            })
            .collect()
    }

    /// Clears every impairment the scheduler put in place, removes all scenarios and stops the
    /// timers
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
        self.cancel.cancel();

        let timer_loop = self.timer_loop.lock().take();
        if let Some(timer_loop) = timer_loop {
            // The loop exits as soon as it sees the cancellation
            let _ = timer_loop.await;
        }
    }
}

impl Drop for ScenarioScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl SchedulerInner {
    fn record(&self, event: Event) {
        self.events.record(event);
    }

    fn driver_lock(&self, id: &Arc<str>) -> Arc<AsyncMutex<()>> {
        self.state
            .lock()
            .driver_locks
            .entry(id.clone())
            .or_default()
            .clone()
    }

    async fn add_scenario(self: &Arc<Self>, spec: ScenarioSpec) -> Result<ScenarioState, SchedulerError> {
        let spec = Arc::new(spec);
        let id = spec.id.clone();
        let target = spec.target();
        let duration = spec.active_duration();

        let mut scheduling_error = None;
        let mut schedule = None;
        if spec.kind == ScenarioKind::Transient {
            match spec.schedule.as_deref().map(str::parse::<Schedule>) {
                Some(Ok(parsed)) => schedule = Some(Arc::new(parsed)),
                Some(Err(e)) => scheduling_error = Some(e),
                None => {}
            }
            if scheduling_error.is_none() {
                scheduling_error = duration.as_ref().err().cloned();
            }
            if scheduling_error.is_none() && schedule.is_none() {
                scheduling_error = Some(SchedulingError::MissingSchedule(id.clone()));
            }
        }

        // A scenario whose duration is unusable is never scheduled
        let schedule = schedule.filter(|_| duration.is_ok());

        // Evaluated before taking the lock, since a rule may take a while to evaluate
        let first_start = match (&schedule, &target) {
            (Some(schedule), Ok(_)) => {
                let first_start = schedule.next_after(self.clock.now());
                if first_start.is_none() {
                    scheduling_error = spec.schedule.clone().map(SchedulingError::Exhausted);
                }
                first_start
            }
            _ => None,
        };

        let added_state = {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(SchedulerError::ShutDown);
            }
            let replaces_removed = match state.entries.get(&id) {
                Some(existing) if existing.state != ScenarioState::Removed => {
                    return Err(SchedulerError::DuplicateScenario(id));
                }
                Some(_) => true,
                None => false,
            };

            let generation = state.next_generation();
            let entry_state = if target.is_err() {
                ScenarioState::Failed
            } else {
                ScenarioState::Registered
            };

            let entry = ScenarioEntry {
                spec: spec.clone(),
                target: target.as_ref().ok().cloned(),
                impairment: Arc::new(spec.impairment.clone()),
                schedule,
                duration,
                state: entry_state,
                generation,
                activating: false,
                start_timer: None,
                end_timer: None,
                active: None,
            };
            state.entries.insert(id.clone(), entry);
            if !replaces_removed {
                state.order.push(id.clone());
            }

            if let Some(occurrence) = first_start {
                state.arm_start(&self.clock, &id, occurrence);
                self.timers_changed.notify_one();
            }

            state.entries.get(&id).map(|e| e.state)
        };

        self.record(
            Event::new(
                EventKind::ScenarioCreated,
                Severity::Info,
                format!("{} scenario `{id}` added, targeting `{}`", spec.kind, spec.applies_to),
            )
            .scenario(&id),
        );

        if let Err(e) = &target {
            self.record(
                Event::new(
                    EventKind::ScenarioFailed,
                    Severity::Error,
                    format!("scenario `{id}` has an unresolvable target: {e}"),
                )
                .scenario(&id),
            );
            return Ok(ScenarioState::Failed);
        }

        if let Some(e) = scheduling_error {
            self.record(
                Event::new(
                    EventKind::SystemWarning,
                    Severity::Warning,
                    format!("scenario `{id}` will not be scheduled: {e}"),
                )
                .scenario(&id),
            );
        }

        if spec.kind == ScenarioKind::Persistent {
            self.activate(id.clone(), false).await?;
            return Ok(self
                .state
                .lock()
                .entries
                .get(&id)
                .map(|e| e.state)
                .unwrap_or(ScenarioState::Removed));
        }

        Ok(added_state.unwrap_or(ScenarioState::Registered))
    }

    /// Reserves the activation of a scenario, under the lock
    fn reserve(&self, id: &Arc<str>, manual: bool) -> Result<Option<Reservation>, SchedulerError> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(SchedulerError::ShutDown);
        }

        let entry = state
            .entries
            .get_mut(id)
            .filter(|e| e.state != ScenarioState::Removed)
            .ok_or_else(|| SchedulerError::UnknownScenario(id.clone()))?;

        if manual && entry.spec.kind != ScenarioKind::Transient {
            return Err(SchedulerError::NotTransient(id.clone()));
        }

        if entry.activating || matches!(entry.state, ScenarioState::Active | ScenarioState::Applied)
        {
            return Ok(None);
        }

        let Some(target) = entry.target.clone() else {
            return Err(SchedulerError::UnknownScenario(id.clone()));
        };

        let duration = match entry.spec.kind {
            ScenarioKind::Persistent => Duration::ZERO,
            ScenarioKind::Transient => {
                entry
                    .duration
                    .clone()
                    .map_err(|source| SchedulerError::Scheduling {
                        id: id.clone(),
                        source,
                    })?
            }
        };

        entry.activating = true;
        Ok(Some(Reservation {
            target,
            impairment: entry.impairment.clone(),
            generation: entry.generation,
            kind: entry.spec.kind,
            duration,
        }))
    }

    fn activation_in_flight(&self, id: &Arc<str>) -> bool {
        self.state
            .lock()
            .entries
            .get(id)
            .is_some_and(|e| e.activating && e.spec.kind == ScenarioKind::Transient)
    }

    /// Activates a scenario; `manual` activations are only allowed for transient scenarios
    async fn activate(
        self: &Arc<Self>,
        id: Arc<str>,
        manual: bool,
    ) -> Result<TriggerOutcome, SchedulerError> {
        if self.activation_in_flight(&id) {
            tracing::info!("scenario `{id}` is already being activated, ignoring activation");
            return Ok(TriggerOutcome::AlreadyActive);
        }

        let driver_lock = self.driver_lock(&id);
        let _driver = driver_lock.lock().await;

        let Some(reservation) = self.reserve(&id, manual)? else {
            tracing::info!("scenario `{id}` is already active, ignoring activation");
            return Ok(TriggerOutcome::AlreadyActive);
        };

        let applied = self
            .engine
            .apply(&reservation.target, reservation.impairment.clone())
            .await;
        let report = match applied {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("scenario `{id}` target no longer resolves: {e}");
                ApplicationReport::default()
            }
        };
        let succeeded = applied_successfully(&report);

        // Commit, unless the scenario was removed in the meantime
        let outcome = {
            let mut state = self.state.lock();
            let still_current = state
                .entries
                .get(&id)
                .is_some_and(|e| e.generation == reservation.generation);

            if !still_current {
                None
            } else if succeeded {
                let start_time = self.clock.now();
                let end_time = start_time
                    + TimeDelta::from_std(reservation.duration).unwrap_or(TimeDelta::zero());
                let instance = ActiveScenarioInstance {
                    scenario_id: id.clone(),
                    start_time,
                    end_time,
                };

                let end_timer = match reservation.kind {
                    ScenarioKind::Transient => Some(state.timers.arm(
                        Instant::now() + reservation.duration,
                        TimerAction::End {
                            scenario: id.clone(),
                        },
                    )),
                    ScenarioKind::Persistent => None,
                };

                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.activating = false;
                    entry.end_timer = end_timer;
                    entry.state = match reservation.kind {
                        ScenarioKind::Transient => ScenarioState::Active,
                        ScenarioKind::Persistent => ScenarioState::Applied,
                    };
                    entry.active = Some(instance.clone());
                }
                self.timers_changed.notify_one();
                Some(TriggerOutcome::Activated(instance))
            } else {
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.activating = false;
                    entry.state = match reservation.kind {
                        ScenarioKind::Transient => entry.idle_state(),
                        ScenarioKind::Persistent => ScenarioState::Failed,
                    };
                }
                Some(TriggerOutcome::Failed)
            }
        };

        match outcome {
            None => {
                tracing::info!("scenario `{id}` was removed while being activated, undoing it");
                self.clear_quietly(&reservation.target).await;
                Ok(TriggerOutcome::Cancelled)
            }
            Some(TriggerOutcome::Activated(instance)) => {
                let interfaces = report.interfaces().map(|i| i.to_string()).collect::<Vec<_>>();
                self.record(
                    Event::new(
                        EventKind::ImpairmentApplied,
                        Severity::Info,
                        format!("impairment of `{id}` applied to {}", reservation.target),
                    )
                    .scenario(&id)
                    .details(serde_json::json!({ "interfaces": interfaces })),
                );
                self.record(
                    Event::new(
                        EventKind::ScenarioStarted,
                        Severity::Info,
                        format!("scenario `{id}` started"),
                    )
                    .scenario(&id)
                    .details(serde_json::json!({
                        "start_time": instance.start_time,
                        "end_time": instance.end_time,
                    })),
                );
                Ok(TriggerOutcome::Activated(instance))
            }
            Some(outcome) => {
                let failures = report.failures().map(|e| e.to_string()).collect::<Vec<_>>();
                self.record(
                    Event::new(
                        EventKind::ScenarioFailed,
                        Severity::Error,
                        format!("scenario `{id}` could not be applied"),
                    )
                    .scenario(&id)
                    .details(serde_json::json!({ "failures": failures })),
                );

                // Don't leave a partially applied impairment behind
                self.clear_quietly(&reservation.target).await;
                Ok(outcome)
            }
        }
    }

    async fn clear_quietly(&self, target: &Target) {
        match self.engine.clear(target).await {
            Ok(report) if report.is_success() => {}
            Ok(report) => {
                for failure in report.failures() {
                    tracing::warn!("failed to clear {target}: {failure}");
                }
            }
            Err(e) => tracing::warn!("failed to clear {target}: {e}"),
        }
    }

    async fn on_start_timer(self: &Arc<Self>, timer: TimerId, id: Arc<str>, occurrence: DateTime<Utc>) {
        let (schedule, generation) = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&id) else {
                return;
            };
            if entry.start_timer.map(|(armed, _)| armed) != Some(timer) {
                return;
            }
            entry.start_timer = None;
            (entry.schedule.clone(), entry.generation)
        };

        // Skip occurrences that were missed while the previous one was being handled
        let after = occurrence.max(self.clock.now());
        let next = schedule.and_then(|schedule| schedule.next_after(after));
        if let Some(next) = next {
            let mut state = self.state.lock();
            let still_current = state
                .entries
                .get(&id)
                .is_some_and(|e| e.generation == generation && e.start_timer.is_none());
            if still_current {
                state.arm_start(&self.clock, &id, next);
                self.timers_changed.notify_one();
            }
        }

        match self.activate(id.clone(), false).await {
            Ok(TriggerOutcome::Activated(_)) | Ok(TriggerOutcome::Cancelled) => {}
            Ok(TriggerOutcome::AlreadyActive) => {
                tracing::info!("occurrence of `{id}` at {occurrence} skipped, it is still active");
            }
            Ok(TriggerOutcome::Failed) => {}
            Err(e) => tracing::warn!("occurrence of `{id}` at {occurrence} not activated: {e}"),
        }

        // Nothing else is armed when the schedule has run out and the scenario is idle
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&id) {
            if entry.state == ScenarioState::Scheduled && entry.start_timer.is_none() {
                entry.state = ScenarioState::Registered;
            }
        }
    }

    async fn on_end_timer(self: &Arc<Self>, timer: TimerId, id: Arc<str>) {
        let driver_lock = self.driver_lock(&id);
        let _driver = driver_lock.lock().await;

        let (target, generation) = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&id) else {
                return;
            };
            if entry.end_timer != Some(timer) || entry.state != ScenarioState::Active {
                return;
            }
            entry.end_timer = None;

            match &entry.target {
                Some(target) => (target.clone(), entry.generation),
                None => return,
            }
        };

        let cleared = self.engine.clear(&target).await;
        let cleared_successfully = cleared.as_ref().is_ok_and(ApplicationReport::is_success);

        {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&id) else {
                return;
            };
            // Removed (and cleared) while we were clearing
            if entry.generation != generation {
                return;
            }

            entry.active = None;
            entry.state = entry.idle_state();
        }

        if cleared_successfully {
            self.record(
                Event::new(
                    EventKind::ImpairmentRemoved,
                    Severity::Info,
                    format!("impairment of `{id}` removed from {target}"),
                )
                .scenario(&id),
            );
            self.record(
                Event::new(
                    EventKind::ScenarioEnded,
                    Severity::Info,
                    format!("scenario `{id}` ended"),
                )
                .scenario(&id),
            );
        } else {
            self.record(
                Event::new(
                    EventKind::ScenarioFailed,
                    Severity::Error,
                    format!("scenario `{id}` ended, but its impairment could not be removed"),
                )
                .scenario(&id),
            );
        }
    }

    async fn remove(self: &Arc<Self>, id: Arc<str>) -> Result<(), SchedulerError> {
        let driver_lock = self.driver_lock(&id);
        let _driver = driver_lock.lock().await;

        let target_to_clear = {
            let mut state = self.state.lock();
            let was_applied = match state.entries.get(&id) {
                Some(entry) if entry.state != ScenarioState::Removed => {
                    matches!(entry.state, ScenarioState::Active | ScenarioState::Applied)
                }
                _ => return Err(SchedulerError::UnknownScenario(id)),
            };

            state.cancel_timers(&id);
            let generation = state.next_generation();
            let Some(entry) = state.entries.get_mut(&id) else {
                return Err(SchedulerError::UnknownScenario(id));
            };
            entry.state = ScenarioState::Removed;
            entry.generation = generation;
            entry.activating = false;
            entry.active = None;

            if was_applied { entry.target.clone() } else { None }
        };

        if let Some(target) = &target_to_clear {
            self.clear_quietly(target).await;
            self.record(
                Event::new(
                    EventKind::ImpairmentRemoved,
                    Severity::Info,
                    format!("impairment of `{id}` removed from {target}"),
                )
                .scenario(&id),
            );
        }

        self.record(
            Event::new(
                EventKind::ScenarioRemoved,
                Severity::Info,
                format!("scenario `{id}` removed"),
            )
            .scenario(&id),
        );

        Ok(())
    }

    async fn shutdown(self: &Arc<Self>) {
        let to_clear: Vec<(Arc<str>, Target)> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.shut_down = true;
            state.timers.cancel_all();

            let mut to_clear = Vec::new();
            let generation = state.next_generation();
            // Registration order keeps the shutdown events reproducible
            for id in &state.order {
                let Some(entry) = state.entries.get_mut(id) else {
                    continue;
                };
                if matches!(entry.state, ScenarioState::Active | ScenarioState::Applied) {
                    if let Some(target) = &entry.target {
                        to_clear.push((id.clone(), target.clone()));
                    }
                }

                entry.state = ScenarioState::Removed;
                entry.generation = generation;
                entry.activating = false;
                entry.start_timer = None;
                entry.end_timer = None;
                entry.active = None;
            }

            to_clear
        };

        for (id, target) in to_clear {
            let driver_lock = self.driver_lock(&id);
            let _driver = driver_lock.lock().await;
            self.clear_quietly(&target).await;
            self.record(
                Event::new(
                    EventKind::ImpairmentRemoved,
                    Severity::Info,
                    format!("impairment of `{id}` removed from {target} on shutdown"),
                )
                .scenario(&id),
            );
        }
    }
}

fn applied_successfully(report: &ApplicationReport) -> bool {
    report.is_success() && !report.outcomes.is_empty()
}

/// Fires due timers until cancelled or until the scheduler is dropped
async fn run_timer_loop(scheduler: Weak<SchedulerInner>, cancel: CancellationToken) {
    loop {
        let Some(inner) = scheduler.upgrade() else {
            return;
        };

        let (due, next_deadline) = {
            let mut state = inner.state.lock();
            let due = state.timers.pop_due(Instant::now());
            (due, state.timers.next_deadline())
        };

        for (timer, action) in due {
            let inner = inner.clone();
            tokio::spawn(async move {
                match action {
                    TimerAction::Start {
                        scenario,
                        occurrence,
                    } => inner.on_start_timer(timer, scenario, occurrence).await,
                    TimerAction::End { scenario } => inner.on_end_timer(timer, scenario).await,
                }
            });
        }

        let sleep = async {
            match next_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        // Dropping the scheduler cancels the loop, so holding `inner` while waiting is fine
        let notified = inner.timers_changed.notified();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = notified => {}
            _ = sleep => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::impairment::ImpairmentState;
    use crate::impairment::memory::MemoryDriver;
    use crate::scenario::NetemSpec;
    use crate::topology::units::Percent;
    use crate::topology::{Link, Node, NodeKind, Topology};
    use bon::builder;
    use chrono::TimeZone;

    struct Fixture {
        driver: Arc<MemoryDriver>,
        engine: Arc<ImpairmentEngine>,
        events: EventLog,
        scheduler: ScenarioScheduler,
    }

    #[builder]
    fn fixture(origin: Option<DateTime<Utc>>) -> Fixture {
        // A Monday, on the hour
        let origin = origin.unwrap_or_else(|| Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap());
        let topology = Arc::new(Topology::new(
            "lab",
            vec![
                Node::new("h1", NodeKind::Host),
                Node::new("r1", NodeKind::Router),
                Node::new("h2", NodeKind::Host),
            ],
            vec![Link::new("h1", "r1"), Link::new("r1", "h2")],
        ));
        let driver = Arc::new(MemoryDriver::new(&topology));
        let engine = Arc::new(ImpairmentEngine::new(
            topology,
            driver.clone(),
            Duration::from_secs(5),
        ));
        let events = EventLog::new("lab");
        let scheduler = ScenarioScheduler::with_clock_origin(engine.clone(), events.clone(), origin);
        scheduler.start();

        Fixture {
            driver,
            engine,
            events,
            scheduler,
        }
    }

    fn loss() -> ImpairmentSpec {
        ImpairmentSpec::netem(NetemSpec::loss(Percent::new(10.0).unwrap()))
    }

    fn transient(id: &str, schedule: Option<&str>, duration: &str) -> ScenarioSpec {
        ScenarioSpec::transient(
            id,
            "link:r1->h2",
            loss(),
            schedule.map(str::to_string),
            Some(duration.to_string()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_scenario_lifecycle() {
        let f = fixture().call();
        let interface = f.driver.interface("h1", "r1").unwrap();

        let spec = ScenarioSpec::persistent("baseline", "link:h1->r1", loss());
        let state = f.scheduler.add_scenario(spec).await.unwrap();
        assert_eq!(state, ScenarioState::Applied);
        assert!(matches!(f.engine.state(&interface), ImpairmentState::Applied(_)));

        assert_eq!(
            f.scheduler.trigger("baseline").await,
            Err(SchedulerError::NotTransient("baseline".into()))
        );

        f.scheduler.remove_scenario("baseline").await.unwrap();
        assert_eq!(f.scheduler.state("baseline"), Some(ScenarioState::Removed));
        assert_eq!(f.engine.state(&interface), ImpairmentState::Cleared);
        assert_eq!(f.driver.impairment_of(&interface), None);
        assert_eq!(f.events.of_kind(EventKind::ScenarioRemoved).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_is_not_retried() {
        let f = fixture().call();
        let interface = f.driver.interface("h1", "r1").unwrap();
        f.driver.fail_on(&interface);

        let spec = ScenarioSpec::persistent("baseline", "link:h1->r1", loss());
        let state = f.scheduler.add_scenario(spec).await.unwrap();
        assert_eq!(state, ScenarioState::Failed);

        let failures = f.events.of_kind(EventKind::ScenarioFailed);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].severity, Severity::Error);

        f.driver.recover(&interface);
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(f.scheduler.state("baseline"), Some(ScenarioState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_runs_for_its_duration() {
        let f = fixture().call();
        let interface = f.driver.interface("r1", "h2").unwrap();

        let state = f
            .scheduler
            .add_scenario(transient("spike", None, "PT1M"))
            .await
            .unwrap();
        assert_eq!(state, ScenarioState::Registered);

        // Without a schedule it only runs when triggered
        let warnings = f.events.of_kind(EventKind::SystemWarning);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("has no schedule"));

        let TriggerOutcome::Activated(instance) = f.scheduler.trigger("spike").await.unwrap() else {
            panic!("expected the scenario to be activated");
        };
        assert_eq!(instance.end_time - instance.start_time, TimeDelta::seconds(60));
        assert_eq!(f.scheduler.state("spike"), Some(ScenarioState::Active));
        assert!(matches!(f.engine.state(&interface), ImpairmentState::Applied(_)));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(f.scheduler.state("spike"), Some(ScenarioState::Active));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.scheduler.state("spike"), Some(ScenarioState::Registered));
        assert_eq!(f.scheduler.active_instance("spike"), None);
        assert_eq!(f.engine.state(&interface), ImpairmentState::Cleared);
        assert_eq!(f.events.of_kind(EventKind::ScenarioEnded).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers_activate_once() {
        let f = fixture().call();
        f.scheduler
            .add_scenario(transient("spike", None, "PT5M"))
            .await
            .unwrap();

        let (first, second) = tokio::join!(f.scheduler.trigger("spike"), f.scheduler.trigger("spike"));
        let outcomes = [first.unwrap(), second.unwrap()];

        let activated = outcomes
            .iter()
            .filter(|o| matches!(o, TriggerOutcome::Activated(_)))
            .count();
        assert_eq!(activated, 1);
        assert!(outcomes.contains(&TriggerOutcome::AlreadyActive));
        assert_eq!(f.scheduler.active_instances().len(), 1);

        // Still active: a third trigger is a no-op too
        assert_eq!(
            f.scheduler.trigger("spike").await.unwrap(),
            TriggerOutcome::AlreadyActive
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_occurrences() {
        // The fixture's clock starts at 10:00:00, so the first occurrence is at 10:05
        let f = fixture().call();
        let state = f
            .scheduler
            .add_scenario(transient("every-5m", Some("*/5 * * * *"), "PT1M"))
            .await
            .unwrap();
        assert_eq!(state, ScenarioState::Scheduled);

        let status = f.scheduler.status();
        assert_eq!(
            status[0].next_start,
            Some(Utc.with_ymd_and_hms(2025, 1, 6, 10, 5, 0).unwrap())
        );

        tokio::time::sleep(Duration::from_secs(5 * 60 + 30)).await;
        assert_eq!(f.scheduler.state("every-5m"), Some(ScenarioState::Active));
        let instance = f.scheduler.active_instance("every-5m").unwrap();
        assert_eq!(
            instance.start_time,
            Utc.with_ymd_and_hms(2025, 1, 6, 10, 5, 0).unwrap()
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.scheduler.state("every-5m"), Some(ScenarioState::Scheduled));
        assert_eq!(
            f.scheduler.status()[0].next_start,
            Some(Utc.with_ymd_and_hms(2025, 1, 6, 10, 10, 0).unwrap())
        );

        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        assert_eq!(f.events.of_kind(EventKind::ScenarioStarted).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurrence_rule_occurrences() {
        let f = fixture()
            .origin(Utc.with_ymd_and_hms(2025, 1, 6, 8, 30, 0).unwrap())
            .call();
        f.scheduler
            .add_scenario(transient("morning", Some("RRULE:FREQ=DAILY;BYHOUR=9"), "PT10M"))
            .await
            .unwrap();
        assert_eq!(
            f.scheduler.status()[0].next_start,
            Some(Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap())
        );

        tokio::time::sleep(Duration::from_secs(31 * 60)).await;
        assert_eq!(f.scheduler.state("morning"), Some(ScenarioState::Active));
        assert_eq!(
            f.scheduler.status()[0].next_start,
            Some(Utc.with_ymd_and_hms(2025, 1, 7, 9, 0, 0).unwrap())
        );

        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert_eq!(f.scheduler.state("morning"), Some(ScenarioState::Scheduled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_schedule_stays_registered() {
        let f = fixture().call();

        let bad_schedule = f
            .scheduler
            .add_scenario(transient("bad", Some("now and then"), "PT1M"))
            .await
            .unwrap();
        assert_eq!(bad_schedule, ScenarioState::Registered);

        let bad_duration = f
            .scheduler
            .add_scenario(transient("forever", Some("FREQ=HOURLY"), "a while"))
            .await
            .unwrap();
        assert_eq!(bad_duration, ScenarioState::Registered);
        assert!(matches!(
            f.scheduler.trigger("forever").await,
            Err(SchedulerError::Scheduling { .. })
        ));

        let good = f
            .scheduler
            .add_scenario(transient("good", Some("FREQ=HOURLY"), "PT1M"))
            .await
            .unwrap();
        assert_eq!(good, ScenarioState::Scheduled);
        assert_eq!(f.events.of_kind(EventKind::SystemWarning).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_target_fails_only_that_scenario() {
        let f = fixture().call();

        let results = f
            .scheduler
            .add_scenarios([
                ScenarioSpec::persistent("ghost", "node:r9", loss()),
                ScenarioSpec::persistent("garbled", "r1 to h2", loss()),
                ScenarioSpec::persistent("fine", "node:r1", loss()),
            ])
            .await;

        let states: Vec<_> = results.into_iter().map(|(_, r)| r.unwrap()).collect();
        assert_eq!(
            states,
            [ScenarioState::Failed, ScenarioState::Failed, ScenarioState::Applied]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_cancels_pending_end() {
        let f = fixture().call();
        let interface = f.driver.interface("r1", "h2").unwrap();
        f.scheduler
            .add_scenario(transient("spike", None, "PT1M"))
            .await
            .unwrap();
        f.scheduler.trigger("spike").await.unwrap();

        f.scheduler.remove_scenario("spike").await.unwrap();
        assert_eq!(f.engine.state(&interface), ImpairmentState::Cleared);

        // Re-adding the same id starts from scratch, and the old end timer never fires
        f.scheduler
            .add_scenario(transient("spike", None, "PT2M"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        f.scheduler.trigger("spike").await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.scheduler.state("spike"), Some(ScenarioState::Active));
        assert!(matches!(f.engine.state(&interface), ImpairmentState::Applied(_)));

        assert_eq!(
            f.scheduler.remove_scenario("missing").await,
            Err(SchedulerError::UnknownScenario("missing".into()))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_re_adding_during_activation_keeps_the_new_impairment() {
        let f = fixture().call();
        let interface = f.driver.interface("r1", "h2").unwrap();
        f.scheduler
            .add_scenario(transient("spike", None, "PT1H"))
            .await
            .unwrap();
        f.driver.set_latency(Duration::from_millis(100));

        let replace = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            f.scheduler.remove_scenario("spike").await.unwrap();
            f.scheduler
                .add_scenario(transient("spike", None, "PT1H"))
                .await
                .unwrap();
            f.scheduler.trigger("spike").await
        };
        let (first, second) = tokio::join!(f.scheduler.trigger("spike"), replace);

        assert!(matches!(first, Ok(TriggerOutcome::Activated(_))));
        assert!(matches!(second, Ok(TriggerOutcome::Activated(_))));
        assert_eq!(f.scheduler.state("spike"), Some(ScenarioState::Active));
        assert!(matches!(f.engine.state(&interface), ImpairmentState::Applied(_)));
        assert!(f.driver.impairment_of(&interface).is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_during_activation_undoes_it() {
        let f = fixture().call();
        let interface = f.driver.interface("r1", "h2").unwrap();
        f.scheduler
            .add_scenario(transient("spike", None, "PT1H"))
            .await
            .unwrap();
        f.driver.set_latency(Duration::from_millis(100));

        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            f.scheduler.shutdown().await;
        };
        let (outcome, ()) = tokio::join!(f.scheduler.trigger("spike"), shutdown);

        assert_eq!(outcome, Ok(TriggerOutcome::Cancelled));
        assert_eq!(f.scheduler.state("spike"), Some(ScenarioState::Removed));
        assert_eq!(f.engine.state(&interface), ImpairmentState::Cleared);
        assert_eq!(f.driver.impairment_of(&interface), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ids_are_rejected() {
        let f = fixture().call();
        f.scheduler
            .add_scenario(transient("spike", None, "PT1M"))
            .await
            .unwrap();
        assert_eq!(
            f.scheduler
                .add_scenario(transient("spike", None, "PT1M"))
                .await,
            Err(SchedulerError::DuplicateScenario("spike".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_everything() {
        let f = fixture().call();
        f.scheduler
            .add_scenario(ScenarioSpec::persistent("baseline", "node:r1", loss()))
            .await
            .unwrap();
        f.scheduler
            .add_scenario(transient("spike", Some("FREQ=MINUTELY"), "PT30S"))
            .await
            .unwrap();
        f.scheduler.trigger("spike").await.unwrap();

        f.scheduler.shutdown().await;
        assert!(
            f.engine
                .snapshot()
                .values()
                .all(|state| *state == ImpairmentState::Cleared)
        );
        assert!(
            f.scheduler
                .status()
                .iter()
                .all(|s| s.state == ScenarioState::Removed)
        );
        assert_eq!(
            f.scheduler.trigger("spike").await,
            Err(SchedulerError::ShutDown)
        );
    }
}
