//! Per-instance state machine interpreter.
//!
//! The interpreter owns one configuration and one context and processes one
//! event at a time as a run-to-completion macro-step. It performs no IO: side
//! effects (published events, service calls, timers) are returned as
//! [`Effect`]s for the caller to execute.

use crate::checkpoint::Checkpoint;
use crate::error::{CoreError, EvaluationError, FatalInterpreterFault};
use crate::event::{done_state_event, Channel, Event};
use crate::expr::{evaluate_guard, Expression, Scope};
use crate::model::{Action, Configuration, Model, StateId, TransitionId};
use crate::value::{values_equal, Context, Num};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Default bound on micro-steps in one macro-step.
pub const DEFAULT_MAX_MICROSTEPS: usize = 1_000;

/// Lifecycle status of an interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Idle,
    Processing,
    Completed,
    Failed,
}

impl Status {
    /// Returns true once the instance accepts no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

/// A service call requested by an invoke action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    /// Unique per instance, `<instance>-<n>`.
    pub id: String,
    pub service: String,
    pub input: Value,
    pub timeout: Duration,
    /// Raised with the response on success.
    pub done_event: String,
    /// Raised with the failure details on error or timeout.
    pub error_event: String,
    /// Restrict to implementations local to this node.
    pub local: bool,
}

/// A timer to (re)start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerRequest {
    /// `<state path>/<timer name>`, unique within an instance.
    pub key: String,
    pub delay: Duration,
    pub event: String,
    pub repeat: bool,
}

/// A side effect produced by a macro-step.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Hand an external or global event to the router.
    Publish(Event),
    Invoke(InvocationRequest),
    StartTimer(TimerRequest),
    CancelTimer(String),
}

/// A transition that fired during a macro-step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTransition {
    pub label: String,
    pub event: Option<String>,
    pub source: String,
    pub targets: Vec<String>,
}

/// A recovered evaluation error.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// Transition label or state path the error occurred in.
    pub location: String,
    pub error: EvaluationError,
}

/// Outcome of one macro-step.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub fired: Vec<FiredTransition>,
    pub faults: Vec<Fault>,
    pub effects: Vec<Effect>,
    pub status: Status,
    /// True if the triggering event enabled no transition.
    pub discarded: bool,
}

impl StepReport {
    /// Events to hand to the router, in raise order.
    pub fn published(&self) -> impl Iterator<Item = &Event> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Publish(event) => Some(event),
            _ => None,
        })
    }
}

/// A selected transition, with the else branch when its guard was false.
#[derive(Debug, Clone, Copy)]
struct Choice {
    transition: TransitionId,
    else_branch: bool,
}

/// Executes one instance of a [`Model`].
pub struct Interpreter {
    model: Arc<Model>,
    instance_id: String,
    configuration: Configuration,
    context: Context,
    internal: VecDeque<Event>,
    status: Status,
    started: bool,
    invocations: u64,
    max_microsteps: usize,
}

impl Interpreter {
    pub fn new(model: Arc<Model>, instance_id: impl Into<String>) -> Self {
        let context = model.schema().initial_context();
        Self {
            model,
            instance_id: instance_id.into(),
            configuration: Configuration::new(),
            context,
            internal: VecDeque::new(),
            status: Status::Idle,
            started: false,
            invocations: 0,
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
        }
    }

    /// Sets the bound on micro-steps per macro-step.
    pub fn with_max_microsteps(mut self, max: usize) -> Self {
        self.max_microsteps = max.max(1);
        self
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Paths of the active states in document order.
    pub fn active_paths(&self) -> Vec<String> {
        self.model.paths(&self.configuration)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Enters the initial configuration and runs the resulting macro-step.
    pub fn start(&mut self) -> Result<StepReport, FatalInterpreterFault> {
        if self.started {
            return Err(self.fatal("interpreter already started"));
        }
        self.started = true;
        self.status = Status::Processing;

        let model = Arc::clone(&self.model);
        let mut report = StepReport::default();
        let root = model.root();
        let entered = model.entry_set(root, &[model.region(root).default]);
        for &state in &entered {
            if let Err(error) = self.run_actions(&model, &model.state(state).entry, None, &mut report.effects) {
                self.record_fault(model.state(state).path.clone(), error, &mut report);
            }
        }
        self.commit(&model, &[], &entered, &mut report);

        tracing::debug!(
            instance_id = %self.instance_id,
            "started in {:?}",
            self.active_paths()
        );
        self.settle(&model, 0, &mut report)?;
        Ok(self.finish(report))
    }

    /// Processes one event as a run-to-completion macro-step.
    ///
    /// Internal events raised along the way, and eventless transitions they
    /// enable, are handled before this returns. An event that enables nothing
    /// is discarded and leaves the instance unchanged.
    pub fn process(&mut self, event: Event) -> Result<StepReport, FatalInterpreterFault> {
        if !self.started {
            return Err(self.fatal("event processed before start"));
        }
        match self.status {
            Status::Failed => return Err(self.fatal("instance has failed")),
            Status::Completed => {
                tracing::debug!(
                    instance_id = %self.instance_id,
                    "ignoring '{}' after completion",
                    event.name
                );
                return Ok(StepReport {
                    status: Status::Completed,
                    discarded: true,
                    ..Default::default()
                });
            }
            Status::Idle | Status::Processing => {}
        }

        self.status = Status::Processing;
        let model = Arc::clone(&self.model);
        let mut report = StepReport::default();

        let fired = self.micro_step(&model, Some(&event), &mut report)?;
        report.discarded = fired.is_none();
        if report.discarded {
            tracing::debug!(
                instance_id = %self.instance_id,
                "discarded '{}'",
                event.name
            );
        }
        self.settle(&model, usize::from(fired == Some(true)), &mut report)?;
        Ok(self.finish(report))
    }

    /// Captures the configuration and context.
    ///
    /// Delivery bookkeeping is left at zero; callers that track it use
    /// [`Checkpoint::with_delivery`].
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(
            self.instance_id.clone(),
            self.model.model_version(),
            self.active_paths(),
            self.context.clone(),
            self.status,
        )
        .with_invocations(self.invocations)
    }

    /// Resumes from a checkpoint instead of starting fresh.
    ///
    /// Returns the timers of the restored active states, which must be started again.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<Vec<Effect>, CoreError> {
        let expected = self.model.model_version();
        if checkpoint.model_version != expected {
            return Err(CoreError::ModelVersionMismatch {
                instance_id: checkpoint.instance_id.clone(),
                expected: checkpoint.model_version.clone(),
                actual: expected,
            });
        }
        let invalid = |reason: String| CoreError::InvalidCheckpoint {
            instance_id: checkpoint.instance_id.clone(),
            reason,
        };

        let configuration = self.model.resolve_paths(&checkpoint.configuration).map_err(invalid)?;
        self.model.check_configuration(&configuration).map_err(invalid)?;
        for (name, value) in checkpoint.context.iter() {
            match self.model.schema().type_of(name) {
                Some(ty) if ty.accepts(value) => {}
                Some(ty) => return Err(invalid(format!("variable '{}' does not hold a {}", name, ty))),
                None => return Err(invalid(format!("unknown variable '{}'", name))),
            }
        }

        let mut context = self.model.schema().initial_context();
        for (name, value) in checkpoint.context.iter() {
            context.insert(name.clone(), value.clone());
        }

        self.configuration = configuration;
        self.context = context;
        self.internal.clear();
        self.invocations = checkpoint.invocations;
        self.started = true;
        self.status = match checkpoint.status {
            Status::Processing => Status::Idle,
            other => other,
        };

        let model = Arc::clone(&self.model);
        let mut report = StepReport::default();
        if !self.status.is_terminal() {
            let active: Vec<StateId> = self.configuration.iter().copied().collect();
            for state in active {
                self.start_timers(&model, state, &mut report);
            }
        }
        for fault in &report.faults {
            tracing::warn!(
                instance_id = %self.instance_id,
                "timer not restored in {}: {}",
                fault.location,
                fault.error
            );
        }

        tracing::info!(
            instance_id = %self.instance_id,
            "restored at {:?} ({})",
            checkpoint.configuration,
            self.status.as_str()
        );
        Ok(report.effects)
    }

    // =========================================================================
    // Macro-step
    // =========================================================================

    /// Runs eventless transitions and drains the internal queue.
    fn settle(&mut self, model: &Model, mut steps: usize, report: &mut StepReport) -> Result<(), FatalInterpreterFault> {
        loop {
            loop {
                if self.is_completed(model) {
                    self.internal.clear();
                    return Ok(());
                }
                match self.micro_step(model, None, report)? {
                    Some(true) => steps = self.count_step(steps)?,
                    _ => break,
                }
            }

            let event = match self.internal.pop_front() {
                Some(event) => event,
                None => return Ok(()),
            };
            match self.micro_step(model, Some(&event), report)? {
                Some(true) => steps = self.count_step(steps)?,
                Some(false) => {}
                None => tracing::trace!(
                    instance_id = %self.instance_id,
                    "internal event '{}' enabled nothing",
                    event.name
                ),
            }
        }
    }

    fn count_step(&mut self, steps: usize) -> Result<usize, FatalInterpreterFault> {
        let steps = steps + 1;
        if steps > self.max_microsteps {
            let fault = self.fatal(format!(
                "macro-step exceeded {} micro-steps",
                self.max_microsteps
            ));
            self.status = Status::Failed;
            return Err(fault);
        }
        Ok(steps)
    }

    fn is_completed(&self, model: &Model) -> bool {
        model.is_completed(&self.configuration)
    }

    fn finish(&mut self, mut report: StepReport) -> StepReport {
        self.status = if self.is_completed(&self.model) && self.internal.is_empty() {
            Status::Completed
        } else {
            Status::Idle
        };
        if self.status == Status::Completed {
            tracing::info!(instance_id = %self.instance_id, "completed");
        }
        report.status = self.status;
        report
    }

    // =========================================================================
    // Micro-step
    // =========================================================================

    /// Selects and fires the transitions enabled by `event` (`None` for eventless).
    ///
    /// Returns `None` if nothing was enabled, `Some(true)` if at least one
    /// transition completed, `Some(false)` if every selected transition failed.
    fn micro_step(
        &mut self,
        model: &Model,
        event: Option<&Event>,
        report: &mut StepReport,
    ) -> Result<Option<bool>, FatalInterpreterFault> {
        let choices = self.select(model, event, report);
        if choices.is_empty() {
            return Ok(None);
        }

        let payload = event.map(|e| &e.payload);
        let mut progressed = false;
        for choice in choices {
            progressed |= self.fire(model, choice, payload, report);
        }

        if let Err(reason) = model.check_configuration(&self.configuration) {
            self.status = Status::Failed;
            return Err(self.fatal(reason));
        }
        Ok(Some(progressed))
    }

    /// Picks at most one transition per active leaf, then drops those whose
    /// exit sets overlap a deeper or higher-priority choice.
    fn select(&self, model: &Model, event: Option<&Event>, report: &mut StepReport) -> Vec<Choice> {
        let name = event.map(|e| e.name.as_str());
        let scope = Scope::new(&self.context, event.map(|e| &e.payload));

        let mut candidates: Vec<Choice> = Vec::new();
        let leaves = self
            .configuration
            .iter()
            .copied()
            .filter(|&s| !model.state(s).is_compound());
        for leaf in leaves {
            let chain = std::iter::once(leaf).chain(model.ancestors(leaf));
            'chain: for state in chain {
                for &tid in &model.state(state).transitions {
                    let transition = model.transition(tid);
                    if !transition.is_triggered_by(name) {
                        continue;
                    }
                    let enabled = match &transition.guard {
                        None => Ok(true),
                        Some(guard) => evaluate_guard(guard.as_ref(), &scope),
                    };
                    let choice = match enabled {
                        Ok(true) => Choice {
                            transition: tid,
                            else_branch: false,
                        },
                        Ok(false) if !transition.else_targets.is_empty() => Choice {
                            transition: tid,
                            else_branch: true,
                        },
                        Ok(false) => continue,
                        Err(error) => {
                            tracing::warn!(
                                instance_id = %self.instance_id,
                                context = %self.context.to_value(),
                                "guard of '{}' failed: {}",
                                transition.label,
                                error
                            );
                            report.faults.push(Fault {
                                location: transition.label.clone(),
                                error,
                            });
                            continue;
                        }
                    };
                    if !candidates.iter().any(|c| c.transition == tid) {
                        candidates.push(choice);
                    }
                    break 'chain;
                }
            }
        }

        let mut ranked = candidates.clone();
        ranked.sort_by_key(|c| {
            let t = model.transition(c.transition);
            (
                std::cmp::Reverse(model.state(t.source).depth),
                std::cmp::Reverse(t.priority),
                c.transition,
            )
        });

        let mut claimed: BTreeSet<StateId> = BTreeSet::new();
        let mut accepted: BTreeSet<TransitionId> = BTreeSet::new();
        for choice in ranked {
            let exits = self.conflict_set(model, choice);
            if exits.iter().all(|s| !claimed.contains(s)) {
                claimed.extend(exits);
                accepted.insert(choice.transition);
            } else {
                tracing::trace!(
                    instance_id = %self.instance_id,
                    "'{}' preempted",
                    model.transition(choice.transition).label
                );
            }
        }

        candidates.retain(|c| accepted.contains(&c.transition));
        candidates
    }

    /// States a choice exits, or its source for targetless transitions.
    fn conflict_set(&self, model: &Model, choice: Choice) -> Vec<StateId> {
        let t = model.transition(choice.transition);
        let targets = if choice.else_branch {
            &t.else_targets
        } else {
            &t.targets
        };
        if targets.is_empty() {
            return vec![t.source];
        }
        model.exit_set(&self.configuration, model.transition_domain(t.source, targets))
    }

    /// Runs exit, transition and entry actions and commits the new
    /// configuration if all of them succeed. Returns true on commit.
    fn fire(&mut self, model: &Model, choice: Choice, payload: Option<&Value>, report: &mut StepReport) -> bool {
        let t = model.transition(choice.transition);
        if !self.configuration.contains(&t.source) {
            return false;
        }
        let targets = if choice.else_branch {
            &t.else_targets
        } else {
            &t.targets
        };

        if targets.is_empty() {
            return match self.run_actions(model, &t.actions, payload, &mut report.effects) {
                Ok(()) => {
                    self.record_fired(model, choice, &[], report);
                    true
                }
                Err(error) => {
                    self.record_fault(t.label.clone(), error, report);
                    false
                }
            };
        }

        let domain = model.transition_domain(t.source, targets);
        let exited = model.exit_set(&self.configuration, domain);
        let entered = model.entry_set(domain, targets);

        let outcome = (|| {
            for &state in &exited {
                self.run_actions(model, &model.state(state).exit, payload, &mut report.effects)?;
            }
            if !choice.else_branch {
                self.run_actions(model, &t.actions, payload, &mut report.effects)?;
            }
            for &state in &entered {
                self.run_actions(model, &model.state(state).entry, payload, &mut report.effects)?;
            }
            Ok::<(), EvaluationError>(())
        })();

        match outcome {
            Ok(()) => {
                self.commit(model, &exited, &entered, report);
                self.record_fired(model, choice, targets, report);
                true
            }
            Err(error) => {
                self.record_fault(t.label.clone(), error, report);
                false
            }
        }
    }

    /// Applies a configuration change: timers of exited states are cancelled,
    /// timers of entered states started, and completion events raised.
    fn commit(&mut self, model: &Model, exited: &[StateId], entered: &[StateId], report: &mut StepReport) {
        for &state in exited {
            self.configuration.remove(&state);
            let node = model.state(state);
            for timer in &node.timers {
                report
                    .effects
                    .push(Effect::CancelTimer(timer_key(&node.path, &timer.name)));
            }
        }
        for &state in entered {
            self.configuration.insert(state);
        }
        for &state in entered {
            self.start_timers(model, state, report);
        }

        let mut completed = BTreeSet::new();
        for &state in entered {
            if !model.state(state).is_final() {
                continue;
            }
            if let Some(parent) = model.parent(state) {
                if model.is_done(parent, &self.configuration) && completed.insert(parent) {
                    self.internal
                        .push_back(Event::internal(done_state_event(&model.state(parent).path)));
                }
            }
        }
    }

    fn start_timers(&self, model: &Model, state: StateId, report: &mut StepReport) {
        let node = model.state(state);
        for timer in &node.timers {
            let scope = Scope::new(&self.context, None);
            let delay = timer.delay.evaluate(&scope).and_then(|value| {
                Num::from_value(&value)
                    .map(|n| Duration::from_millis(n.as_f64().max(0.0) as u64))
                    .ok_or_else(|| EvaluationError::TypeMismatch {
                        expression: timer.delay.source().to_string(),
                        message: format!("timer delay must be a number, got {}", value),
                    })
            });
            match delay {
                Ok(delay) => report.effects.push(Effect::StartTimer(TimerRequest {
                    key: timer_key(&node.path, &timer.name),
                    delay,
                    event: timer.event.clone(),
                    repeat: timer.repeat,
                })),
                Err(error) => self.record_fault(format!("{} (timer '{}')", node.path, timer.name), error, report),
            }
        }
    }

    fn record_fired(&self, model: &Model, choice: Choice, targets: &[StateId], report: &mut StepReport) {
        let t = model.transition(choice.transition);
        let label = if choice.else_branch {
            format!("{} (else)", t.label)
        } else {
            t.label.clone()
        };
        tracing::debug!(instance_id = %self.instance_id, "fired {}", label);
        report.fired.push(FiredTransition {
            label,
            event: t.event.clone(),
            source: model.state(t.source).path.clone(),
            targets: targets.iter().map(|&s| model.state(s).path.clone()).collect(),
        });
    }

    fn record_fault(&self, location: String, error: EvaluationError, report: &mut StepReport) {
        tracing::warn!(
            instance_id = %self.instance_id,
            context = %self.context.to_value(),
            "evaluation fault in {}: {}",
            location,
            error
        );
        report.faults.push(Fault { location, error });
    }

    fn fatal(&self, reason: impl Into<String>) -> FatalInterpreterFault {
        let fault = FatalInterpreterFault {
            instance_id: self.instance_id.clone(),
            reason: reason.into(),
        };
        tracing::error!(instance_id = %fault.instance_id, "fatal fault: {}", fault.reason);
        fault
    }

    // =========================================================================
    // Actions
    // =========================================================================

    fn run_actions(
        &mut self,
        model: &Model,
        actions: &[Action],
        payload: Option<&Value>,
        effects: &mut Vec<Effect>,
    ) -> Result<(), EvaluationError> {
        for action in actions {
            self.run_action(model, action, payload, effects)?;
        }
        Ok(())
    }

    fn run_action(
        &mut self,
        model: &Model,
        action: &Action,
        payload: Option<&Value>,
        effects: &mut Vec<Effect>,
    ) -> Result<(), EvaluationError> {
        match action {
            Action::Assign { variable, value } => {
                let result = self.eval(value.as_ref(), payload)?;
                if let Some(ty) = model.schema().type_of(variable) {
                    if !ty.accepts(&result) {
                        return Err(EvaluationError::TypeMismatch {
                            expression: value.source().to_string(),
                            message: format!("cannot store {} in '{}' of type {}", result, variable, ty),
                        });
                    }
                    self.context.insert(variable.clone(), ty.coerce(result));
                }
            }
            Action::Raise {
                event,
                channel,
                payload: expr,
            } => {
                let value = match expr {
                    Some(expr) => self.eval(expr.as_ref(), payload)?,
                    None => Value::Null,
                };
                let raised = Event::new(event.clone(), *channel).with_payload(value);
                match channel {
                    Channel::Internal => self.internal.push_back(raised),
                    Channel::External | Channel::Global => effects.push(Effect::Publish(raised)),
                }
            }
            Action::Invoke(invoke) => {
                let input = match &invoke.input {
                    Some(expr) => self.eval(expr.as_ref(), payload)?,
                    None => Value::Null,
                };
                self.invocations += 1;
                effects.push(Effect::Invoke(InvocationRequest {
                    id: format!("{}-{}", self.instance_id, self.invocations),
                    service: invoke.service.clone(),
                    input,
                    timeout: invoke.timeout,
                    done_event: invoke.done_event.clone(),
                    error_event: invoke.error_event.clone(),
                    local: invoke.local,
                }));
            }
            Action::Match {
                value,
                cases,
                default,
            } => {
                let subject = self.eval(value.as_ref(), payload)?;
                for case in cases {
                    let when = self.eval(case.when.as_ref(), payload)?;
                    if values_equal(&subject, &when) {
                        return self.run_actions(model, &case.actions, payload, effects);
                    }
                }
                self.run_actions(model, default, payload, effects)?;
            }
            Action::ResetTimer(name) => {
                let owner = self
                    .configuration
                    .iter()
                    .copied()
                    .find(|&s| model.state(s).timers.iter().any(|t| &t.name == name));
                if let Some(state) = owner {
                    let path = &model.state(state).path;
                    effects.push(Effect::CancelTimer(timer_key(path, name)));
                    let mut report = StepReport::default();
                    self.start_timers(model, state, &mut report);
                    let key = timer_key(path, name);
                    effects.extend(report.effects.into_iter().filter(
                        |e| matches!(e, Effect::StartTimer(t) if t.key == key),
                    ));
                    if let Some(fault) = report.faults.into_iter().next() {
                        return Err(fault.error);
                    }
                }
            }
        }
        Ok(())
    }

    fn eval(&self, expr: &dyn Expression, payload: Option<&Value>) -> Result<Value, EvaluationError> {
        expr.evaluate(&Scope::new(&self.context, payload))
    }
}

fn timer_key(path: &str, name: &str) -> String {
    format!("{}/{}", path, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const COUNTER: &str = r#"
name: counter
variables:
  count: { type: int, initial: 0 }
states:
  - id: init
    kind: initial
    transitions: [{ target: Idle }]
  - id: Idle
    transitions:
      - { event: start, target: Running, actions: [{ assign: "count := 0" }] }
  - id: Running
    transitions:
      - { event: tick, target: Running, guard: "count < 3", actions: [{ assign: "count := count + 1" }] }
      - { event: tick, target: Done, guard: "count >= 3" }
  - id: Done
    kind: final
"#;

    const DOORS: &str = r#"
name: doors
variables:
  front: { type: int }
  back: { type: int }
  log: { type: list }
states:
  - { id: init, kind: initial, transitions: [{ target: House }] }
  - id: House
    kind: parallel
    regions:
      - id: front
        states:
          - { id: init, kind: initial, transitions: [{ target: Closed }] }
          - id: Closed
            transitions: [{ event: open, target: Open, actions: [{ assign: "front := front + 1" }] }]
          - id: Open
            transitions: [{ event: close, target: Closed }, { event: lock, target: Locked }]
          - { id: Locked, kind: final }
      - id: back
        states:
          - { id: init, kind: initial, transitions: [{ target: Closed }] }
          - id: Closed
            transitions: [{ event: open, target: Open, actions: [{ assign: "back := back + 10" }] }]
          - id: Open
            transitions: [{ event: close, target: Closed }, { event: lock, target: Locked }]
          - { id: Locked, kind: final }
    transitions:
      - { event: done.state.House, target: Away }
      - { event: alarm, target: Alarm }
  - id: Away
    kind: final
  - id: Alarm
    entry: [{ raise: { event: siren, channel: external, payload: "front + back" } }]
    transitions: [{ event: reset, target: House }]
"#;

    fn model(yaml: &str) -> Arc<Model> {
        match Model::from_yaml(yaml) {
            Ok(model) => Arc::new(model),
            Err(e) => panic!("model should build: {}", e),
        }
    }

    fn started(yaml: &str) -> Interpreter {
        let mut interp = Interpreter::new(model(yaml), "test-1");
        interp.start().unwrap();
        interp
    }

    fn send(interp: &mut Interpreter, name: &str) -> StepReport {
        interp.process(Event::external(name)).unwrap()
    }

    #[test]
    fn test_counter_scenario() {
        let mut interp = started(COUNTER);
        assert_eq!(interp.active_paths(), vec!["Idle"]);

        for name in ["start", "tick", "tick", "tick", "tick"] {
            send(&mut interp, name);
        }
        assert_eq!(interp.active_paths(), vec!["Done"]);
        assert_eq!(interp.context().get("count"), Some(&json!(3)));
        assert_eq!(interp.status(), Status::Completed);
    }

    #[test]
    fn test_unrecognized_event_is_noop() {
        let mut interp = started(COUNTER);
        send(&mut interp, "start");
        let before = (interp.configuration().clone(), interp.context().clone());

        let report = send(&mut interp, "bogus");
        assert!(report.discarded);
        assert!(report.fired.is_empty());
        assert!(report.effects.is_empty());
        assert_eq!(report.status, Status::Idle);
        assert_eq!((interp.configuration().clone(), interp.context().clone()), before);
    }

    #[test]
    fn test_events_after_completion_are_ignored() {
        let mut interp = started(COUNTER);
        for name in ["start", "tick", "tick", "tick", "tick"] {
            send(&mut interp, name);
        }
        let report = send(&mut interp, "start");
        assert!(report.discarded);
        assert_eq!(report.status, Status::Completed);
        assert_eq!(interp.active_paths(), vec!["Done"]);
    }

    #[test]
    fn test_process_before_start_is_fatal() {
        let mut interp = Interpreter::new(model(COUNTER), "test-1");
        assert!(interp.process(Event::external("start")).is_err());
        assert!(interp.start().is_ok());
        assert!(interp.start().is_err());
    }

    #[test]
    fn test_parallel_regions_fire_in_one_step() {
        let mut interp = started(DOORS);
        assert_eq!(
            interp.active_paths(),
            vec!["House", "House.front.Closed", "House.back.Closed"]
        );

        let report = send(&mut interp, "open");
        assert_eq!(report.fired.len(), 2);
        assert_eq!(
            interp.active_paths(),
            vec!["House", "House.front.Open", "House.back.Open"]
        );
        assert_eq!(interp.context().get("front"), Some(&json!(1)));
        assert_eq!(interp.context().get("back"), Some(&json!(10)));
    }

    #[test]
    fn test_parallel_done_event() {
        let mut interp = started(DOORS);
        send(&mut interp, "open");
        let report = send(&mut interp, "lock");

        let labels: Vec<_> = report.fired.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels[2], "House --done.state.House--> Away");
        assert_eq!(interp.active_paths(), vec!["Away"]);
        assert_eq!(interp.status(), Status::Completed);
    }

    #[test]
    fn test_ancestor_transition_exits_all_regions() {
        let mut interp = started(DOORS);
        send(&mut interp, "open");
        let report = send(&mut interp, "alarm");

        assert_eq!(interp.active_paths(), vec!["Alarm"]);
        let published: Vec<_> = report.published().collect();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].name, "siren");
        assert_eq!(published[0].channel, Channel::External);
        assert_eq!(published[0].payload, json!(11));

        send(&mut interp, "reset");
        assert_eq!(
            interp.active_paths(),
            vec!["House", "House.front.Closed", "House.back.Closed"]
        );
    }

    #[test]
    fn test_descendant_wins_over_ancestor() {
        let mut interp = started(
            r#"
name: nested
states:
  - { id: init, kind: initial, transitions: [{ target: Outer }] }
  - id: Outer
    kind: composite
    states:
      - { id: init, kind: initial, transitions: [{ target: A }] }
      - id: A
        transitions: [{ event: go, target: B }]
      - { id: B }
    transitions: [{ event: go, target: Elsewhere, priority: 5 }]
  - { id: Elsewhere }
"#,
        );
        send(&mut interp, "go");
        assert_eq!(interp.active_paths(), vec!["Outer", "Outer.B"]);
        send(&mut interp, "go");
        assert_eq!(interp.active_paths(), vec!["Elsewhere"]);
    }

    #[test]
    fn test_priority_and_document_order() {
        let mut interp = started(
            r#"
name: prio
states:
  - { id: init, kind: initial, transitions: [{ target: A }] }
  - id: A
    transitions:
      - { event: go, target: B, guard: "true && true" }
      - { event: go, target: C, priority: 1, guard: "1 < 2" }
  - { id: B }
  - { id: C }
"#,
        );
        send(&mut interp, "go");
        assert_eq!(interp.active_paths(), vec!["C"]);
    }

    #[test]
    fn test_internal_events_run_before_next_external() {
        let mut interp = started(
            r#"
name: chain
variables:
  trail: { type: string }
states:
  - { id: init, kind: initial, transitions: [{ target: A }] }
  - id: A
    transitions:
      - event: go
        target: B
        actions:
          - { raise: { event: step } }
          - { assign: "trail := trail + 'a'" }
  - id: B
    entry: [{ assign: "trail := trail + 'b'" }]
    transitions:
      - { event: step, target: C, actions: [{ assign: "trail := trail + 'c'" }] }
  - id: C
"#,
        );
        let report = send(&mut interp, "go");
        assert_eq!(report.fired.len(), 2);
        assert!(report.effects.is_empty());
        assert_eq!(interp.active_paths(), vec!["C"]);
        assert_eq!(interp.context().get("trail"), Some(&json!("abc")));
    }

    #[test]
    fn test_eventless_transitions_settle() {
        let mut interp = started(
            r#"
name: eventless
variables:
  n: { type: int }
states:
  - { id: init, kind: initial, transitions: [{ target: Counting }] }
  - id: Counting
    transitions:
      - { target: Counting, guard: "n < 5", actions: [{ assign: "n := n + 1" }] }
      - { target: Done, guard: "n >= 5" }
  - { id: Done, kind: final }
"#,
        );
        assert_eq!(interp.active_paths(), vec!["Done"]);
        assert_eq!(interp.context().get("n"), Some(&json!(5)));
        assert_eq!(interp.status(), Status::Completed);
    }

    #[test]
    fn test_livelock_is_fatal() {
        let mut interp = Interpreter::new(
            model(
                r#"
name: spin
states:
  - { id: init, kind: initial, transitions: [{ target: A }] }
  - id: A
    transitions: [{ event: go, target: B }]
  - id: B
    transitions: [{ target: C }]
  - id: C
    transitions: [{ target: B }]
"#,
            ),
            "spin-1",
        )
        .with_max_microsteps(50);
        interp.start().unwrap();

        let err = interp.process(Event::external("go")).unwrap_err();
        assert!(err.reason.contains("50"));
        assert_eq!(interp.status(), Status::Failed);
        assert!(interp.process(Event::external("go")).is_err());
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_fatal_fault_log_names_instance() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::ERROR)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut interp = Interpreter::new(model(COUNTER), "counter-7");
            assert!(interp.process(Event::external("increment")).is_err());
        });

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("instance_id=counter-7"), "{}", output);
        assert!(output.contains("fatal fault"), "{}", output);
    }

    #[test]
    fn test_evaluation_error_keeps_configuration() {
        let mut interp = started(
            r#"
name: faulty
variables:
  n: { type: int, initial: 1 }
  seen: { type: int }
states:
  - { id: init, kind: initial, transitions: [{ target: A }] }
  - id: A
    transitions:
      - event: go
        target: B
        actions:
          - { assign: "seen := seen + 1" }
          - { assign: "n := 10 / (n - 1)" }
      - { event: fix, target: A, actions: [{ assign: "n := 2" }] }
  - { id: B }
"#,
        );
        let report = send(&mut interp, "go");
        assert!(report.fired.is_empty());
        assert_eq!(report.faults.len(), 1);
        assert!(matches!(report.faults[0].error, EvaluationError::Arithmetic { .. }));
        assert_eq!(report.faults[0].location, "A --go--> B");
        assert!(!report.discarded);
        assert_eq!(interp.active_paths(), vec!["A"]);
        assert_eq!(interp.context().get("seen"), Some(&json!(1)));
        assert_eq!(interp.status(), Status::Idle);

        send(&mut interp, "fix");
        send(&mut interp, "go");
        assert_eq!(interp.active_paths(), vec!["B"]);
        assert_eq!(interp.context().get("n"), Some(&json!(10)));
    }

    #[test]
    fn test_guard_fault_only_affects_its_region() {
        let mut interp = started(
            r#"
name: regions
variables:
  a: { type: int }
states:
  - { id: init, kind: initial, transitions: [{ target: P }] }
  - id: P
    kind: parallel
    regions:
      - id: good
        states:
          - { id: init, kind: initial, transitions: [{ target: X }] }
          - id: X
            transitions: [{ event: go, target: Y }]
          - { id: Y }
      - id: bad
        states:
          - { id: init, kind: initial, transitions: [{ target: X }] }
          - id: X
            transitions: [{ event: go, target: Y, guard: "$.level > 3" }]
          - { id: Y }
"#,
        );
        let report = send(&mut interp, "go");
        assert_eq!(report.faults.len(), 1);
        assert_eq!(interp.active_paths(), vec!["P", "P.good.Y", "P.bad.X"]);

        let event = Event::external("go").with_payload(json!({ "level": 5 }));
        interp.process(event).unwrap();
        assert_eq!(interp.active_paths(), vec!["P", "P.good.Y", "P.bad.Y"]);
    }

    #[test]
    fn test_payload_and_else_branch() {
        let mut interp = started(
            r#"
name: payload
variables:
  total: { type: float }
states:
  - { id: init, kind: initial, transitions: [{ target: Open }] }
  - id: Open
    transitions:
      - event: pay
        target: Paid
        guard: "$.amount >= 10"
        else: Rejected
        actions: [{ assign: "total := total + $.amount" }]
  - id: Paid
  - id: Rejected
    transitions: [{ event: retry, target: Open }]
"#,
        );
        interp
            .process(Event::external("pay").with_payload(json!({ "amount": 3 })))
            .unwrap();
        assert_eq!(interp.active_paths(), vec!["Rejected"]);
        assert_eq!(interp.context().get("total"), Some(&json!(0.0)));

        send(&mut interp, "retry");
        let report = interp
            .process(Event::external("pay").with_payload(json!({ "amount": 12 })))
            .unwrap();
        assert_eq!(report.fired[0].targets, vec!["Paid"]);
        assert_eq!(interp.context().get("total"), Some(&json!(12.0)));
    }

    #[test]
    fn test_invoke_match_and_timers() {
        let mut interp = started(
            r#"
name: effects
variables:
  mode: { type: string, initial: "fast" }
  tries: { type: int }
states:
  - { id: init, kind: initial, transitions: [{ target: Waiting }] }
  - id: Waiting
    after:
      - { name: poll, delay_ms: 250, event: poll, repeat: true }
    transitions:
      - event: poll
        actions:
          - match:
              value: mode
              cases:
                - { when: "'fast'", actions: [{ assign: "tries := tries + 1" }] }
              default: [{ assign: "tries := 0" }]
          - { invoke: { service: lookup, input: "tries" } }
          - { reset_timer: poll }
      - { event: stop, target: Stopped }
  - { id: Stopped, kind: final }
"#,
        );
        let report = send(&mut interp, "poll");
        assert_eq!(interp.context().get("tries"), Some(&json!(1)));
        assert_eq!(interp.active_paths(), vec!["Waiting"]);
        assert_eq!(report.effects.len(), 3);
        match &report.effects[0] {
            Effect::Invoke(req) => {
                assert_eq!(req.id, "test-1-1");
                assert_eq!(req.service, "lookup");
                assert_eq!(req.input, json!(1));
                assert_eq!(req.done_event, "done.invoke.lookup");
                assert_eq!(req.error_event, "error.invoke.lookup");
            }
            other => panic!("unexpected effect {:?}", other),
        }
        assert_eq!(report.effects[1], Effect::CancelTimer("Waiting/poll".to_string()));
        assert!(matches!(&report.effects[2], Effect::StartTimer(t) if t.delay == Duration::from_millis(250)));

        let report = send(&mut interp, "stop");
        assert_eq!(report.effects, vec![Effect::CancelTimer("Waiting/poll".to_string())]);
    }

    #[test]
    fn test_start_reports_initial_timers() {
        let mut interp = Interpreter::new(
            model(
                r#"
name: timers
states:
  - { id: init, kind: initial, transitions: [{ target: A }] }
  - id: A
    after: [{ name: t, delay_ms: "1000 * 2", event: timeout }]
    transitions: [{ event: timeout, target: B }]
  - { id: B }
"#,
            ),
            "t-1",
        );
        let report = interp.start().unwrap();
        assert_eq!(
            report.effects,
            vec![Effect::StartTimer(TimerRequest {
                key: "A/t".to_string(),
                delay: Duration::from_millis(2000),
                event: "timeout".to_string(),
                repeat: false,
            })]
        );
    }

    #[test]
    fn test_checkpoint_restore_roundtrip() {
        let mut interp = started(COUNTER);
        send(&mut interp, "start");
        send(&mut interp, "tick");
        let checkpoint = interp.checkpoint();
        assert_eq!(checkpoint.configuration, vec!["Running"]);

        let mut resumed = Interpreter::new(Arc::clone(interp.model()), "test-1");
        resumed.restore(&checkpoint).unwrap();
        for name in ["tick", "tick", "tick"] {
            send(&mut interp, name);
            send(&mut resumed, name);
        }
        assert_eq!(resumed.configuration(), interp.configuration());
        assert_eq!(resumed.context(), interp.context());
        assert_eq!(resumed.status(), Status::Completed);
    }

    #[test]
    fn test_restore_rejects_other_model() {
        let mut interp = started(COUNTER);
        let mut checkpoint = interp.checkpoint();
        checkpoint.model_version = "1-0000000000000000".to_string();
        let err = interp.restore(&checkpoint).unwrap_err();
        assert_eq!(err.error_code(), "MODEL_VERSION_MISMATCH");

        let mut checkpoint = interp.checkpoint();
        checkpoint.configuration = vec!["Nowhere".to_string()];
        assert_eq!(interp.restore(&checkpoint).unwrap_err().error_code(), "INVALID_CHECKPOINT");
    }

    fn events() -> impl Strategy<Value = Vec<&'static str>> {
        proptest::collection::vec(
            prop_oneof![Just("open"), Just("close"), Just("lock"), Just("alarm"), Just("reset"), Just("noise")],
            0..30,
        )
    }

    proptest! {
        #[test]
        fn test_configuration_always_legal(names in events()) {
            let mut interp = started(DOORS);
            for name in names {
                send(&mut interp, name);
                prop_assert!(interp.model().check_configuration(interp.configuration()).is_ok());
            }
        }

        #[test]
        fn test_resume_matches_uninterrupted_run(names in events(), split in 0usize..30) {
            let mut full = started(DOORS);
            let mut partial = started(DOORS);
            let split = split.min(names.len());
            for name in &names[..split] {
                send(&mut full, name);
                send(&mut partial, name);
            }
            let mut resumed = Interpreter::new(Arc::clone(partial.model()), "test-1");
            resumed.restore(&partial.checkpoint()).unwrap();
            for name in &names[split..] {
                send(&mut full, name);
                send(&mut resumed, name);
            }
            prop_assert_eq!(full.configuration(), resumed.configuration());
            prop_assert_eq!(full.context(), resumed.context());
        }

        #[test]
        fn test_parallel_order_does_not_matter(count in 1usize..5) {
            // Sibling regions write disjoint variables, so the outcome is the
            // same whichever region's transition runs first.
            let mut interp = started(DOORS);
            for _ in 0..count {
                send(&mut interp, "open");
                send(&mut interp, "close");
            }
            prop_assert_eq!(interp.context().get("front"), Some(&json!(count)));
            prop_assert_eq!(interp.context().get("back"), Some(&json!(count * 10)));
        }
    }
}
