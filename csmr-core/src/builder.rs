//! Model construction and validation.
//!
//! Building runs in three passes: allocate the state and region arenas in
//! document order, compile transitions, actions and expressions against the
//! variable schema, then check whole-model properties (reachability,
//! ambiguity, conflicting parallel writes). Every violation is collected.

use crate::description::{
    ActionDescription, MachineDescription, StateDescription, StateKind, TransitionDescription,
};
use crate::error::{ValidationError, Violation, ViolationKind};
use crate::expr::{ExprRef, ExpressionLanguage};
use crate::model::{
    Action, InvokeAction, MatchCase, Model, RegionId, RegionNode, StateId, StateNode, Timer,
    TransitionId, TransitionNode,
};
use crate::value::{ValueType, VariableSchema};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

/// Region under construction; initial and default are filled in as they are found.
struct RegionDraft {
    name: String,
    owner: Option<StateId>,
    states: Vec<StateId>,
    initial: Option<StateId>,
    default: Option<StateId>,
}

pub(crate) struct Builder<'a> {
    desc: &'a MachineDescription,
    language: &'a dyn ExpressionLanguage,
    schema: VariableSchema,
    states: Vec<StateNode>,
    sources: Vec<&'a StateDescription>,
    regions: Vec<RegionDraft>,
    transitions: Vec<TransitionNode>,
    timer_names: HashSet<&'a str>,
    violations: Vec<Violation>,
}

impl<'a> Builder<'a> {
    pub(crate) fn new(desc: &'a MachineDescription, language: &'a dyn ExpressionLanguage) -> Self {
        Self {
            desc,
            language,
            schema: VariableSchema::new(),
            states: Vec::new(),
            sources: Vec::new(),
            regions: Vec::new(),
            transitions: Vec::new(),
            timer_names: HashSet::new(),
            violations: Vec::new(),
        }
    }

    pub(crate) fn build(mut self) -> Result<Model, ValidationError> {
        let desc = self.desc;
        self.declare_variables();
        let root = self.alloc_region(String::new(), None, &desc.states, 0, "");
        self.compile_states();
        self.check_ambiguity();
        self.check_reachability(root);
        self.check_parallel_writes();

        let fingerprint = match serde_json::to_vec(self.desc) {
            Ok(bytes) => hex::encode(Sha256::digest(&bytes))[..16].to_string(),
            Err(e) => {
                self.violate(ViolationKind::Malformed, "document", e.to_string());
                String::new()
            }
        };

        let mut regions = Vec::with_capacity(self.regions.len());
        for (i, draft) in self.regions.into_iter().enumerate() {
            match (draft.initial, draft.default) {
                (Some(initial), Some(default)) => regions.push(RegionNode {
                    id: RegionId(i as u32),
                    name: draft.name,
                    owner: draft.owner,
                    states: draft.states,
                    initial,
                    default,
                }),
                // Already reported while allocating or compiling the region.
                _ => {
                    if self.violations.is_empty() {
                        self.violations.push(Violation {
                            kind: ViolationKind::MissingInitial,
                            location: draft.name,
                            message: "region has no usable initial pseudostate".to_string(),
                        });
                    }
                }
            }
        }

        if !self.violations.is_empty() {
            return Err(ValidationError {
                model: self.desc.name.clone(),
                violations: self.violations,
            });
        }

        let by_path: HashMap<String, StateId> =
            self.states.iter().map(|s| (s.path.clone(), s.id)).collect();

        tracing::debug!(
            "built model {} v{}: {} states, {} regions, {} transitions",
            self.desc.name,
            self.desc.version,
            self.states.len(),
            regions.len(),
            self.transitions.len()
        );

        Ok(Model {
            name: self.desc.name.clone(),
            version: self.desc.version,
            fingerprint,
            schema: self.schema,
            states: self.states,
            regions,
            transitions: self.transitions,
            root,
            by_path,
            description: self.desc.clone(),
        })
    }

    fn violate(&mut self, kind: ViolationKind, location: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation {
            kind,
            location: location.into(),
            message: message.into(),
        });
    }

    fn declare_variables(&mut self) {
        for (name, var) in &self.desc.variables {
            let initial = match &var.initial {
                Some(value) if !var.ty.accepts(value) => {
                    self.violate(
                        ViolationKind::InvalidInitialValue,
                        format!("variable '{}'", name),
                        format!("initial value {} is not a {}", value, var.ty),
                    );
                    var.ty.default_value()
                }
                Some(value) => value.clone(),
                None => var.ty.default_value(),
            };
            self.schema.declare(name.clone(), var.ty, initial);
        }
    }

    // =========================================================================
    // Pass 1: arenas
    // =========================================================================

    fn alloc_region(
        &mut self,
        name: String,
        owner: Option<StateId>,
        states: &'a [StateDescription],
        depth: u32,
        prefix: &str,
    ) -> RegionId {
        let rid = RegionId(self.regions.len() as u32);
        let location = if prefix.is_empty() {
            "top-level region".to_string()
        } else {
            format!("region '{}'", prefix)
        };
        self.regions.push(RegionDraft {
            name,
            owner,
            states: Vec::new(),
            initial: None,
            default: None,
        });

        let mut seen = HashSet::new();
        let mut initials = 0;
        for sd in states {
            if !seen.insert(sd.id.as_str()) {
                self.violate(
                    ViolationKind::DuplicateState,
                    location.clone(),
                    format!("state id '{}' is used more than once", sd.id),
                );
            }
            let sid = self.alloc_state(sd, rid, depth, prefix);
            if sd.kind == StateKind::Initial {
                initials += 1;
                self.regions[rid.index()].initial.get_or_insert(sid);
            }
        }

        match initials {
            0 => self.violate(
                ViolationKind::MissingInitial,
                location,
                "region has no initial pseudostate",
            ),
            1 => {}
            n => self.violate(
                ViolationKind::MultipleInitial,
                location,
                format!("region has {} initial pseudostates", n),
            ),
        }
        rid
    }

    fn alloc_state(
        &mut self,
        sd: &'a StateDescription,
        region: RegionId,
        depth: u32,
        prefix: &str,
    ) -> StateId {
        let sid = StateId(self.states.len() as u32);
        let path = if prefix.is_empty() {
            sd.id.clone()
        } else {
            format!("{}.{}", prefix, sd.id)
        };
        self.states.push(StateNode {
            id: sid,
            name: sd.id.clone(),
            path: path.clone(),
            kind: sd.kind,
            region,
            regions: Vec::new(),
            entry: Vec::new(),
            exit: Vec::new(),
            timers: Vec::new(),
            transitions: Vec::new(),
            depth,
        });
        self.sources.push(sd);
        self.regions[region.index()].states.push(sid);
        for timer in &sd.after {
            self.timer_names.insert(timer.name.as_str());
        }

        match sd.kind {
            StateKind::Composite => {
                if !sd.regions.is_empty() {
                    self.violate(
                        ViolationKind::InvalidNesting,
                        path.clone(),
                        "composite state cannot declare regions, use a parallel state",
                    );
                }
                if sd.states.is_empty() {
                    self.violate(
                        ViolationKind::InvalidNesting,
                        path.clone(),
                        "composite state has no child states",
                    );
                } else {
                    let child = self.alloc_region(String::new(), Some(sid), &sd.states, depth + 1, &path);
                    self.states[sid.index()].regions.push(child);
                }
            }
            StateKind::Parallel => {
                if !sd.states.is_empty() {
                    self.violate(
                        ViolationKind::InvalidNesting,
                        path.clone(),
                        "parallel state children must be grouped in regions",
                    );
                }
                if sd.regions.is_empty() {
                    self.violate(
                        ViolationKind::InvalidNesting,
                        path.clone(),
                        "parallel state has no regions",
                    );
                }
                let mut names = HashSet::new();
                for rd in &sd.regions {
                    if !names.insert(rd.id.as_str()) {
                        self.violate(
                            ViolationKind::DuplicateState,
                            path.clone(),
                            format!("region id '{}' is used more than once", rd.id),
                        );
                    }
                    let region_path = format!("{}.{}", path, rd.id);
                    let child =
                        self.alloc_region(rd.id.clone(), Some(sid), &rd.states, depth + 1, &region_path);
                    self.states[sid.index()].regions.push(child);
                }
            }
            StateKind::Simple | StateKind::Final | StateKind::Initial => {
                if !sd.states.is_empty() || !sd.regions.is_empty() {
                    self.violate(
                        ViolationKind::InvalidNesting,
                        path.clone(),
                        format!("{:?} state cannot have children", sd.kind).to_lowercase(),
                    );
                }
            }
        }
        sid
    }

    // =========================================================================
    // Pass 2: transitions, actions, expressions
    // =========================================================================

    fn compile_states(&mut self) {
        for index in 0..self.states.len() {
            let sid = StateId(index as u32);
            let sd = self.sources[index];
            let path = self.states[index].path.clone();

            if sd.kind == StateKind::Initial {
                self.compile_pseudostate(sid, sd, &path);
                continue;
            }
            if sd.kind == StateKind::Final && !sd.transitions.is_empty() {
                self.violate(
                    ViolationKind::InvalidFinalState,
                    path.clone(),
                    "final state cannot have outgoing transitions",
                );
            }

            let entry = self.compile_actions(&sd.entry, &format!("{} (entry)", path), true);
            let exit = self.compile_actions(&sd.exit, &format!("{} (exit)", path), true);
            let timers = sd
                .after
                .iter()
                .filter_map(|t| {
                    let location = format!("{} (timer '{}')", path, t.name);
                    let delay = self.check_expr(&t.delay_ms, &location)?;
                    let ty = delay.result_type(&self.schema);
                    if !matches!(ty, ValueType::Int | ValueType::Float | ValueType::Any) {
                        self.violate(
                            ViolationKind::TypeMismatch,
                            location,
                            format!("timer delay must be numeric, found {}", ty),
                        );
                    }
                    Some(Timer {
                        name: t.name.clone(),
                        delay,
                        event: t.event.clone(),
                        repeat: t.repeat,
                    })
                })
                .collect();

            let mut ids = Vec::with_capacity(sd.transitions.len());
            for td in &sd.transitions {
                if let Some(id) = self.compile_transition(sid, td) {
                    ids.push(id);
                }
            }
            ids.sort_by_key(|&id| (std::cmp::Reverse(self.transitions[id.index()].priority), id));

            let state = &mut self.states[index];
            state.entry = entry;
            state.exit = exit;
            state.timers = timers;
            state.transitions = ids;
        }
    }

    fn compile_pseudostate(&mut self, sid: StateId, sd: &StateDescription, path: &str) {
        let malformed = sd.transitions.len() != 1
            || !sd.entry.is_empty()
            || !sd.exit.is_empty()
            || !sd.after.is_empty();
        let transition = match sd.transitions.first() {
            Some(t) if !malformed => t,
            _ => {
                self.violate(
                    ViolationKind::InvalidPseudostate,
                    path,
                    "initial pseudostate must have exactly one transition and no actions or timers",
                );
                return;
            }
        };
        if transition.event.is_some()
            || transition.guard.is_some()
            || !transition.actions.is_empty()
            || !transition.else_target.is_empty()
            || transition.target.len() != 1
        {
            self.violate(
                ViolationKind::InvalidPseudostate,
                path,
                "initial transition must be eventless, unguarded, without actions and name one target",
            );
            return;
        }

        let region = self.states[sid.index()].region;
        let name = &transition.target[0];
        let target = self.regions[region.index()]
            .states
            .iter()
            .copied()
            .find(|&s| self.states[s.index()].name == *name);
        match target {
            Some(t) if self.states[t.index()].kind != StateKind::Initial => {
                self.regions[region.index()].default = Some(t);
            }
            _ => self.violate(
                ViolationKind::InvalidPseudostate,
                path,
                format!(
                    "initial transition target '{}' is not a state of the same region",
                    name
                ),
            ),
        }
    }

    fn compile_transition(&mut self, source: StateId, td: &TransitionDescription) -> Option<TransitionId> {
        let source_path = &self.states[source.index()].path;
        let label = format!(
            "{} --{}--> {}",
            source_path,
            td.event.as_deref().unwrap_or("always"),
            if td.target.is_empty() {
                "(internal)".to_string()
            } else {
                td.target.join(", ")
            }
        );

        let targets = self.resolve_targets(source, &td.target, &label)?;
        let else_targets = self.resolve_targets(source, &td.else_target, &label)?;
        if !td.else_target.is_empty() && td.guard.is_none() {
            self.violate(
                ViolationKind::InvalidTarget,
                label.clone(),
                "else target requires a guard",
            );
        }

        let guard = match &td.guard {
            None => None,
            Some(src) => {
                let desc = self.desc;
                let guard = match src.strip_prefix('@') {
                    Some(name) => match desc.guards.get(name) {
                        Some(named) => self.check_expr(named, &label),
                        None => {
                            self.violate(
                                ViolationKind::UnknownReference,
                                label.clone(),
                                format!("unknown named guard '{}'", name),
                            );
                            None
                        }
                    },
                    None => self.check_expr(src, &label),
                };
                if let Some(g) = &guard {
                    let ty = g.result_type(&self.schema);
                    if !matches!(ty, ValueType::Bool | ValueType::Any) {
                        self.violate(
                            ViolationKind::TypeMismatch,
                            label.clone(),
                            format!("guard '{}' is {}, not bool", g.source(), ty),
                        );
                    }
                }
                guard
            }
        };

        let actions = self.compile_actions(&td.actions, &label, true);
        let id = TransitionId(self.transitions.len() as u32);
        self.transitions.push(TransitionNode {
            id,
            source,
            event: td.event.clone(),
            guard,
            actions,
            targets,
            else_targets,
            priority: td.priority,
            label,
        });
        Some(id)
    }

    fn resolve_targets(&mut self, source: StateId, names: &[String], label: &str) -> Option<Vec<StateId>> {
        let mut targets = Vec::with_capacity(names.len());
        let mut ok = true;
        for name in names {
            match self.resolve(source, name) {
                Ok(t) if self.states[t.index()].kind == StateKind::Initial => {
                    self.violate(
                        ViolationKind::InvalidTarget,
                        label,
                        format!("'{}' is an initial pseudostate", name),
                    );
                    ok = false;
                }
                Ok(t) => targets.push(t),
                Err((kind, message)) => {
                    self.violate(kind, label, message);
                    ok = false;
                }
            }
        }

        for (i, &a) in targets.iter().enumerate() {
            for &b in &targets[i + 1..] {
                if !self.orthogonal(a, b) {
                    self.violate(
                        ViolationKind::InvalidTarget,
                        label,
                        format!(
                            "targets '{}' and '{}' are not in orthogonal regions",
                            self.states[a.index()].path,
                            self.states[b.index()].path
                        ),
                    );
                    ok = false;
                }
            }
        }
        ok.then_some(targets)
    }

    /// Resolves a target name: dotted names are absolute paths, plain names are
    /// looked up in the source's children, then its region and enclosing regions,
    /// then anywhere if unique.
    fn resolve(&self, source: StateId, name: &str) -> Result<StateId, (ViolationKind, String)> {
        if name.contains('.') {
            return self
                .states
                .iter()
                .find(|s| s.path == name)
                .map(|s| s.id)
                .ok_or_else(|| (ViolationKind::UnresolvedTarget, format!("no state at path '{}'", name)));
        }

        let find_in = |region: RegionId| {
            self.regions[region.index()]
                .states
                .iter()
                .copied()
                .find(|&s| self.states[s.index()].name == name)
        };

        for &child in &self.states[source.index()].regions {
            if let Some(found) = find_in(child) {
                return Ok(found);
            }
        }

        let mut region = Some(self.states[source.index()].region);
        while let Some(r) = region {
            if let Some(found) = find_in(r) {
                return Ok(found);
            }
            region = self.regions[r.index()]
                .owner
                .map(|owner| self.states[owner.index()].region);
        }

        let matches: Vec<StateId> = self
            .states
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.id)
            .collect();
        match matches.as_slice() {
            [single] => Ok(*single),
            [] => Err((ViolationKind::UnresolvedTarget, format!("unknown state '{}'", name))),
            _ => Err((
                ViolationKind::AmbiguousTarget,
                format!("state name '{}' is ambiguous, use its full path", name),
            )),
        }
    }

    fn parent(&self, id: StateId) -> Option<StateId> {
        self.regions[self.states[id.index()].region.index()].owner
    }

    fn ancestors(&self, id: StateId) -> Vec<StateId> {
        std::iter::successors(self.parent(id), |&p| self.parent(p)).collect()
    }

    /// Two targets can be entered together only from different regions of a parallel state.
    fn orthogonal(&self, a: StateId, b: StateId) -> bool {
        let a_chain = self.ancestors(a);
        let b_chain = self.ancestors(b);
        if a == b || a_chain.contains(&b) || b_chain.contains(&a) {
            return false;
        }
        let common = match a_chain.iter().copied().find(|s| b_chain.contains(s)) {
            Some(c) => c,
            None => return false,
        };
        if self.states[common.index()].kind != StateKind::Parallel {
            return false;
        }
        let region_under = |x: StateId, chain: &[StateId]| {
            let child = chain
                .iter()
                .copied()
                .take_while(|&s| s != common)
                .last()
                .unwrap_or(x);
            self.states[child.index()].region
        };
        region_under(a, &a_chain) != region_under(b, &b_chain)
    }

    fn compile_actions(&mut self, actions: &[ActionDescription], location: &str, allow_use: bool) -> Vec<Action> {
        actions
            .iter()
            .filter_map(|a| self.compile_action(a, location, allow_use))
            .collect()
    }

    fn compile_action(&mut self, action: &ActionDescription, location: &str, allow_use: bool) -> Option<Action> {
        match action {
            ActionDescription::Assign(src) => {
                let (variable, value) = match self.language.compile_assignment(src) {
                    Ok(compiled) => compiled,
                    Err(e) => {
                        self.violate(ViolationKind::InvalidExpression, location, e.to_string());
                        return None;
                    }
                };
                self.check_references(&value, location);
                let declared = match self.schema.type_of(&variable) {
                    Some(ty) => ty,
                    None => {
                        self.violate(
                            ViolationKind::UndeclaredVariable,
                            location,
                            format!("{} assigns undeclared variable '{}'", subject(location), variable),
                        );
                        return None;
                    }
                };
                let ty = value.result_type(&self.schema);
                if !declared.is_assignable_from(ty) {
                    self.violate(
                        ViolationKind::TypeMismatch,
                        location,
                        format!("cannot assign {} to '{}' of type {}", ty, variable, declared),
                    );
                }
                Some(Action::Assign { variable, value })
            }
            ActionDescription::Raise(raise) => {
                let payload = match &raise.payload {
                    Some(src) => Some(self.check_expr(src, location)?),
                    None => None,
                };
                Some(Action::Raise {
                    event: raise.event.clone(),
                    channel: raise.channel,
                    payload,
                })
            }
            ActionDescription::Invoke(invoke) => {
                let input = match &invoke.input {
                    Some(src) => Some(self.check_expr(src, location)?),
                    None => None,
                };
                Some(Action::Invoke(InvokeAction {
                    service: invoke.service.clone(),
                    input,
                    timeout: Duration::from_millis(invoke.timeout_ms),
                    done_event: invoke
                        .done
                        .clone()
                        .unwrap_or_else(|| format!("done.invoke.{}", invoke.service)),
                    error_event: invoke
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("error.invoke.{}", invoke.service)),
                    local: invoke.local,
                }))
            }
            ActionDescription::Match(m) => {
                let value = self.check_expr(&m.value, location);
                let cases: Vec<MatchCase> = m
                    .cases
                    .iter()
                    .filter_map(|case| {
                        let when = self.check_expr(&case.when, location)?;
                        let actions = self.compile_actions(&case.actions, location, allow_use);
                        Some(MatchCase { when, actions })
                    })
                    .collect();
                let default = self.compile_actions(&m.default, location, allow_use);
                Some(Action::Match {
                    value: value?,
                    cases,
                    default,
                })
            }
            ActionDescription::ResetTimer(name) => {
                if !self.timer_names.contains(name.as_str()) {
                    self.violate(
                        ViolationKind::UnknownReference,
                        location,
                        format!("unknown timer '{}'", name),
                    );
                    return None;
                }
                Some(Action::ResetTimer(name.clone()))
            }
            ActionDescription::Use(name) => {
                let desc = self.desc;
                let named = match desc.actions.get(name) {
                    Some(named) if allow_use => named,
                    Some(_) => {
                        self.violate(
                            ViolationKind::UnknownReference,
                            location,
                            format!("named action '{}' cannot be used inside another named action", name),
                        );
                        return None;
                    }
                    None => {
                        self.violate(
                            ViolationKind::UnknownReference,
                            location,
                            format!("unknown named action '{}'", name),
                        );
                        return None;
                    }
                };
                self.compile_action(named, &format!("{} (action '{}')", location, name), false)
            }
        }
    }

    /// Compiles an expression and checks its variables and operand types.
    fn check_expr(&mut self, src: &str, location: &str) -> Option<ExprRef> {
        let expr = match self.language.compile(src) {
            Ok(expr) => expr,
            Err(e) => {
                self.violate(ViolationKind::InvalidExpression, location, e.to_string());
                return None;
            }
        };
        self.check_references(&expr, location);
        Some(expr)
    }

    fn check_references(&mut self, expr: &ExprRef, location: &str) {
        for name in expr.references() {
            if !self.schema.contains(&name) {
                self.violate(
                    ViolationKind::UndeclaredVariable,
                    location,
                    format!(
                        "{} references undeclared variable '{}'",
                        subject(location),
                        name
                    ),
                );
            }
        }
        if let Some(message) = expr.type_error(&self.schema) {
            self.violate(
                ViolationKind::TypeMismatch,
                location,
                format!("{} in '{}'", message, expr.source()),
            );
        }
    }

    // =========================================================================
    // Pass 3: whole-model checks
    // =========================================================================

    fn check_ambiguity(&mut self) {
        let mut found = Vec::new();
        for state in &self.states {
            for (i, &a) in state.transitions.iter().enumerate() {
                for &b in &state.transitions[i + 1..] {
                    let (ta, tb) = (&self.transitions[a.index()], &self.transitions[b.index()]);
                    if ta.event == tb.event
                        && ta.priority == tb.priority
                        && ta.is_unconditional()
                        && tb.is_unconditional()
                    {
                        found.push((
                            state.path.clone(),
                            format!(
                                "transitions '{}' and '{}' have equal priority and no distinguishing guard",
                                ta.label, tb.label
                            ),
                        ));
                    }
                }
            }
        }
        for (location, message) in found {
            self.violate(ViolationKind::AmbiguousTransition, location, message);
        }
    }

    fn check_reachability(&mut self, root: RegionId) {
        let mut reached = vec![false; self.states.len()];
        let mut pending = Vec::new();
        let mark = |s: StateId, reached: &mut Vec<bool>, pending: &mut Vec<StateId>| {
            if !reached[s.index()] {
                reached[s.index()] = true;
                pending.push(s);
            }
        };

        if let Some(default) = self.regions[root.index()].default {
            mark(default, &mut reached, &mut pending);
        }
        while let Some(s) = pending.pop() {
            for a in self.ancestors(s) {
                mark(a, &mut reached, &mut pending);
            }
            for &r in &self.states[s.index()].regions {
                if let Some(default) = self.regions[r.index()].default {
                    mark(default, &mut reached, &mut pending);
                }
            }
            for &t in &self.states[s.index()].transitions {
                let t = &self.transitions[t.index()];
                for &target in t.targets.iter().chain(&t.else_targets) {
                    mark(target, &mut reached, &mut pending);
                }
            }
        }

        let unreachable: Vec<String> = self
            .states
            .iter()
            .filter(|s| !reached[s.id.index()] && s.kind != StateKind::Initial)
            .map(|s| s.path.clone())
            .collect();
        for path in unreachable {
            self.violate(
                ViolationKind::UnreachableState,
                path,
                "state is not reachable from its region's initial pseudostate",
            );
        }
    }

    fn in_region(&self, state: StateId, region: RegionId) -> bool {
        let mut current = self.states[state.index()].region;
        loop {
            if current == region {
                return true;
            }
            match self.regions[current.index()].owner {
                Some(owner) => current = self.states[owner.index()].region,
                None => return false,
            }
        }
    }

    fn region_writes(&self, region: RegionId) -> BTreeSet<String> {
        let mut writes = BTreeSet::new();
        for state in self.states.iter().filter(|s| self.in_region(s.id, region)) {
            let transition_actions = state
                .transitions
                .iter()
                .flat_map(|t| &self.transitions[t.index()].actions);
            for action in state.entry.iter().chain(&state.exit).chain(transition_actions) {
                action.collect_writes(&mut writes);
            }
        }
        writes
    }

    fn check_parallel_writes(&mut self) {
        let mut found = Vec::new();
        for state in self.states.iter().filter(|s| s.kind == StateKind::Parallel) {
            let writes: Vec<(RegionId, BTreeSet<String>)> = state
                .regions
                .iter()
                .map(|&r| (r, self.region_writes(r)))
                .collect();
            for (i, (ra, wa)) in writes.iter().enumerate() {
                for (rb, wb) in &writes[i + 1..] {
                    for variable in wa.intersection(wb) {
                        found.push((
                            state.path.clone(),
                            format!(
                                "variable '{}' is written by sibling regions '{}' and '{}'",
                                variable,
                                self.regions[ra.index()].name,
                                self.regions[rb.index()].name
                            ),
                        ));
                    }
                }
            }
        }
        for (location, message) in found {
            self.violate(ViolationKind::ConflictingWrite, location, message);
        }
    }
}

/// Names the owner of an expression in messages: transitions by label, anything else by location.
fn subject(location: &str) -> String {
    if location.contains("-->") {
        format!("transition '{}'", location)
    } else {
        format!("'{}'", location)
    }
}
