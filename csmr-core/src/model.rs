//! Validated, immutable state machine model.
//!
//! States, regions and transitions live in arenas and refer to each other by
//! index. State ids are assigned in document pre-order, so comparing ids
//! compares document order.

use crate::builder::Builder;
use crate::description::{MachineDescription, StateKind};
use crate::error::{ValidationError, Violation, ViolationKind};
use crate::event::Channel;
use crate::expr::{ExprRef, ExpressionLanguage, NativeLanguage};
use crate::value::VariableSchema;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_id!(
    /// Index of a state in its model.
    StateId
);
arena_id!(
    /// Index of a region in its model.
    RegionId
);
arena_id!(
    /// Index of a transition in its model. Also its document order.
    TransitionId
);

/// Set of active states, pseudostates excluded.
pub type Configuration = BTreeSet<StateId>;

/// A compiled action.
#[derive(Debug, Clone)]
pub enum Action {
    Assign {
        variable: String,
        value: ExprRef,
    },
    Raise {
        event: String,
        channel: Channel,
        payload: Option<ExprRef>,
    },
    Invoke(InvokeAction),
    Match {
        value: ExprRef,
        cases: Vec<MatchCase>,
        default: Vec<Action>,
    },
    ResetTimer(String),
}

impl Action {
    /// Adds the variables this action may write.
    pub(crate) fn collect_writes(&self, out: &mut BTreeSet<String>) {
        match self {
            Action::Assign { variable, .. } => {
                out.insert(variable.clone());
            }
            Action::Match { cases, default, .. } => {
                for action in cases.iter().flat_map(|c| &c.actions).chain(default) {
                    action.collect_writes(out);
                }
            }
            Action::Raise { .. } | Action::Invoke(_) | Action::ResetTimer(_) => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchCase {
    pub when: ExprRef,
    pub actions: Vec<Action>,
}

/// A service call requested by an action.
#[derive(Debug, Clone)]
pub struct InvokeAction {
    pub service: String,
    pub input: Option<ExprRef>,
    pub timeout: Duration,
    pub done_event: String,
    pub error_event: String,
    pub local: bool,
}

/// A timer owned by a state.
#[derive(Debug, Clone)]
pub struct Timer {
    pub name: String,
    /// Delay in milliseconds.
    pub delay: ExprRef,
    pub event: String,
    pub repeat: bool,
}

#[derive(Debug, Clone)]
pub struct StateNode {
    pub id: StateId,
    /// Identifier within the parent region.
    pub name: String,
    /// Dotted path from the top-level region, parallel region ids included.
    pub path: String,
    pub kind: StateKind,
    /// Region containing this state.
    pub region: RegionId,
    /// Child regions: one for composite states, one per region for parallel states.
    pub regions: Vec<RegionId>,
    pub entry: Vec<Action>,
    pub exit: Vec<Action>,
    pub timers: Vec<Timer>,
    /// Outgoing transitions, highest priority first, then document order.
    pub transitions: Vec<TransitionId>,
    /// Number of ancestor states.
    pub depth: u32,
}

impl StateNode {
    pub fn is_pseudostate(&self) -> bool {
        self.kind == StateKind::Initial
    }

    pub fn is_final(&self) -> bool {
        self.kind == StateKind::Final
    }

    pub fn is_compound(&self) -> bool {
        matches!(self.kind, StateKind::Composite | StateKind::Parallel)
    }
}

#[derive(Debug, Clone)]
pub struct RegionNode {
    pub id: RegionId,
    /// Empty for the top-level region and for the implicit region of a composite state.
    pub name: String,
    pub owner: Option<StateId>,
    pub states: Vec<StateId>,
    /// The initial pseudostate.
    pub initial: StateId,
    /// Target of the initial pseudostate.
    pub default: StateId,
}

#[derive(Debug, Clone)]
pub struct TransitionNode {
    pub id: TransitionId,
    pub source: StateId,
    /// `None` for eventless transitions.
    pub event: Option<String>,
    pub guard: Option<ExprRef>,
    pub actions: Vec<Action>,
    /// Empty for targetless transitions, which neither exit nor enter states.
    pub targets: Vec<StateId>,
    pub else_targets: Vec<StateId>,
    pub priority: i32,
    /// Human readable label, e.g. `Idle --start--> Running`.
    pub label: String,
}

impl TransitionNode {
    pub fn is_eventless(&self) -> bool {
        self.event.is_none()
    }

    /// Returns true if the transition is triggered by the given event (`None` = eventless).
    pub fn is_triggered_by(&self, event: Option<&str>) -> bool {
        self.event.as_deref() == event
    }

    /// Returns true if the transition fires whenever it is triggered.
    pub fn is_unconditional(&self) -> bool {
        self.guard.as_ref().map(|g| g.is_always_true()).unwrap_or(true)
    }
}

/// An immutable, validated state machine.
#[derive(Debug)]
pub struct Model {
    pub(crate) name: String,
    pub(crate) version: u32,
    pub(crate) fingerprint: String,
    pub(crate) schema: VariableSchema,
    pub(crate) states: Vec<StateNode>,
    pub(crate) regions: Vec<RegionNode>,
    pub(crate) transitions: Vec<TransitionNode>,
    pub(crate) root: RegionId,
    pub(crate) by_path: HashMap<String, StateId>,
    pub(crate) description: MachineDescription,
}

impl Model {
    /// Builds a model using the native expression language.
    pub fn build(description: MachineDescription) -> Result<Self, ValidationError> {
        Self::build_with(description, &NativeLanguage)
    }

    /// Builds a model with a custom expression language.
    pub fn build_with(
        description: MachineDescription,
        language: &dyn ExpressionLanguage,
    ) -> Result<Self, ValidationError> {
        Builder::new(&description, language).build()
    }

    /// Parses and builds a model from a JSON description.
    pub fn from_json(json: &Value) -> Result<Self, ValidationError> {
        let description = MachineDescription::from_json(json).map_err(|e| malformed(json, e))?;
        Self::build(description)
    }

    /// Parses and builds a model from a YAML description.
    pub fn from_yaml(yaml: &str) -> Result<Self, ValidationError> {
        let description = MachineDescription::from_yaml_str(yaml).map_err(|e| ValidationError {
            model: "<unnamed>".to_string(),
            violations: vec![Violation {
                kind: ViolationKind::Malformed,
                location: "document".to_string(),
                message: e.to_string(),
            }],
        })?;
        Self::build(description)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Short content hash of the description.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Version string recorded in checkpoints, `"<version>-<fingerprint>"`.
    pub fn model_version(&self) -> String {
        format!("{}-{}", self.version, self.fingerprint)
    }

    pub fn schema(&self) -> &VariableSchema {
        &self.schema
    }

    pub fn description(&self) -> &MachineDescription {
        &self.description
    }

    pub fn state(&self, id: StateId) -> &StateNode {
        &self.states[id.index()]
    }

    pub fn region(&self, id: RegionId) -> &RegionNode {
        &self.regions[id.index()]
    }

    pub fn transition(&self, id: TransitionId) -> &TransitionNode {
        &self.transitions[id.index()]
    }

    pub fn states(&self) -> impl Iterator<Item = &StateNode> {
        self.states.iter()
    }

    pub fn transitions(&self) -> impl Iterator<Item = &TransitionNode> {
        self.transitions.iter()
    }

    pub fn root(&self) -> RegionId {
        self.root
    }

    /// Looks up a state by its dotted path.
    pub fn find_state(&self, path: &str) -> Option<StateId> {
        self.by_path.get(path).copied()
    }

    /// Owner of the region containing the state.
    pub fn parent(&self, id: StateId) -> Option<StateId> {
        self.region(self.state(id).region).owner
    }

    /// Proper ancestors, nearest first.
    pub fn ancestors(&self, id: StateId) -> impl Iterator<Item = StateId> + '_ {
        std::iter::successors(self.parent(id), move |&p| self.parent(p))
    }

    /// Returns true if `id` is a proper descendant of `of`.
    pub fn is_descendant(&self, id: StateId, of: StateId) -> bool {
        self.ancestors(id).any(|a| a == of)
    }

    /// Returns true if the state is a member of the region or nested below one.
    pub fn region_contains(&self, region: RegionId, id: StateId) -> bool {
        let mut current = self.state(id).region;
        loop {
            if current == region {
                return true;
            }
            match self.region(current).owner {
                Some(owner) => current = self.state(owner).region,
                None => return false,
            }
        }
    }

    /// Configuration after default entry from the top-level region.
    pub fn initial_configuration(&self) -> Configuration {
        self.entry_set(self.root, &[self.region(self.root).default])
            .into_iter()
            .collect()
    }

    /// Innermost region containing the source and every target.
    ///
    /// Everything active in the domain is exited when the transition fires, so a
    /// transition inside one region of a parallel state leaves its sibling regions alone.
    pub fn transition_domain(&self, source: StateId, targets: &[StateId]) -> RegionId {
        let mut region = self.state(source).region;
        loop {
            if targets.iter().all(|&t| self.region_contains(region, t)) {
                return region;
            }
            match self.region(region).owner {
                Some(owner) => region = self.state(owner).region,
                None => return region,
            }
        }
    }

    /// States entered when entering `targets` from `domain`, shallowest first.
    ///
    /// Adds the ancestors of every target inside the domain and completes
    /// compound states with the defaults of regions that have no explicit target.
    pub fn entry_set(&self, domain: RegionId, targets: &[StateId]) -> Vec<StateId> {
        let mut set = BTreeSet::new();
        for &target in targets {
            set.insert(target);
            for ancestor in self.ancestors(target) {
                if !self.region_contains(domain, ancestor) {
                    break;
                }
                set.insert(ancestor);
            }
        }

        let mut pending: Vec<StateId> = set.iter().copied().collect();
        while let Some(state) = pending.pop() {
            for &region in &self.state(state).regions {
                let region = self.region(region);
                if !region.states.iter().any(|s| set.contains(s)) && set.insert(region.default) {
                    pending.push(region.default);
                }
            }
        }

        let mut entered: Vec<StateId> = set.into_iter().collect();
        entered.sort_by_key(|&s| (self.state(s).depth, s));
        entered
    }

    /// Active states inside `domain`, deepest first.
    pub fn exit_set(&self, configuration: &Configuration, domain: RegionId) -> Vec<StateId> {
        let mut exited: Vec<StateId> = configuration
            .iter()
            .copied()
            .filter(|&s| self.region_contains(domain, s))
            .collect();
        exited.sort_by_key(|&s| (std::cmp::Reverse(self.state(s).depth), std::cmp::Reverse(s)));
        exited
    }

    /// Checks that a configuration is legal: one active state in the top-level
    /// region, one per region of every active compound state, and every active
    /// state's ancestor chain active.
    pub fn check_configuration(&self, configuration: &Configuration) -> Result<(), String> {
        let active_in = |region: RegionId| {
            self.region(region)
                .states
                .iter()
                .filter(|s| configuration.contains(s))
                .count()
        };

        if active_in(self.root) != 1 {
            return Err(format!(
                "top-level region has {} active states",
                active_in(self.root)
            ));
        }

        for &id in configuration {
            let state = self.states.get(id.index()).ok_or_else(|| format!("unknown state {:?}", id))?;
            if state.is_pseudostate() {
                return Err(format!("pseudostate '{}' is active", state.path));
            }
            if let Some(parent) = self.parent(id) {
                if !configuration.contains(&parent) {
                    return Err(format!(
                        "'{}' is active but its parent '{}' is not",
                        state.path,
                        self.state(parent).path
                    ));
                }
            }
            for &region in &state.regions {
                let count = active_in(region);
                if count != 1 {
                    return Err(format!(
                        "region {} of '{}' has {} active states",
                        self.region(region).name,
                        state.path,
                        count
                    ));
                }
            }
        }
        Ok(())
    }

    /// Returns true if the active state of the top-level region is final.
    pub fn is_completed(&self, configuration: &Configuration) -> bool {
        self.region(self.root)
            .states
            .iter()
            .any(|s| configuration.contains(s) && self.state(*s).is_final())
    }

    /// Returns true if the compound state has reached a final state in every region.
    pub fn is_done(&self, state: StateId, configuration: &Configuration) -> bool {
        let node = self.state(state);
        node.is_compound()
            && node.regions.iter().all(|&r| {
                self.region(r)
                    .states
                    .iter()
                    .any(|s| configuration.contains(s) && self.state(*s).is_final())
            })
    }

    /// Paths of the given states, in document order.
    pub fn paths(&self, configuration: &Configuration) -> Vec<String> {
        configuration
            .iter()
            .map(|&s| self.state(s).path.clone())
            .collect()
    }

    /// Resolves state paths back into a configuration.
    pub fn resolve_paths<S: AsRef<str>>(&self, paths: &[S]) -> Result<Configuration, String> {
        paths
            .iter()
            .map(|p| {
                self.find_state(p.as_ref())
                    .ok_or_else(|| format!("unknown state '{}'", p.as_ref()))
            })
            .collect()
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{} ({})", self.name, self.version, self.fingerprint)
    }
}

fn malformed(json: &Value, error: serde_json::Error) -> ValidationError {
    let model = json
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
        .to_string();
    ValidationError {
        model,
        violations: vec![Violation {
            kind: ViolationKind::Malformed,
            location: "document".to_string(),
            message: error.to_string(),
        }],
    }
}
