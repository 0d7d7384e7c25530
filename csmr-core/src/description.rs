//! State machine description documents.
//!
//! Descriptions are written in JSON or YAML:
//!
//! ```yaml
//! name: counter
//! version: 1
//! variables:
//!   count: { type: int, initial: 0 }
//! states:
//!   - id: init
//!     kind: initial
//!     transitions: [{ target: Idle }]
//!   - id: Idle
//!     transitions:
//!       - { event: start, target: Running, actions: [{ assign: "count := 0" }] }
//!   - id: Running
//!     transitions:
//!       - { event: tick, target: Running, guard: "count < 3", actions: [{ assign: "count := count + 1" }] }
//!       - { event: tick, target: Done, guard: "count >= 3" }
//!   - id: Done
//!     kind: final
//! ```

use crate::event::Channel;
use crate::value::ValueType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Default timeout for service invocations without an explicit one.
pub const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 30_000;

/// Kind of a state node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    #[default]
    Simple,
    Composite,
    Parallel,
    /// Pseudostate naming the default state of its region.
    Initial,
    Final,
}

/// Top-level description document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineDescription {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub variables: BTreeMap<String, VariableDescription>,

    /// States of the top-level region.
    pub states: Vec<StateDescription>,

    /// Named guards, referenced from transitions as `@name`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub guards: BTreeMap<String, String>,

    /// Named actions, referenced with `use: name`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, ActionDescription>,
}

fn default_version() -> u32 {
    1
}

impl MachineDescription {
    pub fn from_json(json: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json.clone())
    }

    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(s)
    }

    /// Returns the description as JSON.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// A declared context variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDescription {
    #[serde(rename = "type")]
    pub ty: ValueType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDescription {
    pub id: String,

    #[serde(default)]
    pub kind: StateKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<ActionDescription>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exit: Vec<ActionDescription>,

    /// Timers started on entry and cancelled on exit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<TimerDescription>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDescription>,

    /// Children of a composite state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateDescription>,

    /// Orthogonal regions of a parallel state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<RegionDescription>,
}

impl StateDescription {
    pub fn new(id: impl Into<String>, kind: StateKind) -> Self {
        Self {
            id: id.into(),
            kind,
            entry: Vec::new(),
            exit: Vec::new(),
            after: Vec::new(),
            transitions: Vec::new(),
            states: Vec::new(),
            regions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDescription {
    pub id: String,
    pub states: Vec<StateDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDescription {
    /// Triggering event. `None` makes the transition eventless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    /// Target state(s). Empty for a targetless (internal) transition.
    #[serde(
        default,
        deserialize_with = "deserialize_targets",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub target: Vec<String>,

    /// Guard expression or `@name` of a named guard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionDescription>,

    /// Higher fires first. Ties are broken by document order.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub priority: i32,

    /// Target taken, without running actions, when the guard is false.
    #[serde(
        default,
        rename = "else",
        deserialize_with = "deserialize_targets",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub else_target: Vec<String>,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// Actions, externally tagged: `{ assign: "x := 1" }`, `{ raise: { event: go } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDescription {
    Assign(String),
    Raise(RaiseDescription),
    Invoke(InvokeDescription),
    Match(MatchDescription),
    ResetTimer(String),
    Use(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseDescription {
    pub event: String,

    #[serde(default)]
    pub channel: Channel,

    /// Payload expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeDescription {
    pub service: String,

    /// Request expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    #[serde(default = "default_invoke_timeout")]
    pub timeout_ms: u64,

    /// Event raised with the response. Defaults to `done.invoke.<service>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<String>,

    /// Event raised on failure. Defaults to `error.invoke.<service>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Restrict selection to implementations local to the node.
    #[serde(default)]
    pub local: bool,
}

fn default_invoke_timeout() -> u64 {
    DEFAULT_INVOKE_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDescription {
    /// Expression whose value selects the case.
    pub value: String,

    #[serde(default)]
    pub cases: Vec<MatchCaseDescription>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default: Vec<ActionDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCaseDescription {
    /// Expression compared for equality with the match value.
    pub when: String,
    pub actions: Vec<ActionDescription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerDescription {
    pub name: String,

    /// Delay in milliseconds, as an expression or a number.
    #[serde(deserialize_with = "deserialize_expression")]
    pub delay_ms: String,

    /// Internal event raised when the timer fires.
    pub event: String,

    #[serde(default)]
    pub repeat: bool,
}

fn deserialize_targets<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct TargetsVisitor;

    impl<'de> Visitor<'de> for TargetsVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a state name or array of state names")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut targets = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                targets.push(s);
            }
            Ok(targets)
        }
    }

    deserializer.deserialize_any(TargetsVisitor)
}

fn deserialize_expression<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct ExpressionVisitor;

    impl<'de> Visitor<'de> for ExpressionVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an expression string or a number")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(v.to_string())
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(v.to_string())
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(ExpressionVisitor)
}
