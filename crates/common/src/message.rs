use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;

use crate::state::AgentId;

/// Assigned by the manager per outbound request, from wall-clock
/// nanoseconds.
pub type TaskId = i64;

/// Shared by all per-agent requests derived from one fan-out request.
/// Zero means "no group".
pub type GroupId = i64;

/// The concurrency discipline a task declares.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    #[default]
    Unspecified,
    NoLock,
    Write,
    Exclusive,
}

/// Fabric-level outcome attached to every response, distinct from the
/// task's own error string.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr,
)]
pub enum InternalError {
    #[default]
    Ok,
    UnknownTask,
    Timeout,
    StartedTimeout,
    FullQueue,
    Disconnected,
    Disconnecting,
    ModuleError,
    UnknownError,
}

/// A dynamically typed task input. JSON integers land in the integer
/// arms so 64-bit precision survives the trip through the fabric.
///
/// Human-readable formats see the plain value (`5`, `"x"`, `[..]`);
/// the binary stream codec gets a tagged encoding, since bincode
/// cannot deserialize self-describing values.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    List(Vec<InputValue>),
    Map(IndexMap<String, InputValue>),
}

impl InputValue {
    pub fn as_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Mirror of [`InputValue`] with derived (externally tagged) serde,
/// used as the binary wire shape.
#[derive(Serialize, Deserialize)]
enum TaggedInput {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    List(Vec<InputValue>),
    Map(IndexMap<String, InputValue>),
}

impl From<InputValue> for TaggedInput {
    fn from(value: InputValue) -> Self {
        match value {
            InputValue::Null => TaggedInput::Null,
            InputValue::Bool(b) => TaggedInput::Bool(b),
            InputValue::Int(i) => TaggedInput::Int(i),
            InputValue::UInt(u) => TaggedInput::UInt(u),
            InputValue::Float(f) => TaggedInput::Float(f),
            InputValue::String(s) => TaggedInput::String(s),
            InputValue::List(l) => TaggedInput::List(l),
            InputValue::Map(m) => TaggedInput::Map(m),
        }
    }
}

impl From<TaggedInput> for InputValue {
    fn from(value: TaggedInput) -> Self {
        match value {
            TaggedInput::Null => InputValue::Null,
            TaggedInput::Bool(b) => InputValue::Bool(b),
            TaggedInput::Int(i) => InputValue::Int(i),
            TaggedInput::UInt(u) => InputValue::UInt(u),
            TaggedInput::Float(f) => InputValue::Float(f),
            TaggedInput::String(s) => InputValue::String(s),
            TaggedInput::List(l) => InputValue::List(l),
            TaggedInput::Map(m) => InputValue::Map(m),
        }
    }
}

impl Serialize for InputValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !serializer.is_human_readable() {
            return TaggedInput::from(self.clone()).serialize(serializer);
        }
        match self {
            InputValue::Null => serializer.serialize_unit(),
            InputValue::Bool(b) => serializer.serialize_bool(*b),
            InputValue::Int(i) => serializer.serialize_i64(*i),
            InputValue::UInt(u) => serializer.serialize_u64(*u),
            InputValue::Float(f) => serializer.serialize_f64(*f),
            InputValue::String(s) => serializer.serialize_str(s),
            InputValue::List(l) => l.serialize(serializer),
            InputValue::Map(m) => m.serialize(serializer),
        }
    }
}

impl<'de> serde::Deserialize<'de> for InputValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if !deserializer.is_human_readable() {
            return TaggedInput::deserialize(deserializer).map(InputValue::from);
        }
        deserializer.deserialize_any(InputValueVisitor)
    }
}

struct InputValueVisitor;

impl<'de> serde::de::Visitor<'de> for InputValueVisitor {
    type Value = InputValue;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a scalar, list, or map task input")
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(InputValue::Null)
    }

    fn visit_none<E>(self) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(InputValue::Null)
    }

    fn visit_some<D: serde::Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
        serde::Deserialize::deserialize(d)
    }

    fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(InputValue::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(InputValue::Int(v))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(match i64::try_from(v) {
            Ok(v) => InputValue::Int(v),
            Err(_) => InputValue::UInt(v),
        })
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(InputValue::Float(v))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(InputValue::String(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(InputValue::String(v))
    }

    fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut list = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            list.push(item);
        }
        Ok(InputValue::List(list))
    }

    fn visit_map<A: serde::de::MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries = IndexMap::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, value)) = map.next_entry::<String, InputValue>()? {
            entries.insert(key, value);
        }
        Ok(InputValue::Map(entries))
    }
}

/// One task request sent manager to agent over the stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    #[serde(default)]
    pub group_id: GroupId,
    /// `plugin` or `plugin:task`.
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<InputValue>,
    #[serde(default)]
    pub options: IndexMap<String, InputValue>,
    /// Zero falls back to the agent's configured task timeout.
    #[serde(default)]
    pub timeout_secs: u32,
    #[serde(default)]
    pub lock_override: LockMode,
}

/// One task response sent agent to manager over the stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: TaskId,
    #[serde(default)]
    pub group_id: GroupId,
    /// Opaque bytes, typically JSON.
    #[serde(default)]
    pub output: Vec<u8>,
    /// Error string produced by the task itself.
    #[serde(default)]
    pub task_error: String,
    #[serde(default)]
    pub retcode: i32,
    #[serde(default)]
    pub internal_error: InternalError,
    #[serde(default)]
    pub module_error: String,
}

impl TaskResponse {
    /// A response carrying only a fabric-level error.
    pub fn internal(task_id: TaskId, group_id: GroupId, error: InternalError) -> Self {
        Self {
            task_id,
            group_id,
            internal_error: error,
            ..Default::default()
        }
    }
}

/// Stored per response under `res:<task-id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub agent: AgentId,
    pub response: TaskResponse,
}

/// Stored per fan-out under `req:<group-id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub task_name: String,
    pub connected_targets: Vec<AgentId>,
    pub disconnected_targets: Vec<AgentId>,
}
