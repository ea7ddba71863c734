use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Inbound chat request as posted by the browser or the `chat` subcommand.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

pub const LIST_SESSIONS_ACTION: &str = "list_sessions";

impl ChatRequest {
    pub fn is_list_sessions(&self) -> bool {
        self.action.as_deref() == Some(LIST_SESSIONS_ACTION)
    }

    /// `query` wins over `message`; blank values count as missing.
    pub fn text(&self) -> Option<&str> {
        non_blank(self.query.as_deref()).or_else(|| non_blank(self.message.as_deref()))
    }

    pub fn user_id(&self) -> Option<&str> {
        non_blank(self.user_id.as_deref())
    }

    pub fn session_id(&self) -> Option<&str> {
        non_blank(self.session_id.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// One chat turn after request validation, handed to an upstream protocol.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub user_id: String,
    pub session_id: Option<String>,
    pub message: String,
    pub authorization: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    AgentEngine,
    Local,
}

impl DeploymentMode {
    pub fn uses_agent_engine(self) -> bool {
        matches!(self, DeploymentMode::AgentEngine)
    }
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentMode::AgentEngine => f.write_str("agent_engine"),
            DeploymentMode::Local => f.write_str("local"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    /// Function calls, inline data and anything else the agent attaches.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn is_thought(&self) -> bool {
        self.thought.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// One agent response record as emitted by either backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentRecord {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub response: Option<Value>,
    #[allow(dead_code)]
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub author: Option<Value>,
    #[serde(default, rename = "usageMetadata")]
    pub usage_metadata: Option<Value>,
    #[serde(default)]
    pub actions: Option<Value>,
}

/// The shapes a `data:` payload arrives in. Some deployments wrap the record
/// in an array; only the first element is ever meaningful.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AgentPayload {
    // Must stay first: a derived struct also accepts a JSON sequence.
    Batch(Vec<Value>),
    Record(AgentRecord),
}

impl AgentPayload {
    /// The record this payload carries, if any. A batch whose first element
    /// is not a record yields `None`, as does an empty batch.
    pub fn into_record(self) -> Option<AgentRecord> {
        match self {
            AgentPayload::Record(record) => Some(record),
            AgentPayload::Batch(items) => items
                .into_iter()
                .next()
                .filter(Value::is_object)
                .and_then(|first| serde_json::from_value(first).ok()),
        }
    }
}

/// Client-facing event shape; `content.parts` is never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Value>,
    #[serde(
        default,
        rename = "usageMetadata",
        skip_serializing_if = "Option::is_none"
    )]
    pub usage_metadata: Option<Value>,
}

impl NormalizedEvent {
    /// Concatenated text of all non-thought parts.
    pub fn visible_text(&self) -> String {
        self.content
            .parts
            .iter()
            .filter(|part| !part.is_thought())
            .filter_map(|part| part.text.as_deref())
            .collect()
    }
}

/// Envelope used by the Agent Engine `:query` endpoint.
#[derive(Debug, Serialize)]
pub(crate) struct ClassMethodCall<T> {
    pub(crate) class_method: &'static str,
    pub(crate) input: T,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ClassMethodResult<T> {
    pub(crate) output: Option<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreatedSession {
    #[serde(default)]
    pub(crate) id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunSseRequest<'a> {
    pub(crate) app_name: &'a str,
    pub(crate) user_id: &'a str,
    pub(crate) session_id: &'a str,
    pub(crate) new_message: Content,
    pub(crate) streaming: bool,
}
