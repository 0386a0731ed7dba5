// Sync protocol - shared structs for the REST API and the push channel
// Channel messages are JSON text frames of the form {"event": ..., "data": ...}

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

/// Server-assigned list identifier
pub type ListId = i64;

/// Server-assigned task identifier
pub type TaskId = i64;

/// Task priority as stored by the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "High"),
            Priority::Medium => write!(f, "Medium"),
            Priority::Low => write!(f, "Low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    /// Case-insensitive; the server stores whatever casing a client sent.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// The server stores priority as free text; anything unrecognized reads as Medium
impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(match raw {
            None => Priority::default(),
            Some(s) => s.parse().unwrap_or_else(|_| {
                warn!(priority = %s, "unknown priority, using Medium");
                Priority::default()
            }),
        })
    }
}

/// A named collection of tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoList {
    pub id: ListId,
    pub name: String,
}

/// A single to-do item as returned by `GET /lists/{id}/tasks`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Not sent by the server; filled in from the request path
    #[serde(default)]
    pub list_id: ListId,
    pub text: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(
        default,
        deserialize_with = "deserialize_optional_date",
        skip_serializing_if = "Option::is_none"
    )]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub completed: bool,
    /// Render order within the list; null until the list is first reordered
    #[serde(default)]
    pub position: Option<u32>,
}

/// `"YYYY-MM-DD"`; `""`, `null` and unparsable text read as no date
fn deserialize_optional_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_due_date))
}

fn parse_due_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| warn!(due_date = raw, error = %e, "ignoring unparsable due date"))
        .ok()
}

/// Patch form: absent leaves the date alone, `""` clears it
fn serialize_due_patch<S>(due: &Option<Option<NaiveDate>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match due {
        Some(Some(date)) => serializer.serialize_str(&date.format("%Y-%m-%d").to_string()),
        _ => serializer.serialize_str(""),
    }
}

/// Only called when the field is present; `""` and `null` mean "clear"
fn deserialize_due_patch<'de, D>(deserializer: D) -> Result<Option<Option<NaiveDate>>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_optional_date(deserializer).map(Some)
}

// ============================================================================
// REST request bodies
// ============================================================================

/// Body for `POST /lists/{id}/tasks`, also the shape returned by `/parse-task`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub text: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, deserialize_with = "deserialize_optional_date")]
    pub due_date: Option<NaiveDate>,
}

impl TaskDraft {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            priority: Priority::Medium,
            due_date: None,
        }
    }
}

/// Partial update body for `PUT /tasks/{id}`; absent fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// `Some(None)` removes the due date
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_due_patch",
        deserialize_with = "deserialize_due_patch"
    )]
    pub due_date: Option<Option<NaiveDate>>,
}

impl TaskPatch {
    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
            ..Self::default()
        }
    }

    pub fn clear_due_date() -> Self {
        Self {
            due_date: Some(None),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.completed.is_none()
            && self.priority.is_none()
            && self.due_date.is_none()
    }
}

/// Body for `PUT /tasks/reorder`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderRequest {
    pub list_id: ListId,
    pub task_ids: Vec<TaskId>,
}

/// Body for `POST /login` and `POST /register`
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Successful `POST /login` response
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub username: String,
}

// ============================================================================
// Push channel
// ============================================================================

/// Change tag carried by push notifications. Only a dirty flag, never a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Add,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeAction::Add => write!(f, "add"),
            ChangeAction::Update => write!(f, "update"),
            ChangeAction::Delete => write!(f, "delete"),
        }
    }
}

/// Client -> server channel events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChannelRequest {
    /// Subscribe this connection to a list's room
    JoinList { list_id: ListId },
    /// Release the subscription to a list's room
    LeaveList { list_id: ListId },
}

/// Server -> client channel events
///
/// Any extra payload the server attaches next to `action` is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChannelNotification {
    /// A task in the joined list changed
    TaskUpdate { action: ChangeAction },
    /// The user's set of lists changed
    ListUpdate { action: ChangeAction },
}

// ============================================================================
// Helpers for message framing
// ============================================================================

/// Serialize a channel message into a text frame
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

/// Deserialize a channel message from a text frame (surrounding whitespace ignored)
pub fn decode_frame<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(text.trim())
}
