use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a short prefixed id, e.g. `task-1a2b3c4d`.
pub fn short_id(prefix: &str) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &raw[..8])
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Blocked,
    Waiting,
    Completed,
    Abandoned,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Completed => "completed",
            TaskStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().trim() {
            "active" | "in_progress" => Some(Self::Active),
            "blocked" => Some(Self::Blocked),
            "waiting" | "pending" => Some(Self::Waiting),
            "completed" | "done" => Some(Self::Completed),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    /// Completed and abandoned tasks no longer hold up their parent.
    pub fn is_closed(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl TaskPriority {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    /// Ordering weight used by the scheduler: harder work ranks higher.
    pub fn rank(&self) -> u8 {
        match self {
            Complexity::Simple => 1,
            Complexity::Moderate => 2,
            Complexity::Complex => 3,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "simple" => Some(Self::Simple),
            "moderate" => Some(Self::Moderate),
            "complex" => Some(Self::Complex),
            _ => None,
        }
    }
}

/// A unit of work in the session task graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_complexity: Option<Complexity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_complexity: Option<Complexity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown_depth: Option<u32>,
    #[serde(default = "default_true")]
    pub is_dependency_leaf: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_message: Option<String>,
    #[serde(default)]
    pub related_files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for `MemoryStore::add_task`.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub description: String,
    pub parent_id: Option<String>,
    pub depends_on: Vec<String>,
    pub priority: TaskPriority,
    pub estimated_complexity: Option<Complexity>,
    pub related_files: Vec<String>,
    /// Defaults to `Waiting` when unset.
    pub status: Option<TaskStatus>,
}

impl NewTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn under(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn complexity(mut self, c: Complexity) -> Self {
        self.estimated_complexity = Some(c);
        self
    }

    pub fn status(mut self, s: TaskStatus) -> Self {
        self.status = Some(s);
        self
    }
}

/// Partial update for `MemoryStore::update_task`. `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub depends_on: Option<Vec<String>>,
    pub estimated_complexity: Option<Complexity>,
    pub actual_complexity: Option<Complexity>,
    pub blocked_by: Option<String>,
    pub completion_message: Option<String>,
    pub related_files: Option<Vec<String>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Goals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    Active,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionGoal {
    pub id: String,
    pub description: String,
    pub status: GoalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_goal_id: Option<String>,
    pub depth: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Decaying memory entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Lifespan {
    #[default]
    Session,
    Project,
    Permanent,
}

/// Which decay rate applies to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayClass {
    Preference,
    UserFact,
    None,
}

/// Shared behaviour of entries that can be superseded and, optionally, decay.
pub trait MemoryEntry {
    fn id(&self) -> &str;
    fn category(&self) -> &str;
    fn confidence(&self) -> f64;
    fn superseded_by(&self) -> Option<&str>;
    fn mark_superseded(&mut self, by: &str, at: DateTime<Utc>);
    fn decay_class(&self) -> DecayClass;

    fn is_current(&self) -> bool {
        self.superseded_by().is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserPreference {
    pub id: String,
    pub category: String,
    pub key: String,
    pub value: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reinforced: Option<DateTime<Utc>>,
    /// Last instant decay was applied; decay only charges time after this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decayed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lifespan: Lifespan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserFact {
    pub id: String,
    pub category: String,
    pub fact: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reinforced: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decayed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lifespan: Lifespan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub id: String,
    pub category: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reinforced: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lifespan: Lifespan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,
}

impl MemoryEntry for UserPreference {
    fn id(&self) -> &str {
        &self.id
    }
    fn category(&self) -> &str {
        &self.category
    }
    fn confidence(&self) -> f64 {
        self.confidence
    }
    fn superseded_by(&self) -> Option<&str> {
        self.superseded_by.as_deref()
    }
    fn mark_superseded(&mut self, by: &str, at: DateTime<Utc>) {
        self.superseded_by = Some(by.to_string());
        self.superseded_at = Some(at);
    }
    fn decay_class(&self) -> DecayClass {
        DecayClass::Preference
    }
}

impl MemoryEntry for UserFact {
    fn id(&self) -> &str {
        &self.id
    }
    fn category(&self) -> &str {
        &self.category
    }
    fn confidence(&self) -> f64 {
        self.confidence
    }
    fn superseded_by(&self) -> Option<&str> {
        self.superseded_by.as_deref()
    }
    fn mark_superseded(&mut self, by: &str, at: DateTime<Utc>) {
        self.superseded_by = Some(by.to_string());
        self.superseded_at = Some(at);
    }
    fn decay_class(&self) -> DecayClass {
        DecayClass::UserFact
    }
}

impl MemoryEntry for Decision {
    fn id(&self) -> &str {
        &self.id
    }
    fn category(&self) -> &str {
        &self.category
    }
    fn confidence(&self) -> f64 {
        self.confidence
    }
    fn superseded_by(&self) -> Option<&str> {
        self.superseded_by.as_deref()
    }
    fn mark_superseded(&mut self, by: &str, at: DateTime<Utc>) {
        self.superseded_by = Some(by.to_string());
        self.superseded_at = Some(at);
    }
    fn decay_class(&self) -> DecayClass {
        DecayClass::None
    }
}

/// Read-only view over one entity list with explicit "current" and "all" query modes.
pub struct MemoryView<'a, T> {
    items: &'a [T],
}

impl<'a, T: MemoryEntry> MemoryView<'a, T> {
    pub fn new(items: &'a [T]) -> Self {
        Self { items }
    }

    /// Entries that have not been superseded.
    pub fn current(&self) -> Vec<&'a T> {
        self.items.iter().filter(|e| e.is_current()).collect()
    }

    /// Full history, superseded entries included.
    pub fn all(&self) -> &'a [T] {
        self.items
    }

    pub fn get(&self, id: &str) -> Option<&'a T> {
        self.items.iter().find(|e| e.id() == id)
    }
}

// ---------------------------------------------------------------------------
// Working state, project context, archive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    pub path: String,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkingState {
    #[serde(default)]
    pub active_files: Vec<String>,
    #[serde(default)]
    pub recent_errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub edit_history: Vec<EditRecord>,
    #[serde(default)]
    pub command_history: Vec<CommandRecord>,
    /// Explicitly selected task; wins over status-based inference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_repro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verification: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl Default for WorkingState {
    fn default() -> Self {
        Self {
            active_files: Vec::new(),
            recent_errors: Vec::new(),
            edit_history: Vec::new(),
            command_history: Vec::new(),
            current_task: None,
            last_repro: None,
            last_verification: None,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContextEntry {
    pub key: String,
    pub value: String,
    pub category: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    pub id: String,
    pub kind: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!(TaskStatus::parse("waiting"), Some(TaskStatus::Waiting));
        assert_eq!(TaskStatus::parse("Done"), Some(TaskStatus::Completed));
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_complexity_rank_orders_hard_first() {
        assert!(Complexity::Complex.rank() > Complexity::Moderate.rank());
        assert!(Complexity::Moderate.rank() > Complexity::Simple.rank());
    }

    #[test]
    fn test_task_deserializes_without_optional_fields() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "id": "t1",
            "description": "write parser",
            "status": "waiting",
            "createdAt": "2025-01-01T00:00:00Z",
            "updatedAt": "2025-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(task.is_dependency_leaf);
        assert!(task.depends_on.is_empty());
        assert_eq!(task.priority, TaskPriority::Medium);
    }

    #[test]
    fn test_short_id_prefix() {
        let id = short_id("task");
        assert!(id.starts_with("task-"));
        assert_eq!(id.len(), "task-".len() + 8);
    }
}
