//! Session memory: goals, the task graph, decaying preferences/facts/decisions,
//! working state and a searchable archive.
//!
//! The store is plain data with accessors and mutators. It has no control flow
//! of its own; the agent loop and the tools it runs are its only writers.

pub mod decay;
pub mod types;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use cairn_config::MemoryConfig;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use decay::DecayReport;
pub use types::*;

/// Memory store shared between the top-level loop and the tools it executes.
pub type SharedMemory = Arc<Mutex<MemoryStore>>;

const SNAPSHOT_VERSION: u32 = 1;

/// Serialized form of the whole store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    pub version: u32,
    #[serde(default)]
    pub goals: Vec<SessionGoal>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub preferences: Vec<UserPreference>,
    #[serde(default)]
    pub user_facts: Vec<UserFact>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub project_context: Vec<ProjectContextEntry>,
    #[serde(default)]
    pub working_state: WorkingState,
    #[serde(default)]
    pub archive: Vec<ArchiveEntry>,
}

impl Default for MemorySnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            goals: Vec::new(),
            tasks: Vec::new(),
            preferences: Vec::new(),
            user_facts: Vec::new(),
            decisions: Vec::new(),
            project_context: Vec::new(),
            working_state: WorkingState::default(),
            archive: Vec::new(),
        }
    }
}

/// All durable-for-the-session state of one agent thread.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    config: MemoryConfig,
    data: MemorySnapshot,
}

impl MemoryStore {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            data: MemorySnapshot::default(),
        }
    }

    pub fn shared(self) -> SharedMemory {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn from_snapshot(config: MemoryConfig, snapshot: MemorySnapshot) -> Self {
        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                "Memory snapshot version {} differs from {SNAPSHOT_VERSION}; loading anyway",
                snapshot.version
            );
        }
        Self {
            config,
            data: snapshot,
        }
    }

    pub fn snapshot(&self) -> &MemorySnapshot {
        &self.data
    }

    /// Load a snapshot from disk. A missing file yields an empty store.
    pub fn load(path: &Path, config: MemoryConfig) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(config));
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read memory snapshot '{}'", path.display()))?;
        let snapshot: MemorySnapshot = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse memory snapshot '{}'", path.display()))?;
        debug!(
            "Loaded memory snapshot: {} tasks, {} goals",
            snapshot.tasks.len(),
            snapshot.goals.len()
        );
        Ok(Self::from_snapshot(config, snapshot))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create memory directory '{}'", parent.display())
            })?;
        }
        let json = serde_json::to_string_pretty(&self.data)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write memory snapshot '{}'", path.display()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Goals
    // -----------------------------------------------------------------------

    /// Start a new active goal. Any active sibling on the same branch is abandoned,
    /// keeping at most one active goal per branch.
    pub fn set_goal(&mut self, description: &str, parent_goal_id: Option<&str>) -> SessionGoal {
        let now = Utc::now();
        let depth = parent_goal_id
            .and_then(|pid| self.data.goals.iter().find(|g| g.id == pid))
            .map(|p| p.depth + 1)
            .unwrap_or(0);

        for goal in self.data.goals.iter_mut() {
            if goal.status == GoalStatus::Active && goal.parent_goal_id.as_deref() == parent_goal_id
            {
                goal.status = GoalStatus::Abandoned;
                goal.completed_at = Some(now);
            }
        }

        let goal = SessionGoal {
            id: short_id("goal"),
            description: description.to_string(),
            status: GoalStatus::Active,
            parent_goal_id: parent_goal_id.map(|s| s.to_string()),
            depth,
            created_at: now,
            completed_at: None,
        };
        self.data.goals.push(goal.clone());
        goal
    }

    pub fn complete_goal(&mut self, id: &str) -> bool {
        match self.data.goals.iter_mut().find(|g| g.id == id) {
            Some(goal) => {
                goal.status = GoalStatus::Completed;
                goal.completed_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    pub fn goals(&self) -> &[SessionGoal] {
        &self.data.goals
    }

    /// The deepest active goal.
    pub fn current_goal(&self) -> Option<&SessionGoal> {
        self.data
            .goals
            .iter()
            .filter(|g| g.status == GoalStatus::Active)
            .max_by_key(|g| g.depth)
    }

    /// Root-to-leaf chain of the current goal.
    pub fn goal_path(&self) -> Vec<&SessionGoal> {
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.current_goal();
        while let Some(goal) = cursor {
            if !seen.insert(goal.id.as_str()) {
                break;
            }
            path.push(goal);
            cursor = goal
                .parent_goal_id
                .as_deref()
                .and_then(|pid| self.data.goals.iter().find(|g| g.id == pid));
        }
        path.reverse();
        path
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub fn add_task(&mut self, new: NewTask) -> Task {
        let now = Utc::now();
        let mut depth = 0;
        if let Some(pid) = new.parent_id.as_deref() {
            if let Some(parent) = self.data.tasks.iter_mut().find(|t| t.id == pid) {
                parent.is_dependency_leaf = false;
                parent.updated_at = now;
                depth = parent.breakdown_depth.unwrap_or(0) + 1;
            } else {
                warn!("Task parent '{pid}' not found; adding as orphan");
            }
        }

        let task = Task {
            id: short_id("task"),
            description: new.description,
            status: new.status.unwrap_or(TaskStatus::Waiting),
            parent_id: new.parent_id,
            depends_on: new.depends_on,
            priority: new.priority,
            estimated_complexity: new.estimated_complexity,
            actual_complexity: None,
            breakdown_depth: Some(depth),
            is_dependency_leaf: true,
            blocked_by: None,
            completion_message: None,
            related_files: new.related_files,
            created_at: now,
            updated_at: now,
        };
        debug!("Added task {} (depth {depth}): {}", task.id, task.description);
        self.data.tasks.push(task.clone());
        task
    }

    /// Add several children under `parent_id` in one step.
    /// Returns `None` when the parent does not exist.
    pub fn break_down_task(&mut self, parent_id: &str, subtasks: Vec<NewTask>) -> Option<Vec<Task>> {
        self.get_task(parent_id)?;
        let created = subtasks
            .into_iter()
            .map(|mut t| {
                t.parent_id = Some(parent_id.to_string());
                self.add_task(t)
            })
            .collect();
        Some(created)
    }

    /// Apply a partial update. Returns the updated task, or `None` for an unknown id.
    pub fn update_task(&mut self, id: &str, update: TaskUpdate) -> Option<Task> {
        let now = Utc::now();
        let task = self.data.tasks.iter_mut().find(|t| t.id == id)?;

        if let Some(d) = update.description {
            task.description = d;
        }
        if let Some(p) = update.priority {
            task.priority = p;
        }
        if let Some(deps) = update.depends_on {
            task.depends_on = deps;
        }
        if let Some(c) = update.estimated_complexity {
            task.estimated_complexity = Some(c);
        }
        if let Some(c) = update.actual_complexity {
            task.actual_complexity = Some(c);
        }
        if let Some(b) = update.blocked_by {
            task.blocked_by = Some(b);
        }
        if let Some(m) = update.completion_message {
            task.completion_message = Some(m);
        }
        if let Some(files) = update.related_files {
            task.related_files = files;
        }
        let (closed_now, reopened) = match update.status {
            Some(status) => {
                let was_closed = task.status.is_closed();
                task.status = status;
                if status != TaskStatus::Blocked {
                    task.blocked_by = None;
                }
                (!was_closed && status.is_closed(), was_closed && !status.is_closed())
            }
            None => (false, false),
        };
        task.updated_at = now;
        let updated = task.clone();

        if closed_now || reopened {
            if let Some(pid) = updated.parent_id.as_deref() {
                self.refresh_leaf_flag(pid);
            }
        }
        if closed_now {
            if updated.status == TaskStatus::Completed {
                let summary = match &updated.completion_message {
                    Some(msg) => format!("{}: {msg}", updated.description),
                    None => updated.description.clone(),
                };
                self.archive("task_completed", &summary);
            }
            if self.data.working_state.current_task.as_deref() == Some(id) {
                self.data.working_state.current_task = None;
            }
        }
        Some(updated)
    }

    /// A parent is a dependency leaf exactly when every child is closed.
    fn refresh_leaf_flag(&mut self, parent_id: &str) {
        let all_closed = self
            .data
            .tasks
            .iter()
            .filter(|t| t.parent_id.as_deref() == Some(parent_id))
            .all(|t| t.status.is_closed());
        if let Some(parent) = self.data.tasks.iter_mut().find(|t| t.id == parent_id) {
            if parent.is_dependency_leaf != all_closed {
                parent.is_dependency_leaf = all_closed;
                parent.updated_at = Utc::now();
            }
        }
    }

    pub fn get_task(&self, id: &str) -> Option<&Task> {
        self.data.tasks.iter().find(|t| t.id == id)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.data.tasks
    }

    pub fn children_of(&self, id: &str) -> Vec<&Task> {
        self.data
            .tasks
            .iter()
            .filter(|t| t.parent_id.as_deref() == Some(id))
            .collect()
    }

    /// Ancestors of `id`, root first, not including the task itself.
    pub fn task_ancestry(&self, id: &str) -> Vec<&Task> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        seen.insert(id);
        let mut cursor = self.get_task(id).and_then(|t| t.parent_id.as_deref());
        while let Some(pid) = cursor {
            if !seen.insert(pid) {
                warn!("Cycle detected in task parents at '{pid}'");
                break;
            }
            match self.get_task(pid) {
                Some(parent) => {
                    chain.push(parent);
                    cursor = parent.parent_id.as_deref();
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    /// The explicitly selected task if set, otherwise the first `active` task.
    pub fn active_task(&self) -> Option<&Task> {
        if let Some(id) = self.data.working_state.current_task.as_deref() {
            if let Some(task) = self.get_task(id) {
                return Some(task);
            }
        }
        self.data
            .tasks
            .iter()
            .find(|t| t.status == TaskStatus::Active)
    }

    // -----------------------------------------------------------------------
    // Preferences, facts, decisions
    // -----------------------------------------------------------------------

    pub fn add_preference(
        &mut self,
        category: &str,
        key: &str,
        value: &str,
        confidence: f64,
        lifespan: Lifespan,
    ) -> UserPreference {
        let pref = UserPreference {
            id: short_id("pref"),
            category: category.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: Utc::now(),
            last_reinforced: None,
            last_decayed: None,
            lifespan,
            superseded_by: None,
            superseded_at: None,
        };
        self.data.preferences.push(pref.clone());
        pref
    }

    pub fn add_user_fact(
        &mut self,
        category: &str,
        fact: &str,
        confidence: f64,
        lifespan: Lifespan,
    ) -> UserFact {
        let entry = UserFact {
            id: short_id("fact"),
            category: category.to_string(),
            fact: fact.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: Utc::now(),
            last_reinforced: None,
            last_decayed: None,
            lifespan,
            superseded_by: None,
            superseded_at: None,
        };
        self.data.user_facts.push(entry.clone());
        entry
    }

    pub fn add_decision(
        &mut self,
        category: &str,
        description: &str,
        rationale: Option<&str>,
    ) -> Decision {
        let decision = Decision {
            id: short_id("decision"),
            category: category.to_string(),
            description: description.to_string(),
            rationale: rationale.map(|s| s.to_string()),
            confidence: 1.0,
            timestamp: Utc::now(),
            last_reinforced: None,
            lifespan: Lifespan::Project,
            superseded_by: None,
            superseded_at: None,
        };
        self.data.decisions.push(decision.clone());
        decision
    }

    pub fn preferences_view(&self) -> MemoryView<'_, UserPreference> {
        MemoryView::new(&self.data.preferences)
    }

    pub fn user_facts_view(&self) -> MemoryView<'_, UserFact> {
        MemoryView::new(&self.data.user_facts)
    }

    pub fn decisions_view(&self) -> MemoryView<'_, Decision> {
        MemoryView::new(&self.data.decisions)
    }

    /// Current (non-superseded) preferences.
    pub fn preferences(&self) -> Vec<&UserPreference> {
        self.preferences_view().current()
    }

    pub fn all_preferences(&self) -> &[UserPreference] {
        &self.data.preferences
    }

    pub fn user_facts(&self) -> Vec<&UserFact> {
        self.user_facts_view().current()
    }

    pub fn all_user_facts(&self) -> &[UserFact] {
        &self.data.user_facts
    }

    pub fn decisions(&self) -> Vec<&Decision> {
        self.decisions_view().current()
    }

    pub fn all_decisions(&self) -> &[Decision] {
        &self.data.decisions
    }

    pub fn reinforce_preference(&mut self, id: &str) -> bool {
        let boost = self.config.reinforcement_boost;
        match self.data.preferences.iter_mut().find(|p| p.id == id) {
            Some(p) => {
                p.confidence = (p.confidence + boost).min(1.0);
                p.last_reinforced = Some(Utc::now());
                p.last_decayed = None;
                true
            }
            None => false,
        }
    }

    pub fn reinforce_user_fact(&mut self, id: &str) -> bool {
        let boost = self.config.reinforcement_boost;
        match self.data.user_facts.iter_mut().find(|f| f.id == id) {
            Some(f) => {
                f.confidence = (f.confidence + boost).min(1.0);
                f.last_reinforced = Some(Utc::now());
                f.last_decayed = None;
                true
            }
            None => false,
        }
    }

    pub fn supersede_preference(&mut self, old_id: &str, new_id: &str) -> bool {
        supersede(&mut self.data.preferences, old_id, new_id)
    }

    pub fn supersede_user_fact(&mut self, old_id: &str, new_id: &str) -> bool {
        supersede(&mut self.data.user_facts, old_id, new_id)
    }

    pub fn supersede_decision(&mut self, old_id: &str, new_id: &str) -> bool {
        supersede(&mut self.data.decisions, old_id, new_id)
    }

    // -----------------------------------------------------------------------
    // Project context
    // -----------------------------------------------------------------------

    pub fn set_project_context(&mut self, key: &str, value: &str, category: &str) {
        let now = Utc::now();
        match self.data.project_context.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                entry.value = value.to_string();
                entry.category = category.to_string();
                entry.updated_at = now;
            }
            None => self.data.project_context.push(ProjectContextEntry {
                key: key.to_string(),
                value: value.to_string(),
                category: category.to_string(),
                updated_at: now,
            }),
        }
    }

    pub fn project_context(&self) -> &[ProjectContextEntry] {
        &self.data.project_context
    }

    // -----------------------------------------------------------------------
    // Working state
    // -----------------------------------------------------------------------

    pub fn working_state(&self) -> &WorkingState {
        &self.data.working_state
    }

    /// Move `path` to the front of the active-file list.
    pub fn record_file_access(&mut self, path: &str) {
        let max = self.config.max_active_files;
        let ws = &mut self.data.working_state;
        ws.active_files.retain(|p| p != path);
        ws.active_files.insert(0, path.to_string());
        ws.active_files.truncate(max);
        ws.last_updated = Utc::now();
    }

    pub fn record_error(&mut self, message: &str) {
        let max = self.config.max_recent_errors;
        let ws = &mut self.data.working_state;
        ws.recent_errors.push(ErrorRecord {
            message: message.to_string(),
            timestamp: Utc::now(),
            resolved: false,
        });
        trim_front(&mut ws.recent_errors, max);
        ws.last_updated = Utc::now();
    }

    /// Mark every recorded error as resolved.
    pub fn resolve_errors(&mut self) {
        let ws = &mut self.data.working_state;
        for e in ws.recent_errors.iter_mut() {
            e.resolved = true;
        }
        ws.last_updated = Utc::now();
    }

    pub fn unresolved_errors(&self) -> Vec<&ErrorRecord> {
        self.data
            .working_state
            .recent_errors
            .iter()
            .filter(|e| !e.resolved)
            .collect()
    }

    pub fn record_edit(&mut self, path: &str, summary: &str) {
        let max = self.config.max_history;
        self.record_file_access(path);
        let ws = &mut self.data.working_state;
        ws.edit_history.push(EditRecord {
            path: path.to_string(),
            summary: summary.to_string(),
            timestamp: Utc::now(),
        });
        trim_front(&mut ws.edit_history, max);
    }

    pub fn record_command(&mut self, command: &str, exit_code: Option<i32>) {
        let max = self.config.max_history;
        let ws = &mut self.data.working_state;
        ws.command_history.push(CommandRecord {
            command: command.to_string(),
            exit_code,
            timestamp: Utc::now(),
        });
        trim_front(&mut ws.command_history, max);
        ws.last_updated = Utc::now();
    }

    /// Select the current task. Returns false if the id is unknown.
    pub fn set_current_task(&mut self, id: Option<&str>) -> bool {
        if let Some(id) = id {
            if self.get_task(id).is_none() {
                return false;
            }
        }
        let ws = &mut self.data.working_state;
        ws.current_task = id.map(|s| s.to_string());
        ws.last_updated = Utc::now();
        true
    }

    pub fn set_last_repro(&mut self, text: &str) {
        let ws = &mut self.data.working_state;
        ws.last_repro = Some(text.to_string());
        ws.last_updated = Utc::now();
    }

    pub fn set_last_verification(&mut self, text: &str) {
        let ws = &mut self.data.working_state;
        ws.last_verification = Some(text.to_string());
        ws.last_updated = Utc::now();
    }

    // -----------------------------------------------------------------------
    // Archive
    // -----------------------------------------------------------------------

    pub fn archive(&mut self, kind: &str, content: &str) -> ArchiveEntry {
        let entry = ArchiveEntry {
            id: short_id("arch"),
            kind: kind.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        self.data.archive.push(entry.clone());
        entry
    }

    /// Case-insensitive term search. Entries matching more terms rank first,
    /// newer entries win ties.
    pub fn search_archive(&self, query: &str, limit: usize) -> Vec<&ArchiveEntry> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(usize, &ArchiveEntry)> = self
            .data
            .archive
            .iter()
            .filter_map(|e| {
                let haystack = format!("{} {}", e.kind, e.content).to_lowercase();
                let score = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (score > 0).then_some((score, e))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.timestamp.cmp(&a.1.timestamp)));
        scored.into_iter().take(limit).map(|(_, e)| e).collect()
    }

    // -----------------------------------------------------------------------
    // Prompt summary
    // -----------------------------------------------------------------------

    /// Short markdown section describing the session state for the system prompt.
    /// Empty when there is nothing to report.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();

        let goals = self.goal_path();
        if !goals.is_empty() {
            let chain: Vec<&str> = goals.iter().map(|g| g.description.as_str()).collect();
            parts.push(format!("## Current Goal\n{}", chain.join(" > ")));
        }

        if let Some(task) = self.active_task() {
            parts.push(format!(
                "## Active Task\n[{}] {} ({})",
                task.id,
                task.description,
                task.status.as_str()
            ));
        }

        let open = self
            .data
            .tasks
            .iter()
            .filter(|t| !t.status.is_closed())
            .count();
        if open > 0 {
            parts.push(format!(
                "## Tasks\n{open} open of {} total. Use the task tool with action 'next' to pick work.",
                self.data.tasks.len()
            ));
        }

        let prefs: Vec<String> = self
            .preferences()
            .into_iter()
            .filter(|p| p.confidence >= 0.5)
            .map(|p| format!("- {}: {} ({:.2})", p.key, p.value, p.confidence))
            .collect();
        if !prefs.is_empty() {
            parts.push(format!("## User Preferences\n{}", prefs.join("\n")));
        }

        let errors: Vec<String> = self
            .unresolved_errors()
            .into_iter()
            .map(|e| format!("- {}", e.message))
            .collect();
        if !errors.is_empty() {
            parts.push(format!("## Unresolved Errors\n{}", errors.join("\n")));
        }

        parts.join("\n\n")
    }
}

fn supersede<T: MemoryEntry>(items: &mut [T], old_id: &str, new_id: &str) -> bool {
    if old_id == new_id || !items.iter().any(|e| e.id() == new_id) {
        return false;
    }
    match items.iter_mut().find(|e| e.id() == old_id) {
        Some(old) => {
            old.mark_superseded(new_id, Utc::now());
            true
        }
        None => false,
    }
}

fn trim_front<T>(items: &mut Vec<T>, max: usize) {
    if items.len() > max {
        let excess = items.len() - max;
        items.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(MemoryConfig::default())
    }

    #[test]
    fn test_add_child_marks_parent_non_leaf() {
        let mut m = store();
        let root = m.add_task(NewTask::new("build compiler"));
        let child = m.add_task(NewTask::new("lexer").under(&root.id));

        assert!(!m.get_task(&root.id).unwrap().is_dependency_leaf);
        assert!(m.get_task(&child.id).unwrap().is_dependency_leaf);
        assert_eq!(child.breakdown_depth, Some(1));
    }

    #[test]
    fn test_parent_becomes_leaf_when_children_close() {
        let mut m = store();
        let root = m.add_task(NewTask::new("root"));
        let kids = m
            .break_down_task(&root.id, vec![NewTask::new("a"), NewTask::new("b")])
            .unwrap();

        m.update_task(&kids[0].id, TaskUpdate::status(TaskStatus::Completed));
        assert!(!m.get_task(&root.id).unwrap().is_dependency_leaf);

        m.update_task(&kids[1].id, TaskUpdate::status(TaskStatus::Abandoned));
        assert!(m.get_task(&root.id).unwrap().is_dependency_leaf);
    }

    #[test]
    fn test_reopened_child_makes_parent_non_leaf_again() {
        let mut m = store();
        let root = m.add_task(NewTask::new("parent"));
        let child = m.add_task(NewTask::new("child").under(&root.id));

        m.update_task(&child.id, TaskUpdate::status(TaskStatus::Completed));
        assert!(m.get_task(&root.id).unwrap().is_dependency_leaf);

        m.update_task(&child.id, TaskUpdate::status(TaskStatus::Waiting));
        assert!(!m.get_task(&root.id).unwrap().is_dependency_leaf);

        let next = crate::scheduler::get_next_tasks(
            m.tasks(),
            crate::scheduler::NextTaskOptions {
                max_tasks: 5,
                include_parallel: true,
            },
        );
        let ids: Vec<&str> = next.ready_tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![child.id.as_str()]);
    }

    #[test]
    fn test_break_down_unknown_parent() {
        let mut m = store();
        assert!(m.break_down_task("task-missing", vec![NewTask::new("x")]).is_none());
        assert!(m.tasks().is_empty());
    }

    #[test]
    fn test_update_unknown_task_returns_none() {
        let mut m = store();
        assert!(m
            .update_task("nope", TaskUpdate::status(TaskStatus::Completed))
            .is_none());
    }

    #[test]
    fn test_completion_archives_message() {
        let mut m = store();
        let t = m.add_task(NewTask::new("fix regex"));
        m.update_task(
            &t.id,
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                completion_message: Some("patched separability".into()),
                ..Default::default()
            },
        );
        let hits = m.search_archive("separability", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, "task_completed");
    }

    #[test]
    fn test_current_task_overrides_status_inference() {
        let mut m = store();
        let a = m.add_task(NewTask::new("a").status(TaskStatus::Active));
        let b = m.add_task(NewTask::new("b"));
        assert_eq!(m.active_task().unwrap().id, a.id);

        assert!(m.set_current_task(Some(&b.id)));
        assert_eq!(m.active_task().unwrap().id, b.id);
        assert!(!m.set_current_task(Some("task-unknown")));
    }

    #[test]
    fn test_completing_current_task_clears_selection() {
        let mut m = store();
        let a = m.add_task(NewTask::new("a"));
        m.set_current_task(Some(&a.id));
        m.update_task(&a.id, TaskUpdate::status(TaskStatus::Completed));
        assert!(m.working_state().current_task.is_none());
    }

    #[test]
    fn test_task_ancestry_root_first() {
        let mut m = store();
        let root = m.add_task(NewTask::new("root"));
        let mid = m.add_task(NewTask::new("mid").under(&root.id));
        let leaf = m.add_task(NewTask::new("leaf").under(&mid.id));
        let chain: Vec<&str> = m
            .task_ancestry(&leaf.id)
            .iter()
            .map(|t| t.description.as_str())
            .collect();
        assert_eq!(chain, vec!["root", "mid"]);
    }

    #[test]
    fn test_supersede_preference_hides_from_current() {
        let mut m = store();
        let old = m.add_preference("testing", "runner", "pytest", 0.8, Lifespan::Project);
        let new = m.add_preference("testing", "runner", "nextest", 0.9, Lifespan::Project);

        assert!(m.supersede_preference(&old.id, &new.id));

        let current: Vec<&str> = m.preferences().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(current, vec![new.id.as_str()]);
        assert!(m.all_preferences().iter().any(|p| p.id == old.id));
        let old_entry = m.preferences_view().get(&old.id).unwrap();
        assert_eq!(old_entry.superseded_by.as_deref(), Some(new.id.as_str()));
        assert!(old_entry.superseded_at.is_some());
    }

    #[test]
    fn test_supersede_requires_existing_replacement() {
        let mut m = store();
        let old = m.add_decision("arch", "use sqlite", None);
        assert!(!m.supersede_decision(&old.id, "decision-missing"));
        assert!(!m.supersede_decision(&old.id, &old.id));
        assert_eq!(m.decisions().len(), 1);
    }

    #[test]
    fn test_supersede_fact_and_decision_views() {
        let mut m = store();
        let f1 = m.add_user_fact("env", "uses macOS", 0.7, Lifespan::Project);
        let f2 = m.add_user_fact("env", "uses Linux", 0.9, Lifespan::Project);
        m.supersede_user_fact(&f1.id, &f2.id);
        assert_eq!(m.user_facts().len(), 1);
        assert_eq!(m.all_user_facts().len(), 2);

        let d1 = m.add_decision("storage", "json files", Some("simple"));
        let d2 = m.add_decision("storage", "sqlite", Some("queries"));
        m.supersede_decision(&d1.id, &d2.id);
        assert_eq!(m.decisions_view().current().len(), 1);
        assert_eq!(m.decisions_view().all().len(), 2);
    }

    #[test]
    fn test_reinforce_caps_at_one() {
        let mut m = store();
        let p = m.add_preference("style", "indent", "4 spaces", 0.95, Lifespan::Permanent);
        assert!(m.reinforce_preference(&p.id));
        let p = m.preferences_view().get(&p.id).unwrap();
        assert_eq!(p.confidence, 1.0);
        assert!(p.last_reinforced.is_some());
    }

    #[test]
    fn test_goal_one_active_per_branch() {
        let mut m = store();
        let g1 = m.set_goal("ship v1", None);
        let sub = m.set_goal("write docs", Some(&g1.id));
        assert_eq!(sub.depth, 1);
        assert_eq!(m.current_goal().unwrap().id, sub.id);

        let sub2 = m.set_goal("write tests", Some(&g1.id));
        let active_children = m
            .goals()
            .iter()
            .filter(|g| g.parent_goal_id.as_deref() == Some(g1.id.as_str()))
            .filter(|g| g.status == GoalStatus::Active)
            .count();
        assert_eq!(active_children, 1);
        let path: Vec<&str> = m.goal_path().iter().map(|g| g.id.as_str()).collect();
        assert_eq!(path, vec![g1.id.as_str(), sub2.id.as_str()]);
    }

    #[test]
    fn test_working_state_bounds() {
        let mut cfg = MemoryConfig::default();
        cfg.max_active_files = 2;
        cfg.max_recent_errors = 2;
        let mut m = MemoryStore::new(cfg);

        m.record_file_access("a.rs");
        m.record_file_access("b.rs");
        m.record_file_access("a.rs");
        m.record_file_access("c.rs");
        assert_eq!(m.working_state().active_files, vec!["c.rs", "a.rs"]);

        m.record_error("e1");
        m.record_error("e2");
        m.record_error("e3");
        let msgs: Vec<&str> = m
            .working_state()
            .recent_errors
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(msgs, vec!["e2", "e3"]);

        m.resolve_errors();
        assert!(m.unresolved_errors().is_empty());
    }

    #[test]
    fn test_project_context_upsert() {
        let mut m = store();
        m.set_project_context("build", "cargo build", "tooling");
        m.set_project_context("build", "make", "tooling");
        assert_eq!(m.project_context().len(), 1);
        assert_eq!(m.project_context()[0].value, "make");
    }

    #[test]
    fn test_search_archive_ranks_by_term_hits() {
        let mut m = store();
        m.archive("note", "parser handles unicode");
        m.archive("note", "parser handles unicode escapes in strings");
        m.archive("note", "unrelated");
        let hits = m.search_archive("parser escapes", 10);
        assert_eq!(hits.len(), 2);
        assert!(hits[0].content.contains("escapes"));
        assert!(m.search_archive("   ", 10).is_empty());
    }

    #[test]
    fn test_snapshot_persists_iso_dates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory/session.json");

        let mut m = store();
        let t = m.add_task(NewTask::new("persist me").complexity(Complexity::Complex));
        m.set_goal("goal", None);
        m.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let created = raw["tasks"][0]["createdAt"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(created).is_ok());

        let loaded = MemoryStore::load(&path, MemoryConfig::default()).unwrap();
        let task = loaded.get_task(&t.id).unwrap();
        assert_eq!(task.created_at, t.created_at);
        assert_eq!(task.estimated_complexity, Some(Complexity::Complex));
        assert_eq!(loaded.goals().len(), 1);
    }

    #[test]
    fn test_load_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let m = MemoryStore::load(&dir.path().join("none.json"), MemoryConfig::default()).unwrap();
        assert!(m.tasks().is_empty());
    }

    #[test]
    fn test_summary_mentions_goal_and_errors() {
        let mut m = store();
        assert!(m.summary().is_empty());
        m.set_goal("port the parser", None);
        m.record_error("test_qdp failed");
        let s = m.summary();
        assert!(s.contains("port the parser"));
        assert!(s.contains("test_qdp failed"));
    }
}
