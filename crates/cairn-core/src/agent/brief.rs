use serde::{Deserialize, Serialize};

use crate::memory::MemoryStore;

const MAX_BRIEF_ERRORS: usize = 5;

/// What to carry from the parent session into a subagent brief.
#[derive(Debug, Clone)]
pub struct BriefOptions {
    /// Task the subagent is working; pulls in its ancestry and siblings.
    pub task_id: Option<String>,
    pub files: Vec<String>,
    pub max_preferences: usize,
    pub max_context: usize,
}

impl Default for BriefOptions {
    fn default() -> Self {
        Self {
            task_id: None,
            files: Vec::new(),
            max_preferences: 5,
            max_context: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BriefPreference {
    pub category: String,
    pub key: String,
    pub value: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BriefContextEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BriefTask {
    pub id: String,
    pub description: String,
    /// Ancestor descriptions, root first.
    pub ancestry: Vec<String>,
    /// Other children of the same parent, as `[status] description`.
    pub siblings: Vec<String>,
    /// Completed dependencies, as `description: completion message`.
    pub dependencies: Vec<String>,
}

/// Read-only snapshot of session memory handed to a subagent at spawn time.
///
/// The brief is plain data: the subagent never sees the live store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryBrief {
    pub goal_path: Vec<String>,
    pub preferences: Vec<BriefPreference>,
    pub project_context: Vec<BriefContextEntry>,
    pub task: Option<BriefTask>,
    pub files: Vec<String>,
    pub recent_errors: Vec<String>,
}

impl MemoryBrief {
    pub fn from_store(store: &MemoryStore, opts: &BriefOptions) -> Self {
        let goal_path = store
            .goal_path()
            .into_iter()
            .map(|g| g.description.clone())
            .collect();

        let mut prefs = store.preferences();
        prefs.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let preferences = prefs
            .into_iter()
            .take(opts.max_preferences)
            .map(|p| BriefPreference {
                category: p.category.clone(),
                key: p.key.clone(),
                value: p.value.clone(),
                confidence: p.confidence,
            })
            .collect();

        let mut context: Vec<_> = store.project_context().iter().collect();
        context.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let project_context = context
            .into_iter()
            .take(opts.max_context)
            .map(|c| BriefContextEntry {
                key: c.key.clone(),
                value: c.value.clone(),
            })
            .collect();

        let mut files = opts.files.clone();
        let task = opts.task_id.as_deref().and_then(|id| store.get_task(id)).map(|task| {
            for f in &task.related_files {
                if !files.contains(f) {
                    files.push(f.clone());
                }
            }
            let siblings = match task.parent_id.as_deref() {
                Some(pid) => store
                    .children_of(pid)
                    .into_iter()
                    .filter(|s| s.id != task.id)
                    .map(|s| format!("[{}] {}", s.status.as_str(), s.description))
                    .collect(),
                None => Vec::new(),
            };
            let dependencies = task
                .depends_on
                .iter()
                .filter_map(|d| store.get_task(d))
                .map(|d| match &d.completion_message {
                    Some(msg) => format!("{}: {msg}", d.description),
                    None => d.description.clone(),
                })
                .collect();
            BriefTask {
                id: task.id.clone(),
                description: task.description.clone(),
                ancestry: store
                    .task_ancestry(&task.id)
                    .into_iter()
                    .map(|t| t.description.clone())
                    .collect(),
                siblings,
                dependencies,
            }
        });

        let errors = store.unresolved_errors();
        let skip = errors.len().saturating_sub(MAX_BRIEF_ERRORS);
        let recent_errors = errors.into_iter().skip(skip).map(|e| e.message.clone()).collect();

        Self {
            goal_path,
            preferences,
            project_context,
            task,
            files,
            recent_errors,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.goal_path.is_empty()
            && self.preferences.is_empty()
            && self.project_context.is_empty()
            && self.task.is_none()
            && self.files.is_empty()
            && self.recent_errors.is_empty()
    }

    /// Render the brief as markdown sections appended to `base`.
    pub fn to_system_prompt(&self, base: &str) -> String {
        let mut parts = vec![base.trim_end().to_string()];

        if !self.goal_path.is_empty() {
            parts.push(format!("## Session Goal\n{}", self.goal_path.join(" > ")));
        }

        if let Some(task) = &self.task {
            let mut section = format!("## Your Task\n[{}] {}", task.id, task.description);
            if !task.ancestry.is_empty() {
                section.push_str(&format!("\nPart of: {}", task.ancestry.join(" > ")));
            }
            if !task.dependencies.is_empty() {
                section.push_str("\nBuilds on:");
                for d in &task.dependencies {
                    section.push_str(&format!("\n- {d}"));
                }
            }
            if !task.siblings.is_empty() {
                section.push_str("\nSibling tasks (handled elsewhere, do not do them):");
                for s in &task.siblings {
                    section.push_str(&format!("\n- {s}"));
                }
            }
            parts.push(section);
        }

        if !self.preferences.is_empty() {
            let lines: Vec<String> = self
                .preferences
                .iter()
                .map(|p| format!("- {}/{}: {}", p.category, p.key, p.value))
                .collect();
            parts.push(format!("## User Preferences\n{}", lines.join("\n")));
        }

        if !self.project_context.is_empty() {
            let lines: Vec<String> = self
                .project_context
                .iter()
                .map(|c| format!("- {}: {}", c.key, c.value))
                .collect();
            parts.push(format!("## Project Context\n{}", lines.join("\n")));
        }

        if !self.files.is_empty() {
            let lines: Vec<String> = self.files.iter().map(|f| format!("- {f}")).collect();
            parts.push(format!("## Relevant Files\n{}", lines.join("\n")));
        }

        if !self.recent_errors.is_empty() {
            let lines: Vec<String> = self.recent_errors.iter().map(|e| format!("- {e}")).collect();
            parts.push(format!("## Unresolved Errors\n{}", lines.join("\n")));
        }

        parts.join("\n\n")
    }
}
