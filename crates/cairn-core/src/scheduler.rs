//! Ready-task selection over the session task graph.
//!
//! Pure functions: the scheduler reads `&[Task]` and never mutates it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::memory::{Task, TaskStatus};

#[derive(Debug, Clone, Copy)]
pub struct NextTaskOptions {
    /// Upper bound on tasks returned by parallel selection.
    pub max_tasks: usize,
    /// Return several mutually independent tasks instead of the single top-ranked one.
    pub include_parallel: bool,
}

impl Default for NextTaskOptions {
    fn default() -> Self {
        Self {
            max_tasks: 1,
            include_parallel: false,
        }
    }
}

/// One selected task with the context the caller needs to act on it.
#[derive(Debug, Clone, Serialize)]
pub struct ReadyTask {
    pub id: String,
    pub description: String,
    pub priority: crate::memory::TaskPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_complexity: Option<crate::memory::Complexity>,
    pub depth: u32,
    pub blocking_count: usize,
    /// Resolved dependencies: id -> description.
    pub dependencies_completed: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NextTasksResult {
    pub ready_tasks: Vec<ReadyTask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Number of parent hops from `id` to its root.
///
/// Memoized; a `parent_id` cycle is cut at the first repeated id.
pub fn calculate_depth(
    id: &str,
    by_id: &HashMap<&str, &Task>,
    memo: &mut HashMap<String, u32>,
) -> u32 {
    if let Some(d) = memo.get(id) {
        return *d;
    }
    let mut chain: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut cursor = Some(id);
    let mut base = 0;
    while let Some(cur) = cursor {
        if let Some(d) = memo.get(cur) {
            base = *d + 1;
            break;
        }
        if !seen.insert(cur) {
            break;
        }
        chain.push(cur);
        cursor = by_id.get(cur).and_then(|t| t.parent_id.as_deref());
        if let Some(next) = cursor {
            if !by_id.contains_key(next) {
                break;
            }
        }
    }
    // `chain` runs from `id` up toward the root; assign depths from the top down.
    // When the walk stopped on a memo hit, `base` is the depth of the topmost chain entry.
    let len = chain.len() as u32;
    for (i, cur) in chain.iter().enumerate() {
        let d = base + (len - 1 - i as u32);
        memo.insert(cur.to_string(), d);
    }
    memo.get(id).copied().unwrap_or(0)
}

/// Non-root ancestors of `id` (the root, a task without `parent_id`, is excluded).
fn non_root_ancestors<'a>(id: &str, by_id: &HashMap<&'a str, &'a Task>) -> HashSet<&'a str> {
    let mut out = HashSet::new();
    let mut cursor = by_id.get(id).and_then(|t| t.parent_id.as_deref());
    while let Some(pid) = cursor {
        let Some(&parent) = by_id.get(pid) else { break };
        if parent.parent_id.is_none() {
            break;
        }
        if !out.insert(parent.id.as_str()) {
            break;
        }
        cursor = parent.parent_id.as_deref();
    }
    out
}

fn is_ready(task: &Task, by_id: &HashMap<&str, &Task>) -> bool {
    task.status == TaskStatus::Waiting
        && task.is_dependency_leaf
        && task.depends_on.iter().all(|dep| {
            by_id
                .get(dep.as_str())
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
}

/// Select the next ready unit(s) of work.
///
/// Sequential selection yields at most one task; `max_tasks` only bounds
/// parallel selection.
pub fn get_next_tasks(tasks: &[Task], opts: NextTaskOptions) -> NextTasksResult {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut blocking: HashMap<&str, usize> = HashMap::new();
    for t in tasks {
        for dep in &t.depends_on {
            *blocking.entry(dep.as_str()).or_default() += 1;
        }
    }

    let mut memo = HashMap::new();
    let mut ready: Vec<(&Task, usize, u32)> = tasks
        .iter()
        .filter(|t| is_ready(t, &by_id))
        .map(|t| {
            let count = blocking.get(t.id.as_str()).copied().unwrap_or(0);
            let depth = t
                .breakdown_depth
                .unwrap_or_else(|| calculate_depth(&t.id, &by_id, &mut memo));
            (t, count, depth)
        })
        .collect();

    if ready.is_empty() {
        return NextTasksResult {
            ready_tasks: Vec::new(),
            message: Some(empty_message(tasks)),
        };
    }

    // Stable: equal keys keep insertion order.
    ready.sort_by(|a, b| rank(a, b));

    let max = opts.max_tasks.max(1);
    let selected: Vec<&(&Task, usize, u32)> = if opts.include_parallel {
        let mut taken: Vec<&(&Task, usize, u32)> = Vec::new();
        let mut claimed: HashSet<&str> = HashSet::new();
        for entry in &ready {
            if taken.len() >= max {
                break;
            }
            let ancestors = non_root_ancestors(&entry.0.id, &by_id);
            if ancestors.iter().any(|a| claimed.contains(a)) {
                continue;
            }
            claimed.extend(ancestors);
            taken.push(entry);
        }
        taken
    } else {
        // Without parallel selection only the top-ranked task is handed out.
        ready.iter().take(1).collect()
    };

    let ready_tasks = selected
        .into_iter()
        .map(|(task, count, depth)| ReadyTask {
            id: task.id.clone(),
            description: task.description.clone(),
            priority: task.priority,
            estimated_complexity: task.estimated_complexity,
            depth: *depth,
            blocking_count: *count,
            dependencies_completed: task
                .depends_on
                .iter()
                .filter_map(|dep| by_id.get(dep.as_str()))
                .map(|d| (d.id.clone(), d.description.clone()))
                .collect(),
            parent_id: task.parent_id.clone(),
        })
        .collect();

    NextTasksResult {
        ready_tasks,
        message: None,
    }
}

fn rank(a: &(&Task, usize, u32), b: &(&Task, usize, u32)) -> Ordering {
    let complexity = |t: &Task| t.estimated_complexity.map(|c| c.rank()).unwrap_or(0);
    b.1.cmp(&a.1)
        .then(a.2.cmp(&b.2))
        .then(complexity(b.0).cmp(&complexity(a.0)))
}

fn empty_message(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "No tasks exist yet.".to_string();
    }
    if tasks.iter().all(|t| t.status.is_closed()) {
        return "All tasks are complete.".to_string();
    }
    let waiting_on_deps = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Waiting && t.is_dependency_leaf)
        .count();
    let blocked = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .count();
    let active = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Active)
        .count();
    format!(
        "No tasks are ready: {active} active, {blocked} blocked, \
         {waiting_on_deps} waiting on incomplete dependencies."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Complexity, MemoryStore, NewTask, TaskUpdate};
    use cairn_config::MemoryConfig;

    fn ids(result: &NextTasksResult) -> Vec<&str> {
        result.ready_tasks.iter().map(|t| t.id.as_str()).collect()
    }

    /// root -> {p1 -> a, p2 -> b}, plus c under p1 depending on a.
    fn scenario() -> (MemoryStore, String, String, String) {
        let mut m = MemoryStore::new(MemoryConfig::default());
        let root = m.add_task(NewTask::new("root").status(TaskStatus::Active));
        let p1 = m.add_task(NewTask::new("p1").under(&root.id).status(TaskStatus::Active));
        let p2 = m.add_task(NewTask::new("p2").under(&root.id).status(TaskStatus::Active));
        let a = m.add_task(NewTask::new("a").under(&p1.id));
        let b = m.add_task(NewTask::new("b").under(&p2.id));
        let c = m.add_task(NewTask::new("c").under(&p1.id).depends_on(&[&a.id]));
        (m, a.id, b.id, c.id)
    }

    #[test]
    fn test_parallel_returns_independent_branches() {
        let (m, a, b, c) = scenario();
        let result = get_next_tasks(
            m.tasks(),
            NextTaskOptions {
                max_tasks: 2,
                include_parallel: true,
            },
        );
        let got = ids(&result);
        assert_eq!(got, vec![a.as_str(), b.as_str()]);
        assert!(!got.contains(&c.as_str()));
        assert!(result.message.is_none());
    }

    #[test]
    fn test_sequential_returns_top_ranked_only() {
        let (m, a, _, _) = scenario();
        let result = get_next_tasks(m.tasks(), NextTaskOptions::default());
        assert_eq!(ids(&result), vec![a.as_str()]);
        assert_eq!(result.ready_tasks[0].blocking_count, 1);
    }

    #[test]
    fn test_sequential_ignores_larger_max_tasks() {
        let (m, a, _, c) = scenario();
        let result = get_next_tasks(
            m.tasks(),
            NextTaskOptions {
                max_tasks: 2,
                include_parallel: false,
            },
        );
        assert_eq!(ids(&result), vec![a.as_str()]);
        assert!(!ids(&result).contains(&c.as_str()));

        let result = get_next_tasks(
            m.tasks(),
            NextTaskOptions {
                max_tasks: 5,
                include_parallel: false,
            },
        );
        assert_eq!(ids(&result), vec![a.as_str()]);
    }

    #[test]
    fn test_siblings_under_same_non_root_parent_not_parallel() {
        let mut m = MemoryStore::new(MemoryConfig::default());
        let root = m.add_task(NewTask::new("root").status(TaskStatus::Active));
        let p = m.add_task(NewTask::new("p").under(&root.id).status(TaskStatus::Active));
        let x = m.add_task(NewTask::new("x").under(&p.id));
        m.add_task(NewTask::new("y").under(&p.id));

        let result = get_next_tasks(
            m.tasks(),
            NextTaskOptions {
                max_tasks: 3,
                include_parallel: true,
            },
        );
        assert_eq!(ids(&result), vec![x.id.as_str()]);
    }

    #[test]
    fn test_children_of_same_root_are_parallel() {
        let mut m = MemoryStore::new(MemoryConfig::default());
        let root = m.add_task(NewTask::new("root").status(TaskStatus::Active));
        let x = m.add_task(NewTask::new("x").under(&root.id));
        let y = m.add_task(NewTask::new("y").under(&root.id));
        let result = get_next_tasks(
            m.tasks(),
            NextTaskOptions {
                max_tasks: 3,
                include_parallel: true,
            },
        );
        assert_eq!(ids(&result), vec![x.id.as_str(), y.id.as_str()]);
    }

    #[test]
    fn test_dependency_becomes_ready_after_completion() {
        let (mut m, a, _, c) = scenario();
        m.update_task(
            &a,
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            },
        );
        let result = get_next_tasks(
            m.tasks(),
            NextTaskOptions {
                max_tasks: 5,
                include_parallel: true,
            },
        );
        let entry = result.ready_tasks.iter().find(|t| t.id == c).unwrap();
        assert_eq!(entry.dependencies_completed.get(&a).unwrap(), "a");
    }

    #[test]
    fn test_never_returns_unready_tasks() {
        let (mut m, a, b, _) = scenario();
        m.update_task(&b, TaskUpdate::status(TaskStatus::Blocked));
        m.add_task(NewTask::new("dangling").depends_on(&["task-missing"]));
        let result = get_next_tasks(
            m.tasks(),
            NextTaskOptions {
                max_tasks: 10,
                include_parallel: false,
            },
        );
        for t in &result.ready_tasks {
            let task = m.get_task(&t.id).unwrap();
            assert_eq!(task.status, TaskStatus::Waiting);
            for dep in &task.depends_on {
                assert_eq!(m.get_task(dep).map(|d| d.status), Some(TaskStatus::Completed));
            }
        }
        assert_eq!(ids(&result), vec![a.as_str()]);
    }

    #[test]
    fn test_complexity_breaks_ties() {
        let mut m = MemoryStore::new(MemoryConfig::default());
        let easy = m.add_task(NewTask::new("easy").complexity(Complexity::Simple));
        let hard = m.add_task(NewTask::new("hard").complexity(Complexity::Complex));
        let mid = m.add_task(NewTask::new("mid").complexity(Complexity::Moderate));
        let result = get_next_tasks(
            m.tasks(),
            NextTaskOptions {
                max_tasks: 3,
                include_parallel: true,
            },
        );
        assert_eq!(
            ids(&result),
            vec![hard.id.as_str(), mid.id.as_str(), easy.id.as_str()]
        );
    }

    #[test]
    fn test_shallower_tasks_first() {
        let mut m = MemoryStore::new(MemoryConfig::default());
        let root = m.add_task(NewTask::new("root").status(TaskStatus::Active));
        let deep = m.add_task(NewTask::new("deep").under(&root.id).complexity(Complexity::Complex));
        let shallow = m.add_task(NewTask::new("shallow"));
        let result = get_next_tasks(
            m.tasks(),
            NextTaskOptions {
                max_tasks: 2,
                include_parallel: true,
            },
        );
        assert_eq!(ids(&result), vec![shallow.id.as_str(), deep.id.as_str()]);
    }

    #[test]
    fn test_empty_messages_distinguish_states() {
        let empty = get_next_tasks(&[], NextTaskOptions::default());
        assert!(empty.ready_tasks.is_empty());
        assert_eq!(empty.message.as_deref(), Some("No tasks exist yet."));

        let mut m = MemoryStore::new(MemoryConfig::default());
        let t = m.add_task(NewTask::new("only"));
        m.update_task(&t.id, TaskUpdate::status(TaskStatus::Completed));
        let done = get_next_tasks(m.tasks(), NextTaskOptions::default());
        assert_eq!(done.message.as_deref(), Some("All tasks are complete."));

        let mut m = MemoryStore::new(MemoryConfig::default());
        m.add_task(NewTask::new("stuck").status(TaskStatus::Blocked));
        let stuck = get_next_tasks(m.tasks(), NextTaskOptions::default());
        assert!(stuck.message.unwrap().starts_with("No tasks are ready"));
    }

    #[test]
    fn test_calculate_depth_survives_cycle() {
        let now = chrono::Utc::now();
        let mk = |id: &str, parent: &str| Task {
            id: id.into(),
            description: id.into(),
            status: TaskStatus::Waiting,
            parent_id: Some(parent.into()),
            depends_on: vec![],
            priority: Default::default(),
            estimated_complexity: None,
            actual_complexity: None,
            breakdown_depth: None,
            is_dependency_leaf: true,
            blocked_by: None,
            completion_message: None,
            related_files: vec![],
            created_at: now,
            updated_at: now,
        };
        let tasks = vec![mk("x", "y"), mk("y", "x")];
        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut memo = HashMap::new();
        // Terminates; the exact value for a cyclic chain is unspecified.
        let _ = calculate_depth("x", &by_id, &mut memo);
        let result = get_next_tasks(&tasks, NextTaskOptions::default());
        assert_eq!(result.ready_tasks.len(), 1);
    }

    #[test]
    fn test_calculate_depth_uses_memo() {
        let mut m = MemoryStore::new(MemoryConfig::default());
        let root = m.add_task(NewTask::new("root"));
        let mid = m.add_task(NewTask::new("mid").under(&root.id));
        let leaf = m.add_task(NewTask::new("leaf").under(&mid.id));
        let by_id: HashMap<&str, &Task> = m.tasks().iter().map(|t| (t.id.as_str(), t)).collect();
        let mut memo = HashMap::new();
        assert_eq!(calculate_depth(&mid.id, &by_id, &mut memo), 1);
        assert_eq!(calculate_depth(&leaf.id, &by_id, &mut memo), 2);
        assert_eq!(calculate_depth(&root.id, &by_id, &mut memo), 0);
    }
}
