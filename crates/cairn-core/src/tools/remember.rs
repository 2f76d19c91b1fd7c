use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ToolError;
use crate::memory::{Lifespan, MemoryStore, SharedMemory};
use crate::tools::{parse_params, schema_of, Tool, ToolContext, ToolOutput};

const DEFAULT_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RememberKind {
    Preference,
    Fact,
    Decision,
    Context,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RememberParams {
    pub kind: RememberKind,
    /// Category, e.g. testing, style, environment
    pub category: String,
    /// Preference or project-context key (required for 'preference' and 'context')
    #[serde(default)]
    pub key: Option<String>,
    /// The preference value, fact, decision or context value
    pub content: String,
    /// Why the decision was made (for 'decision')
    #[serde(default)]
    pub rationale: Option<String>,
    /// Confidence between 0 and 1 (default 0.7)
    #[serde(default)]
    pub confidence: Option<f64>,
    /// session, project or permanent (default session)
    #[serde(default)]
    pub lifespan: Option<String>,
    /// Id of an older entry this one replaces
    #[serde(default)]
    pub supersedes: Option<String>,
}

fn parse_lifespan(s: Option<&str>) -> Result<Lifespan, ToolError> {
    match s.map(|s| s.to_lowercase()).as_deref() {
        None | Some("session") => Ok(Lifespan::Session),
        Some("project") => Ok(Lifespan::Project),
        Some("permanent") => Ok(Lifespan::Permanent),
        Some(other) => Err(ToolError::InvalidParams {
            tool: "remember".into(),
            errors: vec![format!("lifespan: unrecognised value '{other}'")],
        }),
    }
}

fn require_key(p: &RememberParams) -> Result<String, ToolError> {
    p.key.clone().ok_or_else(|| ToolError::InvalidParams {
        tool: "remember".into(),
        errors: vec!["key: required for this kind".into()],
    })
}

/// Record preferences, facts, decisions and project context in session memory.
///
/// Restating a known preference reinforces it; giving an existing key a new
/// value supersedes the old entry.
pub struct RememberTool {
    memory: SharedMemory,
}

impl RememberTool {
    pub fn new(memory: SharedMemory) -> Self {
        Self { memory }
    }

    fn remember_preference(
        m: &mut MemoryStore,
        p: &RememberParams,
    ) -> Result<ToolOutput, ToolError> {
        let key = require_key(p)?;
        let existing = m
            .preferences()
            .into_iter()
            .find(|e| e.category == p.category && e.key == key)
            .map(|e| (e.id.clone(), e.value == p.content));

        if let Some((id, true)) = &existing {
            if p.supersedes.is_none() {
                m.reinforce_preference(id);
                return Ok(ToolOutput::ok(format!("Reinforced preference {id}")));
            }
        }

        let lifespan = parse_lifespan(p.lifespan.as_deref())?;
        let confidence = p.confidence.unwrap_or(DEFAULT_CONFIDENCE);
        let pref = m.add_preference(&p.category, &key, &p.content, confidence, lifespan);
        let replaced = p.supersedes.clone().or(existing.map(|(id, _)| id));
        if let Some(old) = replaced.as_deref() {
            if !m.supersede_preference(old, &pref.id) {
                return Err(ToolError::execution(format!("Preference not found: {old}")));
            }
            debug!("Preference {old} superseded by {}", pref.id);
        }
        Ok(ToolOutput::ok(format!("Remembered preference {}", pref.id))
            .with_metadata(json!({ "id": pref.id, "supersedes": replaced })))
    }

    fn remember_fact(m: &mut MemoryStore, p: &RememberParams) -> Result<ToolOutput, ToolError> {
        let same = m
            .user_facts()
            .into_iter()
            .find(|f| f.fact.eq_ignore_ascii_case(&p.content))
            .map(|f| f.id.clone());
        if let (Some(id), None) = (&same, &p.supersedes) {
            m.reinforce_user_fact(id);
            return Ok(ToolOutput::ok(format!("Reinforced fact {id}")));
        }

        let lifespan = parse_lifespan(p.lifespan.as_deref())?;
        let confidence = p.confidence.unwrap_or(DEFAULT_CONFIDENCE);
        let fact = m.add_user_fact(&p.category, &p.content, confidence, lifespan);
        if let Some(old) = p.supersedes.as_deref() {
            if !m.supersede_user_fact(old, &fact.id) {
                return Err(ToolError::execution(format!("Fact not found: {old}")));
            }
        }
        Ok(ToolOutput::ok(format!("Remembered fact {}", fact.id))
            .with_metadata(json!({ "id": fact.id })))
    }

    fn remember_decision(
        m: &mut MemoryStore,
        p: &RememberParams,
    ) -> Result<ToolOutput, ToolError> {
        let decision = m.add_decision(&p.category, &p.content, p.rationale.as_deref());
        if let Some(old) = p.supersedes.as_deref() {
            if !m.supersede_decision(old, &decision.id) {
                return Err(ToolError::execution(format!("Decision not found: {old}")));
            }
        }
        Ok(ToolOutput::ok(format!("Recorded decision {}", decision.id))
            .with_metadata(json!({ "id": decision.id })))
    }
}

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Store something worth keeping for the rest of the session: a user preference, a fact \
         about the user or environment, a design decision, or project context (build commands, \
         layout). Use 'supersedes' to replace an outdated entry."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<RememberParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let p: RememberParams = parse_params(self.name(), params)?;
        if let Some(c) = p.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(ToolError::InvalidParams {
                    tool: "remember".into(),
                    errors: vec![format!("confidence: {c} is outside 0..=1")],
                });
            }
        }
        let mut m = self.memory.lock().await;
        match p.kind {
            RememberKind::Preference => Self::remember_preference(&mut m, &p),
            RememberKind::Fact => Self::remember_fact(&mut m, &p),
            RememberKind::Decision => Self::remember_decision(&mut m, &p),
            RememberKind::Context => {
                let key = require_key(&p)?;
                m.set_project_context(&key, &p.content, &p.category);
                Ok(ToolOutput::ok(format!("Project context '{key}' saved")))
            }
        }
    }
}
