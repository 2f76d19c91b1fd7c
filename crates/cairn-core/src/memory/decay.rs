use cairn_config::MemoryConfig;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::types::{DecayClass, Lifespan, MemoryEntry};
use super::MemoryStore;

/// Counts from one decay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecayReport {
    pub decayed: usize,
    pub skipped_stable: usize,
    pub at_floor: usize,
}

/// Linear decay for `hours` at `rate`, floored at `min`.
///
/// Never raises confidence: an entry already below the floor keeps its value.
pub fn decayed_confidence(current: f64, rate: f64, hours: f64, min: f64) -> f64 {
    let hours = hours.max(0.0);
    (current - rate * hours).max(min).min(current)
}

fn rate_for(config: &MemoryConfig, class: DecayClass, category: &str) -> f64 {
    if config.exploratory_categories.iter().any(|c| c == category) {
        return config.exploratory_decay_rate;
    }
    match class {
        DecayClass::Preference => config.preference_decay_rate,
        DecayClass::UserFact => config.user_fact_decay_rate,
        DecayClass::None => 0.0,
    }
}

struct DecayInput<'a> {
    confidence: &'a mut f64,
    category: &'a str,
    lifespan: Lifespan,
    anchor: DateTime<Utc>,
    last_decayed: &'a mut Option<DateTime<Utc>>,
    class: DecayClass,
    current: bool,
}

fn decay_one(
    entry: DecayInput<'_>,
    config: &MemoryConfig,
    now: DateTime<Utc>,
    report: &mut DecayReport,
) {
    if !entry.current {
        return;
    }
    if entry.lifespan == Lifespan::Permanent
        || config.stable_categories.iter().any(|c| c == entry.category)
    {
        report.skipped_stable += 1;
        return;
    }

    // Time already charged by an earlier pass is not charged again.
    let since = match *entry.last_decayed {
        Some(t) if t > entry.anchor => t,
        _ => entry.anchor,
    };
    let hours = (now - since).num_seconds() as f64 / 3600.0;
    let rate = rate_for(config, entry.class, entry.category);
    let next = decayed_confidence(*entry.confidence, rate, hours, config.min_confidence);

    if next < *entry.confidence {
        report.decayed += 1;
    }
    if next <= config.min_confidence {
        report.at_floor += 1;
    }
    *entry.confidence = next;
    *entry.last_decayed = Some(now);
}

impl MemoryStore {
    /// Apply time-based decay to every current, non-stable preference and fact.
    /// `None` uses the store's own configuration.
    ///
    /// Hours are counted from the later of the last reinforcement (or creation)
    /// and the previous decay pass, not from the last reinforcement alone. A
    /// single pass matches `confidence - rate * hours_since_reinforced`; repeated
    /// passes sum to the same total instead of compounding.
    pub fn apply_confidence_decay(&mut self, config: Option<&MemoryConfig>) -> DecayReport {
        self.apply_confidence_decay_at(config, Utc::now())
    }

    pub fn apply_confidence_decay_at(
        &mut self,
        config: Option<&MemoryConfig>,
        now: DateTime<Utc>,
    ) -> DecayReport {
        let config = config.cloned().unwrap_or_else(|| self.config().clone());
        let mut report = DecayReport::default();

        for p in self.data.preferences.iter_mut() {
            let current = p.is_current();
            let class = p.decay_class();
            decay_one(
                DecayInput {
                    confidence: &mut p.confidence,
                    category: &p.category,
                    lifespan: p.lifespan,
                    anchor: p.last_reinforced.unwrap_or(p.timestamp),
                    last_decayed: &mut p.last_decayed,
                    class,
                    current,
                },
                &config,
                now,
                &mut report,
            );
        }

        for f in self.data.user_facts.iter_mut() {
            let current = f.is_current();
            let class = f.decay_class();
            decay_one(
                DecayInput {
                    confidence: &mut f.confidence,
                    category: &f.category,
                    lifespan: f.lifespan,
                    anchor: f.last_reinforced.unwrap_or(f.timestamp),
                    last_decayed: &mut f.last_decayed,
                    class,
                    current,
                },
                &config,
                now,
                &mut report,
            );
        }

        debug!(
            "Confidence decay: {} decayed, {} stable, {} at floor",
            report.decayed, report.skipped_stable, report.at_floor
        );
        report
    }
}
