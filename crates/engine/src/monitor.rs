//! Echo-poisoning and staleness defenses.
//!
//! The monitor grounds tool output against the last known state snapshot:
//! identifiers the backend no longer knows are flagged, repeated identical
//! errors trigger a corrector, a FIFO of call fingerprints catches the
//! loop that keeps issuing the exact same call, and queued corrections
//! are injected into the next THINK at critical priority.

use std::collections::{HashMap, VecDeque};

use chrono::Duration;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ta_domain::awareness::StateSnapshot;
use ta_domain::config::MonitorConfig;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    InvalidId,
    StaleState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    /// The claim that failed validation (an id, a count).
    pub claimed: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone)]
pub struct ErrorLoop {
    pub count: u32,
    pub message: String,
}

/// The same call (tool + normalised args + error) was recorded N times
/// in a row.
#[derive(Debug, Clone)]
pub struct RepeatedCall {
    pub tool: String,
    pub count: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Staleness report
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StalenessLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessReport {
    pub age_seconds: i64,
    pub level: StalenessLevel,
    pub contradictions: Vec<String>,
    pub can_resume: bool,
    pub recommendation: String,
}

/// Classify checkpoint age and contradictions for session resumption.
pub fn staleness_report(age: Duration, contradictions: Vec<String>) -> StalenessReport {
    let level = if age <= Duration::hours(1) {
        StalenessLevel::Low
    } else if age <= Duration::days(1) {
        StalenessLevel::Medium
    } else if age <= Duration::days(4) {
        StalenessLevel::High
    } else {
        StalenessLevel::Critical
    };
    let can_resume = level != StalenessLevel::Critical;
    let recommendation = match level {
        StalenessLevel::Low => "Safe to resume.".to_string(),
        StalenessLevel::Medium => {
            "Resume, but refresh state before acting on cached identifiers.".to_string()
        }
        StalenessLevel::High => {
            "Resume only after a full state refresh; cached context is likely outdated."
                .to_string()
        }
        StalenessLevel::Critical => {
            "Too old to resume safely; start a fresh session.".to_string()
        }
    };
    StalenessReport {
        age_seconds: age.num_seconds(),
        level,
        contradictions,
        can_resume,
        recommendation,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Monitor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    tool: String,
    args: String,
    error: Option<String>,
}

pub struct EchoMonitor {
    config: MonitorConfig,
    fingerprints: VecDeque<Fingerprint>,
    /// scope → (last error message, consecutive count).
    error_streaks: HashMap<String, (String, u32)>,
    pending_corrections: Vec<String>,
    id_field: Regex,
    id_token: Regex,
    count_field: Regex,
}

impl EchoMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            fingerprints: VecDeque::new(),
            error_streaks: HashMap::new(),
            pending_corrections: Vec::new(),
            id_field: Regex::new(r#""(?:id|element_id|target_id)"\s*:\s*"([^"]+)""#)
                .expect("static regex"),
            id_token: Regex::new(r"\b(el|node|obj)-[A-Za-z0-9]+\b").expect("static regex"),
            count_field: Regex::new(r#""(?:element_count|count)"\s*:\s*(\d+)"#)
                .expect("static regex"),
        }
    }

    /// Record a dispatched call's fingerprint (tool + normalised args +
    /// error message, if any). Returns a repetition hint once the exact
    /// same call has been recorded N times in a row; the FIFO resets on
    /// detection so the hint fires once per streak.
    pub fn record(&mut self, tool: &str, args: &Value, error: Option<&str>) -> Option<RepeatedCall> {
        let fingerprint = Fingerprint {
            tool: tool.to_string(),
            args: normalize_args(args),
            error: error.map(str::to_string),
        };
        self.fingerprints.push_back(fingerprint);
        while self.fingerprints.len() > self.config.fingerprint_capacity {
            self.fingerprints.pop_front();
        }

        let last = self.fingerprints.back()?;
        let run = self
            .fingerprints
            .iter()
            .rev()
            .take_while(|f| *f == last)
            .count() as u32;
        if run >= self.config.error_loop_n {
            let tool = last.tool.clone();
            self.fingerprints.clear();
            Some(RepeatedCall { tool, count: run })
        } else {
            None
        }
    }

    /// Validate a tool result against the last known snapshot.
    ///
    /// Every identifier the result references must exist in the snapshot;
    /// a claimed element count that diverges from the snapshot by the
    /// configured significance threshold is stale state.
    pub fn validate_tool_result(
        &self,
        _tool: &str,
        result: &Value,
        snapshot: &StateSnapshot,
    ) -> ValidationOutcome {
        let mut issues = Vec::new();
        let text = result.to_string();

        let mut claimed_ids: Vec<String> = self
            .id_field
            .captures_iter(&text)
            .map(|c| c[1].to_string())
            .collect();
        for m in self.id_token.find_iter(&text) {
            claimed_ids.push(m.as_str().to_string());
        }
        claimed_ids.sort();
        claimed_ids.dedup();

        for id in claimed_ids {
            if !snapshot.contains_id(&id) {
                issues.push(ValidationIssue {
                    kind: IssueKind::InvalidId,
                    claimed: id,
                });
            }
        }

        for capture in self.count_field.captures_iter(&text) {
            if let Ok(claimed) = capture[1].parse::<usize>() {
                let diff = claimed.abs_diff(snapshot.element_count);
                if diff >= self.config.significant_change {
                    issues.push(ValidationIssue {
                        kind: IssueKind::StaleState,
                        claimed: format!(
                            "count {claimed} (snapshot has {})",
                            snapshot.element_count
                        ),
                    });
                }
            }
        }

        ValidationOutcome {
            valid: issues.is_empty(),
            issues,
        }
    }

    /// Track consecutive identical errors per scope. Returns the loop
    /// details once the streak reaches the configured N.
    pub fn detect_error_loop(&mut self, message: &str, scope: &str) -> Option<ErrorLoop> {
        let entry = self
            .error_streaks
            .entry(scope.to_string())
            .or_insert_with(|| (message.to_string(), 0));
        if entry.0 == message {
            entry.1 += 1;
        } else {
            *entry = (message.to_string(), 1);
        }
        if entry.1 >= self.config.error_loop_n {
            Some(ErrorLoop {
                count: entry.1,
                message: message.to_string(),
            })
        } else {
            None
        }
    }

    /// A successful call in a scope breaks its streak.
    pub fn clear_error_streak(&mut self, scope: &str) {
        self.error_streaks.remove(scope);
    }

    // ── Corrections ───────────────────────────────────────────────

    pub fn add_invalid_id_correction(&mut self, id: &str) {
        self.pending_corrections.push(format!(
            "Correction: the identifier '{id}' does not exist in the current state. \
             Do not reference it again; fetch fresh state to find valid identifiers."
        ));
    }

    pub fn add_repeated_error_correction(&mut self, scope: &str, count: u32) {
        self.pending_corrections.push(format!(
            "Correction: the same error from '{scope}' has now occurred {count} times in a row. \
             Stop repeating this call. Change the approach or ask for clarification."
        ));
    }

    pub fn add_repeated_call_correction(&mut self, tool: &str, count: u32) {
        self.pending_corrections.push(format!(
            "Correction: the exact same '{tool}' call has now been issued {count} times in a row. \
             Repeating it will not change anything; pick a different action or different arguments."
        ));
    }

    pub fn add_stale_state_correction(&mut self, detail: &str) {
        self.pending_corrections.push(format!(
            "Correction: the last tool result contradicts the current state ({detail}). \
             Trust the state snapshot over earlier tool output."
        ));
    }

    /// Drain queued corrections as one text block for the ephemeral tier.
    pub fn pop_pending_corrections(&mut self) -> Option<String> {
        if self.pending_corrections.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending_corrections).join("\n"))
    }

    pub fn has_pending_corrections(&self) -> bool {
        !self.pending_corrections.is_empty()
    }
}

/// Stable textual form of tool args for fingerprinting: serde_json's
/// object rendering is key-sorted only for maps built that way, so sort
/// keys explicitly.
fn normalize_args(args: &Value) -> String {
    match args {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{k}={}", map[k]))
                .collect();
            parts.join(",")
        }
        other => other.to_string(),
    }
}
