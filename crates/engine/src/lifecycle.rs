//! Three-stage tool-result lifecycle.
//!
//! Fresh tool output is verbose; its value decays by the turn. Entries
//! move `immediate → recent → archived → evicted` as they age, with
//! per-stage token caps. Transitions are monotone: an entry never moves
//! back to an earlier stage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ta_domain::config::LifecycleConfig;

use crate::context::compressor::{CompressionLevel, ToolCompressorRegistry};
use crate::context::estimator::TokenEstimator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStage {
    Immediate,
    Recent,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultEntry {
    pub id: String,
    pub tool_name: String,
    pub raw_result: Value,
    pub full_content: String,
    pub compressed_content: Option<String>,
    pub archived_content: Option<String>,
    pub created_at_turn: u32,
    pub stage: ResultStage,
    /// Token estimate of the stage-appropriate content.
    pub tokens: u32,
}

impl ToolResultEntry {
    /// The content appropriate for the entry's current stage.
    pub fn content(&self) -> &str {
        match self.stage {
            ResultStage::Immediate => &self.full_content,
            ResultStage::Recent => self
                .compressed_content
                .as_deref()
                .unwrap_or(&self.full_content),
            ResultStage::Archived => self
                .archived_content
                .as_deref()
                .unwrap_or(&self.full_content),
        }
    }
}

#[derive(Debug, Default)]
pub struct AgingReport {
    pub compressed: Vec<String>,
    pub archived: Vec<String>,
    pub evicted: Vec<String>,
    pub tokens_saved: u32,
}

pub struct ToolResultLifecycle {
    config: LifecycleConfig,
    estimator: TokenEstimator,
    compressors: ToolCompressorRegistry,
    entries: BTreeMap<String, ToolResultEntry>,
}

impl ToolResultLifecycle {
    pub fn new(config: LifecycleConfig, compressors: ToolCompressorRegistry) -> Self {
        Self {
            config,
            estimator: TokenEstimator::default(),
            compressors,
            entries: BTreeMap::new(),
        }
    }

    /// Record a fresh tool result. Content over the immediate cap is
    /// lightly compressed on the way in.
    pub fn add(
        &mut self,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        raw_result: Value,
        content: impl Into<String>,
        current_turn: u32,
    ) {
        let id = call_id.into();
        let tool_name = tool_name.into();
        let mut content = content.into();

        let mut tokens = self.estimator.estimate_text(&content);
        if tokens > self.config.immediate_max_tokens {
            let compressor = self.compressors.get(&tool_name);
            content = compressor.compress(
                &content,
                CompressionLevel::Light,
                self.config.immediate_max_tokens,
            );
            tokens = self.estimator.estimate_text(&content);
        }

        self.entries.insert(
            id.clone(),
            ToolResultEntry {
                id,
                tool_name,
                raw_result,
                full_content: content,
                compressed_content: None,
                archived_content: None,
                created_at_turn: current_turn,
                stage: ResultStage::Immediate,
                tokens,
            },
        );
    }

    /// Advance every entry by the clock. Returns which entries moved.
    pub fn age_results(&mut self, current_turn: u32) -> AgingReport {
        let mut report = AgingReport::default();
        let mut to_evict: Vec<String> = Vec::new();

        for entry in self.entries.values_mut() {
            let age = current_turn.saturating_sub(entry.created_at_turn);

            if age >= self.config.evict_threshold {
                report.tokens_saved += entry.tokens;
                to_evict.push(entry.id.clone());
                continue;
            }

            if age >= self.config.archive_threshold && entry.stage < ResultStage::Archived {
                let saved = Self::archive_entry(
                    entry,
                    &self.compressors,
                    &self.estimator,
                    self.config.archived_max_tokens,
                );
                report.tokens_saved += saved;
                report.archived.push(entry.id.clone());
                continue;
            }

            if age >= self.config.recent_threshold && entry.stage < ResultStage::Recent {
                let saved = Self::compress_entry(
                    entry,
                    &self.compressors,
                    &self.estimator,
                    self.config.recent_max_tokens,
                );
                report.tokens_saved += saved;
                report.compressed.push(entry.id.clone());
            }
        }

        for id in to_evict {
            self.entries.remove(&id);
            report.evicted.push(id);
        }
        report
    }

    fn compress_entry(
        entry: &mut ToolResultEntry,
        compressors: &ToolCompressorRegistry,
        estimator: &TokenEstimator,
        budget: u32,
    ) -> u32 {
        let compressor = compressors.get(&entry.tool_name);
        let compressed =
            compressor.compress(&entry.full_content, CompressionLevel::Moderate, budget);
        let new_tokens = estimator.estimate_text(&compressed);
        let saved = entry.tokens.saturating_sub(new_tokens);
        entry.compressed_content = Some(compressed);
        entry.stage = ResultStage::Recent;
        entry.tokens = new_tokens;
        saved
    }

    fn archive_entry(
        entry: &mut ToolResultEntry,
        compressors: &ToolCompressorRegistry,
        estimator: &TokenEstimator,
        _budget: u32,
    ) -> u32 {
        let compressor = compressors.get(&entry.tool_name);
        let line = compressor.archive_line(&entry.tool_name, &entry.full_content);
        let new_tokens = estimator.estimate_text(&line);
        let saved = entry.tokens.saturating_sub(new_tokens);
        entry.archived_content = Some(line);
        entry.stage = ResultStage::Archived;
        entry.tokens = new_tokens;
        saved
    }

    // ── Public queries & forced transitions ───────────────────────

    pub fn get_content(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(|e| e.content())
    }

    pub fn get(&self, id: &str) -> Option<&ToolResultEntry> {
        self.entries.get(id)
    }

    pub fn force_compress(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if entry.stage >= ResultStage::Recent {
            return false;
        }
        Self::compress_entry(
            entry,
            &self.compressors,
            &self.estimator,
            self.config.recent_max_tokens,
        );
        true
    }

    pub fn force_archive(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if entry.stage >= ResultStage::Archived {
            return false;
        }
        Self::archive_entry(
            entry,
            &self.compressors,
            &self.estimator,
            self.config.archived_max_tokens,
        );
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn tokens_by_stage(&self) -> BTreeMap<ResultStage, u32> {
        let mut totals = BTreeMap::new();
        for entry in self.entries.values() {
            *totals.entry(entry.stage).or_insert(0) += entry.tokens;
        }
        totals
    }

    pub fn total_tokens(&self) -> u32 {
        self.entries.values().map(|e| e.tokens).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
