//! Compression strategies for context messages.
//!
//! Every strategy is deterministic and idempotent at its target: feeding a
//! strategy its own output at the same target is a no-op. SUMMARIZE and
//! HIERARCHICAL delegate to an injected [`Summarizer`]; the compressor
//! never constructs one itself.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use ta_domain::error::{Error, Result};
use ta_domain::message::{ContextMessage, MessageContent};

use crate::context::estimator::TokenEstimator;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionStrategy {
    None,
    Truncate,
    Minify,
    Extract,
    Summarize,
    Hierarchical,
    ToolAware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lossiness {
    None,
    Minimal,
    Moderate,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionLevel {
    Light,
    Moderate,
    Aggressive,
}

#[derive(Clone, Default)]
pub struct CompressOptions {
    pub strategy: Option<CompressionStrategy>,
    pub target_tokens: Option<u32>,
    pub target_ratio: Option<f64>,
    /// Regex patterns whose matching lines survive minify/extract verbatim.
    pub preserve_patterns: Vec<String>,
    pub summary_prompt: Option<String>,
}

#[derive(Debug)]
pub struct CompressResult {
    pub compressed: Vec<ContextMessage>,
    /// Tokens after / tokens before.
    pub ratio: f64,
    pub strategy: CompressionStrategy,
    pub lossiness: Lossiness,
}

/// Injected summarization capability (usually backed by an LLM provider).
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        text: &str,
        target_tokens: u32,
        prompt: Option<&str>,
    ) -> Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-tool compressors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool-aware compression keeps the fields a later iteration may act on:
/// ids, bounds, exit codes, counts, error messages.
pub trait ToolCompressor: Send + Sync {
    fn compress(&self, content: &str, level: CompressionLevel, budget_tokens: u32) -> String;

    /// One-line summary used when a result is archived.
    fn archive_line(&self, tool_name: &str, content: &str) -> String;
}

/// Default tool compressor: extracts critical lines by pattern, then
/// truncates to budget.
pub struct GenericToolCompressor {
    critical: Regex,
    count_phrase: Regex,
}

impl GenericToolCompressor {
    pub fn new() -> Self {
        Self {
            critical: Regex::new(
                r#"(?i)("id"|\bid\b|error|exit code|count|bounds|created|deleted|updated|failed)"#,
            )
            .expect("static regex"),
            count_phrase: Regex::new(r"(?i)(created|deleted|updated|removed|found)\D{0,10}(\d+)")
                .expect("static regex"),
        }
    }
}

impl Default for GenericToolCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCompressor for GenericToolCompressor {
    fn compress(&self, content: &str, level: CompressionLevel, budget_tokens: u32) -> String {
        // Roughly 4 chars per token; aggressive halves the budget again.
        let budget_chars = match level {
            CompressionLevel::Light => budget_tokens as usize * 6,
            CompressionLevel::Moderate => budget_tokens as usize * 4,
            CompressionLevel::Aggressive => budget_tokens as usize * 2,
        };
        if content.len() <= budget_chars {
            return content.to_string();
        }

        let mut kept: Vec<&str> = Vec::new();
        let mut used = 0usize;
        for line in content.lines() {
            if self.critical.is_match(line) && used + line.len() < budget_chars {
                kept.push(line);
                used += line.len() + 1;
            }
        }
        // No critical lines: fall back to a head slice.
        if kept.is_empty() {
            let boundary = floor_char_boundary(content, budget_chars);
            return format!("{}…", &content[..boundary]);
        }
        let mut out = kept.join("\n");
        if used < content.len() {
            out.push_str("\n…");
        }
        out
    }

    fn archive_line(&self, tool_name: &str, content: &str) -> String {
        // Prefer a count-bearing phrase; fall back to the first line.
        let count = self
            .count_phrase
            .captures(content)
            .map(|c| format!("{} {} items", c[1].to_lowercase(), &c[2]));
        match count {
            Some(phrase) => format!("[{tool_name}: {phrase}]"),
            None => {
                let first = content.lines().next().unwrap_or("").trim();
                let boundary = floor_char_boundary(first, 80);
                format!("[{tool_name}: {}]", &first[..boundary])
            }
        }
    }
}

/// Registry of per-tool compressors with a generic fallback.
#[derive(Clone)]
pub struct ToolCompressorRegistry {
    by_tool: HashMap<String, Arc<dyn ToolCompressor>>,
    fallback: Arc<dyn ToolCompressor>,
}

impl ToolCompressorRegistry {
    pub fn new() -> Self {
        Self {
            by_tool: HashMap::new(),
            fallback: Arc::new(GenericToolCompressor::new()),
        }
    }

    pub fn register(&mut self, tool_name: impl Into<String>, compressor: Arc<dyn ToolCompressor>) {
        self.by_tool.insert(tool_name.into(), compressor);
    }

    pub fn get(&self, tool_name: &str) -> Arc<dyn ToolCompressor> {
        self.by_tool
            .get(tool_name)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn has_specific(&self, tool_name: &str) -> bool {
        self.by_tool.contains_key(tool_name)
    }
}

impl Default for ToolCompressorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compressor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Compressor {
    estimator: TokenEstimator,
    summarizer: Option<Arc<dyn Summarizer>>,
    tool_compressors: ToolCompressorRegistry,
}

impl Compressor {
    pub fn new(estimator: TokenEstimator) -> Self {
        Self {
            estimator,
            summarizer: None,
            tool_compressors: ToolCompressorRegistry::new(),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_tool_compressors(mut self, registry: ToolCompressorRegistry) -> Self {
        self.tool_compressors = registry;
        self
    }

    pub fn has_summarizer(&self) -> bool {
        self.summarizer.is_some()
    }

    pub fn tool_compressors(&self) -> &ToolCompressorRegistry {
        &self.tool_compressors
    }

    /// Pick a strategy for shrinking `current` tokens to `target`.
    pub fn recommended_strategy(
        &self,
        current: u32,
        target: u32,
        has_tool_content: bool,
    ) -> CompressionStrategy {
        if current == 0 {
            return CompressionStrategy::None;
        }
        let ratio = target as f64 / current as f64;
        if ratio >= 1.0 {
            CompressionStrategy::None
        } else if ratio >= 0.8 {
            CompressionStrategy::Minify
        } else if has_tool_content && ratio >= 0.3 {
            CompressionStrategy::ToolAware
        } else if ratio >= 0.5 {
            CompressionStrategy::Extract
        } else if self.summarizer.is_some() && ratio >= 0.2 {
            CompressionStrategy::Summarize
        } else if self.summarizer.is_some() {
            CompressionStrategy::Hierarchical
        } else if has_tool_content {
            CompressionStrategy::ToolAware
        } else {
            CompressionStrategy::Truncate
        }
    }

    /// Apply a strategy. When `opts.strategy` is unset the recommended
    /// strategy for the computed target is used.
    pub async fn compress(
        &self,
        messages: &[ContextMessage],
        opts: &CompressOptions,
    ) -> Result<CompressResult> {
        let before: u32 = messages
            .iter()
            .map(|m| self.estimator.estimate_message(m))
            .sum();
        let target = self.effective_target(before, opts);

        let strategy = opts.strategy.unwrap_or_else(|| {
            let has_tool = messages.iter().any(|m| m.metadata.tool_name.is_some());
            self.recommended_strategy(before, target, has_tool)
        });

        let (compressed, lossiness) = match strategy {
            CompressionStrategy::None => (messages.to_vec(), Lossiness::None),
            CompressionStrategy::Truncate => (self.truncate(messages, target), Lossiness::High),
            CompressionStrategy::Minify => (self.minify(messages, opts), Lossiness::Minimal),
            CompressionStrategy::Extract => {
                (self.extract(messages, target, opts), Lossiness::Moderate)
            }
            CompressionStrategy::Summarize => {
                (self.summarize(messages, target, opts).await?, Lossiness::High)
            }
            CompressionStrategy::Hierarchical => {
                (self.hierarchical(messages, target, opts).await?, Lossiness::High)
            }
            CompressionStrategy::ToolAware => {
                (self.tool_aware(messages, target), Lossiness::Moderate)
            }
        };

        let after: u32 = compressed
            .iter()
            .map(|m| self.estimator.estimate_message(m))
            .sum();
        let ratio = if before == 0 {
            1.0
        } else {
            after as f64 / before as f64
        };

        Ok(CompressResult {
            compressed,
            ratio,
            strategy,
            lossiness,
        })
    }

    fn effective_target(&self, before: u32, opts: &CompressOptions) -> u32 {
        if let Some(tokens) = opts.target_tokens {
            return tokens;
        }
        if let Some(ratio) = opts.target_ratio {
            return (before as f64 * ratio) as u32;
        }
        before
    }

    // ── TRUNCATE ──────────────────────────────────────────────────

    /// Keep the newest messages that fit the target.
    fn truncate(&self, messages: &[ContextMessage], target: u32) -> Vec<ContextMessage> {
        let mut kept: Vec<ContextMessage> = Vec::new();
        let mut used = 0u32;
        for msg in messages.iter().rev() {
            let tokens = self.estimator.estimate_message(msg);
            if used + tokens > target {
                break;
            }
            used += tokens;
            kept.push(msg.clone());
        }
        kept.reverse();
        kept
    }

    // ── MINIFY ────────────────────────────────────────────────────

    /// Collapse whitespace runs and blank-line runs; lines matching a
    /// preserve pattern pass through verbatim.
    fn minify(&self, messages: &[ContextMessage], opts: &CompressOptions) -> Vec<ContextMessage> {
        let preserve = compile_patterns(&opts.preserve_patterns);
        messages
            .iter()
            .map(|msg| {
                let mut out = msg.clone();
                if let Some(text) = msg.content.text() {
                    out.set_text(minify_text(text, &preserve));
                }
                out
            })
            .collect()
    }

    // ── EXTRACT ───────────────────────────────────────────────────

    /// Keep the highest-scoring lines of each message within a
    /// proportional share of the target, re-sorted in original order.
    fn extract(
        &self,
        messages: &[ContextMessage],
        target: u32,
        opts: &CompressOptions,
    ) -> Vec<ContextMessage> {
        let preserve = compile_patterns(&opts.preserve_patterns);
        let before: u32 = messages
            .iter()
            .map(|m| self.estimator.estimate_message(m))
            .sum();
        if before <= target {
            return messages.to_vec();
        }

        messages
            .iter()
            .map(|msg| {
                let tokens = self.estimator.estimate_message(msg);
                // Proportional share of the target budget.
                let share =
                    ((tokens as u64 * target as u64) / before.max(1) as u64) as u32;
                let mut out = msg.clone();
                if let Some(text) = msg.content.text() {
                    out.set_text(extract_text(text, share, &preserve, &self.estimator));
                }
                out
            })
            .collect()
    }

    // ── SUMMARIZE ─────────────────────────────────────────────────

    async fn summarize(
        &self,
        messages: &[ContextMessage],
        target: u32,
        opts: &CompressOptions,
    ) -> Result<Vec<ContextMessage>> {
        let summarizer = self
            .summarizer
            .as_ref()
            .ok_or_else(|| Error::Other("SUMMARIZE strategy requires a summarizer".into()))?;

        let text = render_conversation(messages);
        let summary = summarizer
            .summarize(&text, target, opts.summary_prompt.as_deref())
            .await?;

        Ok(vec![summary_message(summary)])
    }

    // ── HIERARCHICAL ──────────────────────────────────────────────

    /// Chunk, summarize each chunk, then summarize the summaries if the
    /// result is still over target.
    async fn hierarchical(
        &self,
        messages: &[ContextMessage],
        target: u32,
        opts: &CompressOptions,
    ) -> Result<Vec<ContextMessage>> {
        const CHUNK: usize = 20;
        let summarizer = self
            .summarizer
            .as_ref()
            .ok_or_else(|| Error::Other("HIERARCHICAL strategy requires a summarizer".into()))?;

        let chunk_target = (target / (messages.len() as u32 / CHUNK as u32 + 1)).max(50);
        let mut summaries: Vec<ContextMessage> = Vec::new();
        for chunk in messages.chunks(CHUNK) {
            let text = render_conversation(chunk);
            let summary = summarizer
                .summarize(&text, chunk_target, opts.summary_prompt.as_deref())
                .await?;
            summaries.push(summary_message(summary));
        }

        let total: u32 = summaries
            .iter()
            .map(|m| self.estimator.estimate_message(m))
            .sum();
        if total > target && summaries.len() > 1 {
            let text = render_conversation(&summaries);
            let summary = summarizer
                .summarize(&text, target, opts.summary_prompt.as_deref())
                .await?;
            return Ok(vec![summary_message(summary)]);
        }
        Ok(summaries)
    }

    // ── TOOL_AWARE ────────────────────────────────────────────────

    /// Apply registered per-tool compressors, level chosen from the
    /// pressure ratio; non-tool messages fall back to EXTRACT scoring.
    fn tool_aware(&self, messages: &[ContextMessage], target: u32) -> Vec<ContextMessage> {
        let before: u32 = messages
            .iter()
            .map(|m| self.estimator.estimate_message(m))
            .sum();
        if before <= target {
            return messages.to_vec();
        }
        let pressure = target as f64 / before as f64;
        let level = if pressure >= 0.7 {
            CompressionLevel::Light
        } else if pressure >= 0.4 {
            CompressionLevel::Moderate
        } else {
            CompressionLevel::Aggressive
        };

        messages
            .iter()
            .map(|msg| {
                let tokens = self.estimator.estimate_message(msg);
                let share =
                    ((tokens as u64 * target as u64) / before.max(1) as u64) as u32;
                let mut out = msg.clone();
                let tool_name = msg
                    .metadata
                    .tool_name
                    .clone()
                    .or_else(|| sniff_tool_content(&msg.content));
                match tool_name {
                    Some(tool) => {
                        let compressor = self.tool_compressors.get(&tool);
                        if let Some(text) = msg.content.text() {
                            out.set_text(compressor.compress(text, level, share));
                        } else {
                            let text = msg.content.extract_all_text();
                            out.set_text(compressor.compress(&text, level, share));
                        }
                    }
                    None => {
                        if let Some(text) = msg.content.text() {
                            out.set_text(extract_text(text, share, &[], &self.estimator));
                        }
                    }
                }
                out
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Text helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern = %p, error = %e, "invalid preserve pattern, skipping");
                None
            }
        })
        .collect()
}

fn minify_text(text: &str, preserve: &[Regex]) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut blank_run = 0usize;
    for line in text.lines() {
        if preserve.iter().any(|re| re.is_match(line)) {
            blank_run = 0;
            out.push(line.to_string());
            continue;
        }
        let collapsed = collapse_spaces(line.trim_end());
        if collapsed.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push(String::new());
        } else {
            blank_run = 0;
            out.push(collapsed);
        }
    }
    out.join("\n")
}

fn collapse_spaces(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut last_space = false;
    for c in line.chars() {
        if c == ' ' || c == '\t' {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            last_space = false;
            out.push(c);
        }
    }
    out
}

fn score_line(line: &str, preserve: &[Regex]) -> i32 {
    let trimmed = line.trim();
    let mut score = 0i32;
    if trimmed.starts_with('#') || trimmed.ends_with(':') {
        score += 3;
    }
    if trimmed.starts_with('-')
        || trimmed.starts_with('*')
        || trimmed
            .split('.')
            .next()
            .map(|head| !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
    {
        score += 2;
    }
    let lower = trimmed.to_lowercase();
    for keyword in ["error", "warning", "important", "todo", "failed"] {
        if lower.contains(keyword) {
            score += 3;
        }
    }
    for signature in ["fn ", "def ", "class ", "=> "] {
        if trimmed.contains(signature) {
            score += 2;
        }
    }
    // Length shaping: very short lines carry little, very long lines are
    // expensive per token kept.
    let len = trimmed.chars().count();
    if len < 4 {
        score -= 2;
    } else if len > 200 {
        score -= 1;
    } else if len < 80 {
        score += 1;
    }
    if preserve.iter().any(|re| re.is_match(line)) {
        score += 5;
    }
    score
}

fn extract_text(
    text: &str,
    budget_tokens: u32,
    preserve: &[Regex],
    estimator: &TokenEstimator,
) -> String {
    if estimator.estimate_text(text) <= budget_tokens {
        return text.to_string();
    }
    let mut scored: Vec<(usize, i32, &str)> = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i, score_line(line, preserve), line))
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut kept: Vec<(usize, &str)> = Vec::new();
    let mut used = 0u32;
    for (index, _score, line) in scored {
        let tokens = estimator.estimate_text(line);
        if used + tokens > budget_tokens {
            continue;
        }
        used += tokens;
        kept.push((index, line));
    }
    kept.sort_by_key(|(index, _)| *index);
    kept.into_iter()
        .map(|(_, line)| line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_conversation(messages: &[ContextMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        let role = match msg.role {
            ta_domain::message::Role::System => "System",
            ta_domain::message::Role::User => "User",
            ta_domain::message::Role::Assistant => "Assistant",
            ta_domain::message::Role::Tool => "Tool",
        };
        out.push_str(role);
        out.push_str(": ");
        out.push_str(&msg.content.extract_all_text());
        out.push('\n');
    }
    out
}

fn summary_message(summary: String) -> ContextMessage {
    let mut msg = ContextMessage::assistant(summary);
    // Summaries are terminal: they are never recompressed.
    msg.compressible = false;
    msg.metadata.provenance = Some("summary".into());
    msg
}

/// Heuristic content sniff for tool output that lost its metadata tag.
fn sniff_tool_content(content: &MessageContent) -> Option<String> {
    let text = content.text()?;
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') && (trimmed.contains("\"id\"") || trimmed.contains("\"success\""))
    {
        Some("task_execute".into())
    } else {
        None
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
