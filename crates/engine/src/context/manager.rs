//! The context manager: owner of every message and the token budget.
//!
//! All message access goes through here. `prepare_for_request` runs the
//! allocator, applies compression/eviction until the request fits, and
//! returns the messages in prompt order. Transient overflow during
//! planning is fine; a request that still cannot fit surfaces as
//! [`Error::Overflow`].

use std::collections::BTreeMap;

use ta_domain::budget::TokenBudget;
use ta_domain::error::{Error, Result};
use ta_domain::message::{ContextMessage, MessageContent, MessageId, Role};
use ta_domain::tier::{Tier, TierPolicies};

use ta_providers::traits::ChatMessage;

use crate::context::allocator::{AllocationInput, AllocationPlan, TokenAllocator};
use crate::context::compressor::{CompressOptions, Compressor};
use crate::context::estimator::TokenEstimator;

/// Prompt emission order. Ephemeral injections land last so they sit
/// closest to the model's attention window.
const PROMPT_ORDER: [Tier; 6] = [
    Tier::System,
    Tier::Tools,
    Tier::Resources,
    Tier::Archived,
    Tier::Recent,
    Tier::Ephemeral,
];

const MAX_FIT_PASSES: usize = 3;

#[derive(Debug)]
pub struct PreparedRequest {
    /// Messages in prompt order, fitting the budget.
    pub messages: Vec<ContextMessage>,
    /// The system tier joined into one prompt string.
    pub system_prompt: String,
    /// Per-tier token allocations that produced this request.
    pub budget_breakdown: BTreeMap<Tier, u32>,
    pub total_tokens: u32,
}

#[derive(Default)]
pub struct PrepareOptions {
    /// A message to plan in (and insert into `recent`) atomically.
    pub incoming: Option<ContextMessage>,
}

pub struct ContextManager {
    budget: TokenBudget,
    policies: TierPolicies,
    estimator: TokenEstimator,
    compressor: Compressor,
    content: BTreeMap<Tier, Vec<ContextMessage>>,
    next_sequence: u64,
}

impl ContextManager {
    pub fn new(max_tokens: u32, compressor: Compressor) -> Self {
        Self {
            budget: TokenBudget::new(max_tokens),
            policies: TierPolicies::default_for_budget(max_tokens),
            estimator: TokenEstimator::default(),
            compressor,
            content: BTreeMap::new(),
            next_sequence: 1,
        }
    }

    pub fn reserve(&mut self, id: impl Into<String>, tokens: u32, label: impl Into<String>) {
        self.budget.reserve(id, tokens, label);
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    pub fn compressor(&self) -> &Compressor {
        &self.compressor
    }

    // ── Add operations ────────────────────────────────────────────

    pub fn add_system_message(&mut self, text: impl Into<String>) -> MessageId {
        self.insert(ContextMessage::system(text), Tier::System)
    }

    pub fn add_user_message(&mut self, text: impl Into<String>) -> MessageId {
        self.insert(ContextMessage::user(text), Tier::Recent)
    }

    pub fn add_assistant_message(&mut self, text: impl Into<String>) -> MessageId {
        self.insert(ContextMessage::assistant(text), Tier::Recent)
    }

    pub fn add_tool_result(
        &mut self,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> MessageId {
        self.insert(
            ContextMessage::tool_result(call_id, tool_name, content, is_error),
            Tier::Recent,
        )
    }

    /// Inject a per-iteration ephemeral message (state summaries, task
    /// lists, corrections). Survives `ttl_turns` calls to
    /// [`Self::begin_iteration`] (default 1).
    pub fn add_ephemeral(
        &mut self,
        text: impl Into<String>,
        kind: impl Into<String>,
        msg_priority: u8,
    ) -> MessageId {
        let mut msg = ContextMessage::user(text);
        msg.priority = msg_priority;
        msg.metadata.provenance = Some(kind.into());
        msg.metadata.ttl_turns = Some(1);
        self.insert(msg, Tier::Ephemeral)
    }

    /// Explicit placement.
    pub fn add_message(&mut self, msg: ContextMessage, tier: Tier) -> MessageId {
        self.insert(msg, tier)
    }

    fn insert(&mut self, mut msg: ContextMessage, tier: Tier) -> MessageId {
        let messages = self.content.entry(tier).or_default();
        // Same role + same content within a tier is a duplicate.
        if let Some(existing) = messages.iter().find(|m| m.dedup_key() == msg.dedup_key()) {
            return existing.id;
        }
        msg.sequence = self.next_sequence;
        self.next_sequence += 1;
        if msg.tokens == 0 {
            msg.tokens = self.estimator.estimate_message(&msg);
        }
        let id = msg.id;
        messages.push(msg);
        id
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn get(&self, id: MessageId) -> Option<&ContextMessage> {
        self.content.values().flatten().find(|m| m.id == id)
    }

    pub fn tier_messages(&self, tier: Tier) -> &[ContextMessage] {
        self.content.get(&tier).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tier_tokens(&self, tier: Tier) -> u32 {
        self.tier_messages(tier).iter().map(|m| m.tokens).sum()
    }

    pub fn total_tokens(&self) -> u32 {
        Tier::ALL.iter().map(|&t| self.tier_tokens(t)).sum()
    }

    pub fn message_count(&self) -> usize {
        self.content.values().map(Vec::len).sum()
    }

    /// Find the tool-result message for a dispatch call id.
    pub fn find_by_call_id(&self, call_id: &str) -> Option<MessageId> {
        self.content
            .values()
            .flatten()
            .find(|m| m.metadata.call_id.as_deref() == Some(call_id))
            .map(|m| m.id)
    }

    /// Case-insensitive substring search across all tiers, newest first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(MessageId, String)> {
        let needle = query.to_lowercase();
        let mut hits: Vec<(u64, MessageId, String)> = self
            .content
            .values()
            .flatten()
            .filter_map(|m| {
                let text = m.content.extract_all_text();
                if text.to_lowercase().contains(&needle) {
                    let snippet: String = text.chars().take(160).collect();
                    Some((m.sequence, m.id, snippet))
                } else {
                    None
                }
            })
            .collect();
        hits.sort_by(|a, b| b.0.cmp(&a.0));
        hits.into_iter()
            .take(limit)
            .map(|(_, id, snippet)| (id, snippet))
            .collect()
    }

    // ── Lifecycle hooks ───────────────────────────────────────────

    /// Called at the start of every THINK: ages ephemeral injections out
    /// by TTL.
    pub fn begin_iteration(&mut self) {
        if let Some(messages) = self.content.get_mut(&Tier::Ephemeral) {
            for msg in messages.iter_mut() {
                if let Some(ttl) = msg.metadata.ttl_turns.as_mut() {
                    *ttl = ttl.saturating_sub(1);
                }
            }
            messages.retain(|m| m.metadata.ttl_turns.map(|t| t > 0).unwrap_or(true));
        }
    }

    /// Replace a message's content after external compression (the
    /// tool-result lifecycle does this as results age).
    pub fn replace_content(&mut self, id: MessageId, text: String) -> bool {
        for messages in self.content.values_mut() {
            if let Some(msg) = messages.iter_mut().find(|m| m.id == id) {
                msg.set_text(text);
                msg.tokens = 0;
                return true;
            }
        }
        false
    }

    pub fn remove(&mut self, id: MessageId) -> bool {
        for messages in self.content.values_mut() {
            let before = messages.len();
            messages.retain(|m| m.id != id);
            if messages.len() < before {
                return true;
            }
        }
        false
    }

    /// Move a message between tiers, preserving identity and order.
    pub fn move_to_tier(&mut self, id: MessageId, tier: Tier) -> bool {
        let mut extracted = None;
        for messages in self.content.values_mut() {
            if let Some(pos) = messages.iter().position(|m| m.id == id) {
                extracted = Some(messages.remove(pos));
                break;
            }
        }
        match extracted {
            Some(msg) => {
                let messages = self.content.entry(tier).or_default();
                messages.push(msg);
                messages.sort_by_key(|m| m.sequence);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.content.clear();
        self.budget.reset();
    }

    /// Export every message with its tier placement, in sequence order
    /// (checkpointing).
    pub fn export_messages(&self) -> Vec<(Tier, ContextMessage)> {
        let mut all: Vec<(Tier, ContextMessage)> = Vec::new();
        for tier in Tier::ALL {
            for msg in self.tier_messages(tier) {
                all.push((tier, msg.clone()));
            }
        }
        all.sort_by_key(|(_, m)| m.sequence);
        all
    }

    /// Restore messages from a checkpoint export, preserving sequence.
    pub fn import_messages(&mut self, messages: Vec<(Tier, ContextMessage)>) {
        for (tier, msg) in messages {
            self.next_sequence = self.next_sequence.max(msg.sequence + 1);
            self.content.entry(tier).or_default().push(msg);
        }
        for list in self.content.values_mut() {
            list.sort_by_key(|m| m.sequence);
        }
    }

    // ── Request preparation ───────────────────────────────────────

    /// Plan, compress, and evict until the request fits, then emit the
    /// messages in prompt order.
    pub async fn prepare_for_request(
        &mut self,
        opts: PrepareOptions,
    ) -> Result<PreparedRequest> {
        self.refresh_estimates();
        let mut incoming = opts.incoming;
        if let Some(msg) = incoming.as_mut() {
            if msg.tokens == 0 {
                msg.tokens = self.estimator.estimate_message(msg);
            }
        }

        let mut last_plan: Option<AllocationPlan> = None;
        for pass in 0..MAX_FIT_PASSES {
            let plan = TokenAllocator::allocate(&AllocationInput {
                total_budget: self.budget.max_tokens,
                reservations: self.budget.reserved_total(),
                content: &self.content,
                incoming: incoming.as_ref(),
                policies: &self.policies,
            });

            if plan.success && plan.to_compress.is_empty() && plan.to_evict.is_empty() {
                return Ok(self.emit(plan, incoming));
            }

            tracing::debug!(
                pass,
                to_compress = plan.to_compress.len(),
                to_evict = plan.to_evict.len(),
                overflow = plan.overflow,
                "context over budget, applying plan"
            );

            for id in &plan.to_evict {
                self.remove(*id);
            }
            for id in &plan.to_compress {
                self.compress_in_place(*id).await?;
            }
            last_plan = Some(plan);
        }

        // Final plan after the fit passes; emit if it now fits.
        let plan = TokenAllocator::allocate(&AllocationInput {
            total_budget: self.budget.max_tokens,
            reservations: self.budget.reserved_total(),
            content: &self.content,
            incoming: incoming.as_ref(),
            policies: &self.policies,
        });
        if plan.success && plan.to_compress.is_empty() && plan.to_evict.is_empty() {
            return Ok(self.emit(plan, incoming));
        }

        let overflow = plan.overflow.max(last_plan.map(|p| p.overflow).unwrap_or(0));
        Err(Error::Overflow {
            needed: self.budget.available() + overflow,
            budget: self.budget.available(),
        })
    }

    fn refresh_estimates(&mut self) {
        for messages in self.content.values_mut() {
            for msg in messages.iter_mut() {
                if msg.tokens == 0 {
                    msg.tokens = self.estimator.estimate_message(msg);
                }
            }
        }
    }

    async fn compress_in_place(&mut self, id: MessageId) -> Result<()> {
        let Some(msg) = self.get(id).cloned() else {
            return Ok(());
        };
        if !msg.compressible {
            self.remove(id);
            return Ok(());
        }
        let batch = [msg.clone()];
        let result = self
            .compressor
            .compress(
                &batch,
                &CompressOptions {
                    strategy: None,
                    target_ratio: Some(0.5),
                    ..Default::default()
                },
            )
            .await?;
        match result.compressed.into_iter().next() {
            Some(compressed) => {
                let text = compressed.content.extract_all_text();
                // A compression that saved nothing would loop forever;
                // evict instead.
                if self.estimator.estimate_text(&text) >= msg.tokens {
                    self.remove(id);
                } else {
                    self.replace_content(id, text);
                    self.refresh_estimates();
                }
            }
            None => {
                self.remove(id);
            }
        }
        Ok(())
    }

    fn emit(&mut self, plan: AllocationPlan, incoming: Option<ContextMessage>) -> PreparedRequest {
        // The plan was made with the incoming message on the side; insert
        // it now so it is part of the emitted request.
        let incoming_id = incoming.map(|msg| self.insert(msg, Tier::Recent));

        let mut messages = Vec::new();
        let mut system_prompt_parts = Vec::new();
        for tier in PROMPT_ORDER {
            let retained = plan.retained.get(&tier);
            for msg in self.tier_messages(tier) {
                let keep = retained.map(|ids| ids.contains(&msg.id)).unwrap_or(false)
                    || Some(msg.id) == incoming_id;
                if keep {
                    if tier == Tier::System {
                        system_prompt_parts.push(msg.content.extract_all_text());
                    }
                    messages.push(msg.clone());
                }
            }
        }

        let total_tokens = messages.iter().map(|m| m.tokens).sum();
        for (tier, allocation) in &plan.allocations {
            self.budget.allocate(tier.as_str(), *allocation);
        }

        PreparedRequest {
            messages,
            system_prompt: system_prompt_parts.join("\n\n"),
            budget_breakdown: plan.allocations,
            total_tokens,
        }
    }

    /// Flatten a prepared request into provider history messages,
    /// excluding the system tier (it travels as the system prompt).
    pub fn to_api_format(&self, prepared: &PreparedRequest) -> Vec<ChatMessage> {
        prepared
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| ChatMessage {
                role: m.role,
                content: render_for_api(m),
            })
            .collect()
    }
}

fn render_for_api(msg: &ContextMessage) -> String {
    match &msg.content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::Parts(_) => {
            let text = msg.content.extract_all_text();
            match (&msg.metadata.tool_name, &msg.metadata.call_id) {
                (Some(tool), Some(call)) => format!("[{tool} result ({call})]\n{text}"),
                _ => text,
            }
        }
    }
}

/// Builder used by the orchestrator: standard reservations applied.
pub fn build_context_manager(
    budget: &ta_domain::config::BudgetConfig,
    compressor: Compressor,
) -> ContextManager {
    let mut manager = ContextManager::new(budget.max_tokens, compressor);
    manager.reserve("response", budget.response_reserve, "response reserve");
    manager.reserve("tools", budget.tool_reserve, "tool schema reserve");
    manager
}

#[cfg(test)]
mod tests {
    use super::*;
    use ta_domain::message::priority;

    fn manager(max_tokens: u32) -> ContextManager {
        ContextManager::new(max_tokens, Compressor::new(TokenEstimator::default()))
    }

    #[tokio::test]
    async fn prepared_request_fits_budget() {
        let mut ctx = manager(2000);
        ctx.reserve("response", 200, "response reserve");
        ctx.add_system_message("You are a board agent.");
        for i in 0..30 {
            ctx.add_user_message(format!(
                "message {i}: some filler words to give this line substance"
            ));
        }
        let prepared = ctx.prepare_for_request(PrepareOptions::default()).await.unwrap();
        assert!(prepared.total_tokens <= 2000 - 200);
        assert!(!prepared.messages.is_empty());
    }

    #[tokio::test]
    async fn system_prompt_joins_system_tier() {
        let mut ctx = manager(4000);
        ctx.add_system_message("Identity.");
        ctx.add_system_message("Rules.");
        let prepared = ctx.prepare_for_request(PrepareOptions::default()).await.unwrap();
        assert_eq!(prepared.system_prompt, "Identity.\n\nRules.");
    }

    #[tokio::test]
    async fn duplicate_messages_dedup_within_tier() {
        let mut ctx = manager(4000);
        let a = ctx.add_user_message("same text");
        let b = ctx.add_user_message("same text");
        assert_eq!(a, b);
        assert_eq!(ctx.message_count(), 1);
    }

    #[tokio::test]
    async fn ephemeral_ages_out_after_one_iteration() {
        let mut ctx = manager(4000);
        ctx.add_ephemeral("current state: 3 elements", "state", priority::EPHEMERAL);
        assert_eq!(ctx.tier_messages(Tier::Ephemeral).len(), 1);
        ctx.begin_iteration();
        assert_eq!(ctx.tier_messages(Tier::Ephemeral).len(), 0);
    }

    #[tokio::test]
    async fn insertion_order_is_preserved_in_recent() {
        let mut ctx = manager(8000);
        ctx.add_user_message("first");
        ctx.add_assistant_message("second");
        ctx.add_user_message("third");
        let prepared = ctx.prepare_for_request(PrepareOptions::default()).await.unwrap();
        let texts: Vec<String> = prepared
            .messages
            .iter()
            .map(|m| m.content.extract_all_text())
            .collect();
        let first = texts.iter().position(|t| t == "first").unwrap();
        let second = texts.iter().position(|t| t == "second").unwrap();
        let third = texts.iter().position(|t| t == "third").unwrap();
        assert!(first < second && second < third);
    }

    #[tokio::test]
    async fn incoming_is_planned_and_inserted() {
        let mut ctx = manager(4000);
        let incoming = ContextMessage::user("the new task");
        let prepared = ctx
            .prepare_for_request(PrepareOptions {
                incoming: Some(incoming),
            })
            .await
            .unwrap();
        assert!(prepared
            .messages
            .iter()
            .any(|m| m.content.extract_all_text() == "the new task"));
        assert_eq!(ctx.tier_messages(Tier::Recent).len(), 1);
    }

    #[tokio::test]
    async fn overflow_surfaces_when_nothing_can_give() {
        let mut ctx = manager(200);
        // System messages are incompressible and unevictable.
        ctx.add_system_message(
            "x".repeat(4000)
        );
        let err = ctx
            .prepare_for_request(PrepareOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::Overflow { needed, budget } => assert!(needed > budget),
            other => panic!("expected overflow, got {other}"),
        }
    }

    #[tokio::test]
    async fn pressure_compresses_recent_content() {
        let mut ctx = manager(800);
        for i in 0..6 {
            ctx.add_user_message(format!(
                "turn {i}: {}",
                "long filler text with repeated words ".repeat(10)
            ));
        }
        let before = ctx.total_tokens();
        let prepared = ctx.prepare_for_request(PrepareOptions::default()).await.unwrap();
        assert!(ctx.total_tokens() <= before);
        assert!(prepared.total_tokens <= 800);
    }

    #[tokio::test]
    async fn search_finds_newest_first() {
        let mut ctx = manager(4000);
        ctx.add_user_message("alpha report one");
        ctx.add_user_message("alpha report two");
        let hits = ctx.search("alpha", 10);
        assert_eq!(hits.len(), 2);
        assert!(hits[0].1.contains("two"));
    }

    #[tokio::test]
    async fn to_api_format_excludes_system() {
        let mut ctx = manager(4000);
        ctx.add_system_message("sys");
        ctx.add_user_message("hello");
        let prepared = ctx.prepare_for_request(PrepareOptions::default()).await.unwrap();
        let api = ctx.to_api_format(&prepared);
        assert!(api.iter().all(|m| m.role != Role::System));
        assert_eq!(api.len(), 1);
    }
}
