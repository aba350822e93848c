//! Token allocation across memory tiers.
//!
//! The allocator plans one request: given tiered content, reservations,
//! and an optional incoming message, it decides per-tier allocations and
//! which messages to retain, compress, or evict. It never mutates the
//! store; the context manager applies the plan.

use std::collections::BTreeMap;

use ta_domain::message::{ContextMessage, MessageId};
use ta_domain::tier::{Tier, TierPolicies};

pub struct AllocationInput<'a> {
    pub total_budget: u32,
    /// Sum of explicit reservations (response, tools).
    pub reservations: u32,
    pub content: &'a BTreeMap<Tier, Vec<ContextMessage>>,
    /// A message about to be inserted into `recent`.
    pub incoming: Option<&'a ContextMessage>,
    pub policies: &'a TierPolicies,
}

#[derive(Debug, Default)]
pub struct AllocationPlan {
    pub allocations: BTreeMap<Tier, u32>,
    /// Messages kept in full, per tier, in insertion order.
    pub retained: BTreeMap<Tier, Vec<MessageId>>,
    pub to_compress: Vec<MessageId>,
    pub to_evict: Vec<MessageId>,
    pub success: bool,
    /// Tokens retained beyond the available budget (0 when success).
    pub overflow: u32,
}

pub struct TokenAllocator;

impl TokenAllocator {
    pub fn allocate(input: &AllocationInput<'_>) -> AllocationPlan {
        let available = input.total_budget.saturating_sub(input.reservations);
        let mut plan = AllocationPlan::default();

        let usage: BTreeMap<Tier, u32> = Tier::ALL
            .iter()
            .map(|&tier| {
                let mut tokens: u32 = input
                    .content
                    .get(&tier)
                    .map(|msgs| msgs.iter().map(|m| m.tokens).sum())
                    .unwrap_or(0);
                if tier == Tier::Recent {
                    if let Some(incoming) = input.incoming {
                        tokens += incoming.tokens;
                    }
                }
                (tier, tokens)
            })
            .collect();
        let total_usage: u32 = usage.values().sum();

        if available == 0 {
            for tier in Tier::ALL {
                plan.allocations.insert(tier, 0);
            }
            plan.success = false;
            plan.overflow = total_usage;
            return plan;
        }

        // Everything fits: optimal per-tier allocation, retain all.
        if total_usage <= available {
            for tier in Tier::ALL {
                let policy = input.policies.get(tier);
                let target = (available as f64 * policy.fraction) as u32;
                plan.allocations.insert(tier, target.min(policy.max_tokens));
                plan.retained.insert(
                    tier,
                    input
                        .content
                        .get(&tier)
                        .map(|msgs| msgs.iter().map(|m| m.id).collect())
                        .unwrap_or_default(),
                );
            }
            plan.success = true;
            return plan;
        }

        // Prioritised allocation: seed minimums, grant by static weight.
        let mut remaining = available;
        for tier in Tier::ALL {
            let seed = input.policies.get(tier).min_tokens.min(remaining);
            plan.allocations.insert(tier, seed);
            remaining -= seed;
        }
        for tier in input.policies.by_weight() {
            let policy = input.policies.get(tier);
            let seeded = plan.allocations[&tier];
            let want = usage[&tier].saturating_sub(seeded);
            let headroom = policy.max_tokens.saturating_sub(seeded);
            let grant = want.min(headroom).min(remaining);
            plan.allocations.insert(tier, seeded + grant);
            remaining -= grant;
        }

        // Per-tier retention under the granted allocation.
        for tier in Tier::ALL {
            let Some(messages) = input.content.get(&tier) else {
                plan.retained.insert(tier, Vec::new());
                continue;
            };
            let policy = input.policies.get(tier);
            let allocation = plan.allocations[&tier];

            if !policy.evictable && !policy.compressible {
                // Protected tier: retain everything; overflow is accounted
                // for below.
                plan.retained
                    .insert(tier, messages.iter().map(|m| m.id).collect());
                continue;
            }

            let mut ranked: Vec<&ContextMessage> = messages.iter().collect();
            ranked.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(b.sequence.cmp(&a.sequence))
            });

            let mut budget = allocation;
            if tier == Tier::Recent {
                if let Some(incoming) = input.incoming {
                    // The incoming message is always retained; it spends
                    // recent budget first.
                    budget = budget.saturating_sub(incoming.tokens);
                }
            }

            let mut kept: Vec<&ContextMessage> = Vec::new();
            let mut used = 0u32;
            for msg in ranked {
                if used + msg.tokens <= budget {
                    used += msg.tokens;
                    kept.push(msg);
                } else if msg.compressible && policy.compressible {
                    plan.to_compress.push(msg.id);
                } else if policy.evictable {
                    plan.to_evict.push(msg.id);
                } else {
                    kept.push(msg);
                }
            }

            // Make room for the incoming message by evicting the oldest
            // retained entries when the budget subtraction above ran dry.
            if tier == Tier::Recent {
                if let Some(incoming) = input.incoming {
                    if incoming.tokens > allocation {
                        // Nothing in the tier can make this fit.
                        plan.overflow += incoming.tokens - allocation;
                    }
                    while used + incoming.tokens.min(allocation) > allocation
                        && !kept.is_empty()
                    {
                        let oldest = kept
                            .iter()
                            .enumerate()
                            .min_by_key(|(_, m)| m.sequence)
                            .map(|(i, _)| i)
                            .unwrap();
                        let evicted = kept.remove(oldest);
                        used -= evicted.tokens;
                        plan.to_evict.push(evicted.id);
                    }
                }
            }

            // Emission order is chronological.
            kept.sort_by_key(|m| m.sequence);
            plan.retained
                .insert(tier, kept.iter().map(|m| m.id).collect());
        }

        // Overflow = retained tokens beyond allocations.
        for tier in Tier::ALL {
            let retained_tokens: u32 = plan
                .retained
                .get(&tier)
                .map(|ids| {
                    input
                        .content
                        .get(&tier)
                        .map(|msgs| {
                            msgs.iter()
                                .filter(|m| ids.contains(&m.id))
                                .map(|m| m.tokens)
                                .sum()
                        })
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            plan.overflow += retained_tokens.saturating_sub(plan.allocations[&tier]);
        }

        plan.success = plan.overflow == 0;
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ta_domain::message::priority;

    fn msg(tier_seq: u64, tokens: u32, pri: u8, compressible: bool) -> ContextMessage {
        let mut m = ContextMessage::user("x");
        m.tokens = tokens;
        m.priority = pri;
        m.sequence = tier_seq;
        m.compressible = compressible;
        m
    }

    fn content_with(
        tier: Tier,
        messages: Vec<ContextMessage>,
    ) -> BTreeMap<Tier, Vec<ContextMessage>> {
        let mut map = BTreeMap::new();
        map.insert(tier, messages);
        map
    }

    #[test]
    fn everything_fits_retains_all() {
        let policies = TierPolicies::default_for_budget(10_000);
        let content = content_with(Tier::Recent, vec![msg(1, 100, priority::NORMAL, true)]);
        let plan = TokenAllocator::allocate(&AllocationInput {
            total_budget: 10_000,
            reservations: 500,
            content: &content,
            incoming: None,
            policies: &policies,
        });
        assert!(plan.success);
        assert_eq!(plan.overflow, 0);
        assert_eq!(plan.retained[&Tier::Recent].len(), 1);
        assert!(plan.to_compress.is_empty());
        assert!(plan.to_evict.is_empty());
    }

    #[test]
    fn zero_available_is_overflow() {
        let policies = TierPolicies::default_for_budget(1000);
        let content = content_with(Tier::Recent, vec![msg(1, 100, priority::NORMAL, true)]);
        let plan = TokenAllocator::allocate(&AllocationInput {
            total_budget: 1000,
            reservations: 1000,
            content: &content,
            incoming: None,
            policies: &policies,
        });
        assert!(!plan.success);
        assert_eq!(plan.overflow, 100);
        assert!(plan.allocations.values().all(|&a| a == 0));
    }

    #[test]
    fn pressure_compresses_compressible_and_evicts_rest() {
        let policies = TierPolicies::default_for_budget(1000);
        // Recent gets ~450 max target; load it far beyond that.
        let messages = vec![
            msg(1, 400, priority::LOW, true),
            msg(2, 400, priority::NORMAL, false),
            msg(3, 400, priority::HIGH, true),
            msg(4, 400, priority::CRITICAL, true),
        ];
        let content = content_with(Tier::Recent, messages);
        let plan = TokenAllocator::allocate(&AllocationInput {
            total_budget: 1000,
            reservations: 0,
            content: &content,
            incoming: None,
            policies: &policies,
        });
        // Highest priority survives; over-budget compressibles are queued
        // for compression, the incompressible one for eviction.
        assert!(plan.retained[&Tier::Recent].len() >= 1);
        assert!(!plan.to_compress.is_empty());
        assert!(plan.to_evict.len() == 1);
        let seq4_id = content[&Tier::Recent][3].id;
        assert!(plan.retained[&Tier::Recent].contains(&seq4_id));
    }

    #[test]
    fn retained_order_is_chronological() {
        let policies = TierPolicies::default_for_budget(1000);
        let messages = vec![
            msg(1, 100, priority::NORMAL, true),
            msg(2, 100, priority::CRITICAL, true),
            msg(3, 100, priority::NORMAL, true),
            // Force pressure so the prioritised path runs.
            msg(4, 2000, priority::LOW, true),
        ];
        let content = content_with(Tier::Recent, messages);
        let plan = TokenAllocator::allocate(&AllocationInput {
            total_budget: 1000,
            reservations: 0,
            content: &content,
            incoming: None,
            policies: &policies,
        });
        let retained = &plan.retained[&Tier::Recent];
        let sequences: Vec<u64> = retained
            .iter()
            .map(|id| {
                content[&Tier::Recent]
                    .iter()
                    .find(|m| m.id == *id)
                    .unwrap()
                    .sequence
            })
            .collect();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sequences, sorted);
    }

    #[test]
    fn system_tier_is_never_evicted() {
        let policies = TierPolicies::default_for_budget(1000);
        let mut system_msg = ContextMessage::system("identity prompt");
        system_msg.tokens = 5000; // way over every allocation
        system_msg.sequence = 1;
        let content = content_with(Tier::System, vec![system_msg.clone()]);
        let plan = TokenAllocator::allocate(&AllocationInput {
            total_budget: 1000,
            reservations: 0,
            content: &content,
            incoming: None,
            policies: &policies,
        });
        assert!(plan.retained[&Tier::System].contains(&system_msg.id));
        assert!(plan.to_evict.is_empty());
        assert!(plan.to_compress.is_empty());
        assert!(!plan.success);
        assert!(plan.overflow > 0);
    }

    #[test]
    fn incoming_evicts_oldest_recent() {
        let policies = TierPolicies::default_for_budget(1000);
        let messages = vec![
            msg(1, 200, priority::NORMAL, false),
            msg(2, 200, priority::NORMAL, false),
            // Pressure from another tier keeps recent near its minimum.
            msg(3, 3000, priority::NORMAL, true),
        ];
        let content = content_with(Tier::Recent, messages);
        let mut incoming = ContextMessage::user("fresh");
        incoming.tokens = 600;
        incoming.sequence = 10;
        let plan = TokenAllocator::allocate(&AllocationInput {
            total_budget: 1000,
            reservations: 0,
            content: &content,
            incoming: Some(&incoming),
            policies: &policies,
        });
        // The oldest recent entries give way to the incoming message.
        let oldest_id = content[&Tier::Recent][0].id;
        assert!(plan.to_evict.contains(&oldest_id) || !plan.retained[&Tier::Recent].contains(&oldest_id));
    }

    #[test]
    fn weight_order_feeds_high_priority_tiers_first() {
        let policies = TierPolicies::default_for_budget(1000);
        let mut content: BTreeMap<Tier, Vec<ContextMessage>> = BTreeMap::new();
        content.insert(Tier::System, vec![msg(1, 400, priority::CRITICAL, false)]);
        content.insert(Tier::Ephemeral, vec![msg(2, 400, priority::EPHEMERAL, true)]);
        let plan = TokenAllocator::allocate(&AllocationInput {
            total_budget: 1000,
            reservations: 200,
            content: &content,
            incoming: None,
            policies: &policies,
        });
        // With 800 available and both tiers wanting 400, the system tier's
        // grant lands first; ephemeral takes what is left.
        assert!(plan.allocations[&Tier::System] >= plan.allocations[&Tier::Ephemeral]);
    }
}
