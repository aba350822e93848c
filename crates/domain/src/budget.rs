use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An explicit hold on part of the budget (e.g. response reserve).
/// Reservations survive [`TokenBudget::reset`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub tokens: u32,
    pub label: String,
}

/// The token budget for one prepared request.
///
/// `used = sum(allocations) + sum(reservations)`; allocations are written
/// by the allocator per category (tier name), reservations are explicit
/// holds made by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudget {
    pub max_tokens: u32,
    allocations: BTreeMap<String, u32>,
    reservations: BTreeMap<String, Reservation>,
}

impl TokenBudget {
    pub fn new(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            allocations: BTreeMap::new(),
            reservations: BTreeMap::new(),
        }
    }

    pub fn allocate(&mut self, category: impl Into<String>, tokens: u32) {
        self.allocations.insert(category.into(), tokens);
    }

    pub fn allocation(&self, category: &str) -> u32 {
        self.allocations.get(category).copied().unwrap_or(0)
    }

    pub fn allocations(&self) -> &BTreeMap<String, u32> {
        &self.allocations
    }

    pub fn reserve(&mut self, id: impl Into<String>, tokens: u32, label: impl Into<String>) {
        self.reservations.insert(
            id.into(),
            Reservation {
                tokens,
                label: label.into(),
            },
        );
    }

    pub fn release(&mut self, id: &str) -> Option<Reservation> {
        self.reservations.remove(id)
    }

    pub fn reserved_total(&self) -> u32 {
        self.reservations.values().map(|r| r.tokens).sum()
    }

    pub fn reservations(&self) -> &BTreeMap<String, Reservation> {
        &self.reservations
    }

    pub fn used(&self) -> u32 {
        self.allocations.values().sum::<u32>() + self.reserved_total()
    }

    pub fn remaining(&self) -> u32 {
        self.max_tokens.saturating_sub(self.used())
    }

    /// Tokens available to the allocator after reservations.
    pub fn available(&self) -> u32 {
        self.max_tokens.saturating_sub(self.reserved_total())
    }

    /// Clear allocations. Reservations are explicit holds and survive.
    pub fn reset(&mut self) {
        self.allocations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_sums_allocations_and_reservations() {
        let mut budget = TokenBudget::new(1000);
        budget.allocate("recent", 300);
        budget.allocate("system", 100);
        budget.reserve("response", 200, "response reserve");
        assert_eq!(budget.used(), 600);
        assert_eq!(budget.remaining(), 400);
        assert_eq!(budget.available(), 800);
    }

    #[test]
    fn remaining_never_underflows() {
        let mut budget = TokenBudget::new(100);
        budget.allocate("recent", 500);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn reset_preserves_reservations() {
        let mut budget = TokenBudget::new(1000);
        budget.allocate("recent", 300);
        budget.reserve("response", 200, "response reserve");
        budget.reset();
        assert_eq!(budget.used(), 200);
        assert_eq!(budget.reserved_total(), 200);
        assert_eq!(budget.allocation("recent"), 0);
    }

    #[test]
    fn release_returns_the_hold() {
        let mut budget = TokenBudget::new(1000);
        budget.reserve("tools", 50, "tool reserve");
        let released = budget.release("tools").unwrap();
        assert_eq!(released.tokens, 50);
        assert_eq!(budget.reserved_total(), 0);
        assert!(budget.release("tools").is_none());
    }
}
