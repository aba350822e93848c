use serde::{Deserialize, Serialize};

/// The six memory tiers, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    System,
    Tools,
    Resources,
    Recent,
    Archived,
    Ephemeral,
}

impl Tier {
    pub const ALL: [Tier; 6] = [
        Tier::System,
        Tier::Tools,
        Tier::Resources,
        Tier::Recent,
        Tier::Archived,
        Tier::Ephemeral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::System => "system",
            Tier::Tools => "tools",
            Tier::Resources => "resources",
            Tier::Recent => "recent",
            Tier::Archived => "archived",
            Tier::Ephemeral => "ephemeral",
        }
    }

    /// Static priority weight used by the prioritised allocation pass.
    pub fn weight(&self) -> u8 {
        match self {
            Tier::System => 100,
            Tier::Tools => 80,
            Tier::Recent => 70,
            Tier::Resources => 60,
            Tier::Archived => 40,
            Tier::Ephemeral => 10,
        }
    }

    /// Default fraction of the total budget.
    pub fn fraction(&self) -> f64 {
        match self {
            Tier::System => 0.08,
            Tier::Tools => 0.06,
            Tier::Resources => 0.10,
            Tier::Recent => 0.45,
            Tier::Archived => 0.25,
            Tier::Ephemeral => 0.06,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-tier budget policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicy {
    pub min_tokens: u32,
    pub max_tokens: u32,
    /// Fraction of the total budget this tier targets when everything fits.
    pub fraction: f64,
    pub compressible: bool,
    pub evictable: bool,
    pub weight: u8,
}

/// The full tier policy table for a given total budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicies {
    policies: Vec<(Tier, TierPolicy)>,
}

impl TierPolicies {
    /// Default policies for a total budget: fractions 8/6/10/45/25/6,
    /// min = 1/4 of the fractional allocation, max = 2x.
    pub fn default_for_budget(max_tokens: u32) -> Self {
        let policies = Tier::ALL
            .iter()
            .map(|&tier| {
                let target = (max_tokens as f64 * tier.fraction()) as u32;
                let policy = TierPolicy {
                    min_tokens: target / 4,
                    max_tokens: target.saturating_mul(2).max(1),
                    fraction: tier.fraction(),
                    compressible: !matches!(tier, Tier::System),
                    evictable: !matches!(tier, Tier::System),
                    weight: tier.weight(),
                };
                (tier, policy)
            })
            .collect();
        Self { policies }
    }

    pub fn get(&self, tier: Tier) -> &TierPolicy {
        // ALL covers every variant, so the lookup always succeeds.
        self.policies
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, p)| p)
            .unwrap()
    }

    pub fn get_mut(&mut self, tier: Tier) -> &mut TierPolicy {
        self.policies
            .iter_mut()
            .find(|(t, _)| *t == tier)
            .map(|(_, p)| p)
            .unwrap()
    }

    /// Tiers sorted by descending allocation weight.
    pub fn by_weight(&self) -> Vec<Tier> {
        let mut tiers = Tier::ALL.to_vec();
        tiers.sort_by(|a, b| self.get(*b).weight.cmp(&self.get(*a).weight));
        tiers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractions_sum_to_one() {
        let sum: f64 = Tier::ALL.iter().map(|t| t.fraction()).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn weight_order_puts_system_first_ephemeral_last() {
        let policies = TierPolicies::default_for_budget(10_000);
        let order = policies.by_weight();
        assert_eq!(order.first(), Some(&Tier::System));
        assert_eq!(order.last(), Some(&Tier::Ephemeral));
        // Recent outranks resources despite the smaller fraction.
        let recent_pos = order.iter().position(|t| *t == Tier::Recent).unwrap();
        let resources_pos = order.iter().position(|t| *t == Tier::Resources).unwrap();
        assert!(recent_pos < resources_pos);
    }

    #[test]
    fn system_tier_is_protected() {
        let policies = TierPolicies::default_for_budget(10_000);
        let system = policies.get(Tier::System);
        assert!(!system.compressible);
        assert!(!system.evictable);
    }

    #[test]
    fn default_min_below_max() {
        let policies = TierPolicies::default_for_budget(50_000);
        for tier in Tier::ALL {
            let p = policies.get(tier);
            assert!(p.min_tokens <= p.max_tokens, "{tier}: min > max");
        }
    }
}
