// qci-trainer-rs/src/categorizer.rs
// Performance categorizer: a pure partition of scored items into tiers.

use serde::{Deserialize, Serialize};

use crate::batch::ScoredCall;
use crate::rubric::Tier;
use crate::scorer::QciResult;

/// Anything carrying a QCI score.
pub trait HasScore {
    fn qci_score(&self) -> u8;
}

impl HasScore for QciResult {
    fn qci_score(&self) -> u8 {
        self.score
    }
}

impl HasScore for ScoredCall {
    fn qci_score(&self) -> u8 {
        self.result.score
    }
}

impl<T: HasScore> HasScore for &T {
    fn qci_score(&self) -> u8 {
        (**self).qci_score()
    }
}

/// Five disjoint groups, input order preserved within each group.
#[derive(Debug, Clone)]
pub struct TierGroups<T> {
    pub excellent: Vec<T>,
    pub good: Vec<T>,
    pub average: Vec<T>,
    pub poor: Vec<T>,
    pub failed: Vec<T>,
}

impl<T> Default for TierGroups<T> {
    fn default() -> Self {
        Self {
            excellent: Vec::new(),
            good: Vec::new(),
            average: Vec::new(),
            poor: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T: HasScore> TierGroups<T> {
    pub fn categorize(items: impl IntoIterator<Item = T>) -> Self {
        let mut groups = Self::default();
        for item in items {
            let tier = Tier::for_score(f64::from(item.qci_score()));
            groups.group_mut(tier).push(item);
        }
        groups
    }
}

impl<T> TierGroups<T> {
    pub fn group(&self, tier: Tier) -> &[T] {
        match tier {
            Tier::Excellent => &self.excellent,
            Tier::Good => &self.good,
            Tier::Average => &self.average,
            Tier::Poor => &self.poor,
            Tier::Failed => &self.failed,
        }
    }

    fn group_mut(&mut self, tier: Tier) -> &mut Vec<T> {
        match tier {
            Tier::Excellent => &mut self.excellent,
            Tier::Good => &mut self.good,
            Tier::Average => &mut self.average,
            Tier::Poor => &mut self.poor,
            Tier::Failed => &mut self.failed,
        }
    }

    /// Excellent then good.
    pub fn successful(&self) -> Vec<&T> {
        self.collect_where(Tier::is_successful)
    }

    /// Poor then failed.
    pub fn failing(&self) -> Vec<&T> {
        self.collect_where(Tier::is_failing)
    }

    fn collect_where(&self, keep: fn(&Tier) -> bool) -> Vec<&T> {
        Tier::ALL
            .iter()
            .filter(|tier| keep(*tier))
            .flat_map(|tier| self.group(*tier).iter())
            .collect()
    }

    pub fn len(&self) -> usize {
        Tier::ALL.iter().map(|t| self.group(*t).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn distribution(&self) -> TierDistribution {
        TierDistribution {
            excellent: self.excellent.len(),
            good: self.good.len(),
            average: self.average.len(),
            poor: self.poor.len(),
            failed: self.failed.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDistribution {
    pub excellent: usize,
    pub good: usize,
    pub average: usize,
    pub poor: usize,
    pub failed: usize,
}
