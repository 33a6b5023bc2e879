use std::collections::BTreeMap;

use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;

use crate::error::{DispatchError, Result};

/// Picks the queue to dequeue from when several are eligible.
///
/// Injected into the multi-queue dispatcher so tests can pin the choice.
pub trait QueueSelector: Send + Sync {
    fn select(&self, candidates: &[String]) -> Result<String>;
}

/// Draws one candidate with probability proportional to its weight.
///
/// Candidates missing from the weight table weigh 0 and are never drawn
/// while any positive-weight candidate exists. Draws are independent.
#[derive(Debug, Clone, Default)]
pub struct WeightedQueueSelector {
    weights: BTreeMap<String, u32>,
}

impl WeightedQueueSelector {
    pub fn new(weights: BTreeMap<String, u32>) -> Self {
        Self { weights }
    }

    pub fn weight(&self, queue: &str) -> u32 {
        self.weights.get(queue).copied().unwrap_or(0)
    }
}

impl QueueSelector for WeightedQueueSelector {
    fn select(&self, candidates: &[String]) -> Result<String> {
        let weights: Vec<u32> = candidates.iter().map(|q| self.weight(q)).collect();

        let dist = WeightedIndex::new(&weights)
            .map_err(|_| DispatchError::NoSelectableQueue(candidates.join(", ")))?;
        let index = dist.sample(&mut rand::thread_rng());

        tracing::trace!(queue = %candidates[index], ?weights, "Selected queue");
        Ok(candidates[index].clone())
    }
}

/// Always returns the configured queue. Handy for pinning selection.
#[derive(Debug, Clone)]
pub struct FixedQueueSelector(pub String);

impl QueueSelector for FixedQueueSelector {
    fn select(&self, _candidates: &[String]) -> Result<String> {
        Ok(self.0.clone())
    }
}
