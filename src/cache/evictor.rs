//! Slot replacement policy for the KV cache.
//!
//! While any slot is unused the first free one is handed out. Once the arena
//! is full the victim depends on [`SlotPolicy`]:
//! - `TokenModulo`: slot `total_tokens_processed % total_blocks`, a cheap
//!   round-robin that may evict a slot touched moments ago
//! - `LeastRecentlyUsed`: the slot with the oldest access tick (first wins ties)

use crate::cache::block::CacheBlockMeta;
use crate::config::SlotPolicy;

#[derive(Debug, Clone, Copy)]
pub struct Evictor {
    policy: SlotPolicy,
}

impl Evictor {
    pub fn new(policy: SlotPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> SlotPolicy {
        self.policy
    }

    /// Pick the slot for the next store. `slots` must be non-empty.
    pub fn select_slot(&self, slots: &[Option<CacheBlockMeta>], tokens_processed: u64) -> usize {
        if let Some(free) = slots.iter().position(Option::is_none) {
            return free;
        }
        match self.policy {
            SlotPolicy::TokenModulo => (tokens_processed % slots.len() as u64) as usize,
            SlotPolicy::LeastRecentlyUsed => {
                let mut victim = 0;
                let mut oldest = u64::MAX;
                for (i, meta) in slots.iter().enumerate() {
                    if let Some(meta) = meta {
                        if meta.last_access < oldest {
                            oldest = meta.last_access;
                            victim = i;
                        }
                    }
                }
                victim
            }
        }
    }
}
