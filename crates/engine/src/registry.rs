//! Registry of live assets, keyed by id.
//!
//! Owned exclusively by the coordinator task. Repeated requests for an id
//! reuse the existing [`AssetOptimiser`], so concurrent triggers on the same
//! file collapse into one state machine.

use crate::asset::{AssetOptimiser, AssetState, AssetType};
use crate::snapshot::{now_unix_ms, AggregateCounts, RegistrySnapshot};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

#[derive(Debug)]
pub struct OptimisationRegistry {
    assets: HashMap<String, AssetOptimiser>,
    /// Insertion order for stable listings
    order: Vec<String>,
    /// Recently removed assets, most recent first
    history: VecDeque<AssetOptimiser>,
    history_limit: usize,
    counts: AggregateCounts,
}

impl OptimisationRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            assets: HashMap::new(),
            order: Vec::new(),
            history: VecDeque::new(),
            history_limit,
            counts: AggregateCounts::default(),
        }
    }

    /// Existing asset for `id`, or a new one. The flag is true when created.
    pub fn get_or_create(
        &mut self,
        id: &str,
        asset_type: AssetType,
        source_path: Option<PathBuf>,
    ) -> (&mut AssetOptimiser, bool) {
        let created = !self.assets.contains_key(id);
        if created {
            self.order.push(id.to_string());
        }
        let asset = self
            .assets
            .entry(id.to_string())
            .or_insert_with(|| AssetOptimiser::new(id, asset_type, source_path));
        (asset, created)
    }

    pub fn get(&self, id: &str) -> Option<&AssetOptimiser> {
        self.assets.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut AssetOptimiser> {
        self.assets.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.assets.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Move an asset into the removal history.
    pub fn remove(&mut self, id: &str) -> Option<&AssetOptimiser> {
        let mut asset = self.assets.remove(id)?;
        self.order.retain(|other| other != id);
        asset.mark_removed();

        self.history.retain(|old| old.id() != id);
        self.history.push_front(asset);
        self.history.truncate(self.history_limit);
        self.recount();
        self.history.front()
    }

    /// Put the most recently removed asset with `id` back. `None` when there is
    /// nothing to bring back or the id is live again.
    pub fn bring_back(&mut self, id: &str) -> Option<&mut AssetOptimiser> {
        if self.assets.contains_key(id) {
            return None;
        }
        let index = self.history.iter().position(|a| a.id() == id)?;
        let mut asset = self.history.remove(index)?;
        asset.revive();

        self.order.push(id.to_string());
        self.assets.insert(id.to_string(), asset);
        self.recount();
        self.assets.get_mut(id)
    }

    /// Every live asset in insertion order.
    pub fn all(&self) -> impl Iterator<Item = &AssetOptimiser> {
        self.order.iter().filter_map(|id| self.assets.get(id))
    }

    /// Live assets callers display (hidden background jobs excluded).
    pub fn visible(&self) -> impl Iterator<Item = &AssetOptimiser> {
        self.all().filter(|a| !a.is_hidden())
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.all()
            .filter(|a| a.running)
            .map(|a| a.id().to_string())
            .collect()
    }

    /// Remove every asset that is neither running nor waiting to run.
    /// Returns the removed ids.
    pub fn clear_finished(&mut self) -> Vec<String> {
        let ids: Vec<String> = self
            .all()
            .filter(|a| !a.running && !a.pending)
            .map(|a| a.id().to_string())
            .collect();
        for id in &ids {
            self.remove(id);
        }
        ids
    }

    pub fn history_ids(&self) -> Vec<String> {
        self.history.iter().map(|a| a.id().to_string()).collect()
    }

    pub fn counts(&self) -> AggregateCounts {
        self.counts
    }

    /// Recompute derived counts. Returns whether they changed.
    pub fn recount(&mut self) -> bool {
        let mut counts = AggregateCounts::default();
        for asset in self.assets.values().filter(|a| !a.is_hidden()) {
            counts.visible_count += 1;
            match asset.state() {
                AssetState::Finished => counts.done_count += 1,
                AssetState::Failed => counts.failed_count += 1,
                AssetState::Running => counts.running_count += 1,
                AssetState::Idle | AssetState::Removed => {}
            }
        }
        let changed = counts != self.counts;
        self.counts = counts;
        changed
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            timestamp_unix_ms: now_unix_ms(),
            assets: self.all().map(AssetOptimiser::snapshot).collect(),
            counts: self.counts,
            history: self.history_ids(),
        }
    }
}
