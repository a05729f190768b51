//! Per-stage loading sets.

use hashbrown::{HashMap, HashSet};
use terrastream_core::TileId;

/// Tiles currently in each asynchronous stage.
///
/// A tile id is in at most one set at a time. Membership in `fetching` is
/// what makes enqueueing idempotent.
///
/// Raster fetches cannot be cancelled. When a tile is evicted mid-fetch its
/// download is kept as an orphan, keyed by load epoch, until the result
/// drains. An orphan still counts as the tile's one outstanding fetch.
#[derive(Debug, Default)]
pub struct LoadingQueue {
    fetching: HashSet<TileId>,
    meshing: HashSet<TileId>,
    uploading: HashSet<TileId>,
    orphaned: HashMap<TileId, u64>,
}

impl LoadingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a fetch as started. Returns `false` if one is already in flight,
    /// orphaned or not.
    pub fn start_fetch(&mut self, id: TileId) -> bool {
        if self.contains(id) || self.orphaned.contains_key(&id) {
            return false;
        }
        self.fetching.insert(id)
    }

    /// Detach a running fetch from its evicted tile.
    ///
    /// Returns `false` if the tile was not fetching.
    pub fn orphan_fetch(&mut self, id: TileId, epoch: u64) -> bool {
        if !self.fetching.remove(&id) {
            return false;
        }
        self.orphaned.insert(id, epoch);
        true
    }

    /// Reattach an orphaned fetch to a reloaded tile.
    ///
    /// Returns the epoch of the fetch, which the new tile entry must carry.
    pub fn adopt_fetch(&mut self, id: TileId) -> Option<u64> {
        if self.contains(id) {
            return None;
        }
        let epoch = self.orphaned.remove(&id)?;
        self.fetching.insert(id);
        Some(epoch)
    }

    /// Forget an orphan once its result has arrived.
    pub fn drain_orphan(&mut self, id: TileId, epoch: u64) -> bool {
        if self.orphaned.get(&id) == Some(&epoch) {
            self.orphaned.remove(&id);
            return true;
        }
        false
    }

    pub fn has_orphaned_fetch(&self, id: TileId) -> bool {
        self.orphaned.contains_key(&id)
    }

    /// Fetches still running for evicted tiles.
    pub fn orphaned_len(&self) -> usize {
        self.orphaned.len()
    }

    /// Move a tile from fetching to meshing.
    pub fn start_mesh(&mut self, id: TileId) {
        self.fetching.remove(&id);
        self.meshing.insert(id);
    }

    /// Move a tile from meshing to uploading.
    pub fn start_upload(&mut self, id: TileId) {
        self.meshing.remove(&id);
        self.uploading.insert(id);
    }

    /// Drop a tile from every set.
    pub fn remove(&mut self, id: TileId) {
        self.fetching.remove(&id);
        self.meshing.remove(&id);
        self.uploading.remove(&id);
    }

    pub fn is_fetching(&self, id: TileId) -> bool {
        self.fetching.contains(&id)
    }

    pub fn is_meshing(&self, id: TileId) -> bool {
        self.meshing.contains(&id)
    }

    pub fn is_uploading(&self, id: TileId) -> bool {
        self.uploading.contains(&id)
    }

    /// Whether the tile is in any stage.
    pub fn contains(&self, id: TileId) -> bool {
        self.is_fetching(id) || self.is_meshing(id) || self.is_uploading(id)
    }

    pub fn fetching_len(&self) -> usize {
        self.fetching.len()
    }

    pub fn meshing_len(&self) -> usize {
        self.meshing.len()
    }

    /// Tiles waiting on a fetch or a mesh.
    pub fn in_flight(&self) -> usize {
        self.fetching.len() + self.meshing.len()
    }

    /// Tiles in any stage.
    pub fn backlog(&self) -> usize {
        self.in_flight() + self.uploading.len()
    }

    pub fn is_idle(&self) -> bool {
        self.backlog() == 0
    }

    /// Drop every entry, orphans included.
    pub fn clear(&mut self) {
        self.fetching.clear();
        self.meshing.clear();
        self.uploading.clear();
        self.orphaned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_is_started_once() {
        let mut queue = LoadingQueue::new();
        let id = TileId::new(3, 4);

        assert!(queue.start_fetch(id));
        assert!(!queue.start_fetch(id));
        assert_eq!(queue.fetching_len(), 1);
    }

    #[test]
    fn tile_is_in_one_stage_at_a_time() {
        let mut queue = LoadingQueue::new();
        let id = TileId::new(0, 0);

        queue.start_fetch(id);
        queue.start_mesh(id);
        assert!(!queue.is_fetching(id));
        assert!(queue.is_meshing(id));
        assert!(!queue.start_fetch(id));

        queue.start_upload(id);
        assert!(!queue.is_meshing(id));
        assert!(queue.is_uploading(id));
        assert_eq!(queue.backlog(), 1);
        assert_eq!(queue.in_flight(), 0);

        queue.remove(id);
        assert!(queue.is_idle());
    }

    #[test]
    fn orphaned_fetch_blocks_a_second_fetch() {
        let mut queue = LoadingQueue::new();
        let id = TileId::new(2, -1);

        queue.start_fetch(id);
        assert!(queue.orphan_fetch(id, 7));
        assert!(queue.is_idle());
        assert!(!queue.start_fetch(id));

        assert_eq!(queue.adopt_fetch(id), Some(7));
        assert!(queue.is_fetching(id));
        assert!(!queue.has_orphaned_fetch(id));
        assert_eq!(queue.adopt_fetch(id), None);
    }

    #[test]
    fn orphan_drains_only_for_its_epoch() {
        let mut queue = LoadingQueue::new();
        let id = TileId::new(0, 0);

        queue.start_fetch(id);
        queue.orphan_fetch(id, 3);
        assert!(!queue.drain_orphan(id, 2));
        assert_eq!(queue.orphaned_len(), 1);
        assert!(queue.drain_orphan(id, 3));
        assert_eq!(queue.orphaned_len(), 0);
        assert!(queue.start_fetch(id));
    }

    #[test]
    fn only_fetching_tiles_can_be_orphaned() {
        let mut queue = LoadingQueue::new();
        let id = TileId::new(1, 1);

        queue.start_fetch(id);
        queue.start_mesh(id);
        assert!(!queue.orphan_fetch(id, 1));
        assert_eq!(queue.orphaned_len(), 0);

        queue.clear();
        assert!(queue.is_idle());
    }
}
