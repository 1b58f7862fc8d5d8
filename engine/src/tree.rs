//! Disk-backed B+ tree.
//!
//! Data lives only in leaves; internal pages route. Leaves are chained
//! through `next_leaf` for range scans. The tree holds nothing but a cache
//! handle: every page it touches goes through the cache, and parents are
//! located with a breadcrumb stack recorded during descent, never with
//! parent pointers inside pages.
//!
//! Mutations follow a strict ordering for crash safety: a modified leaf is
//! written back to the cache before underflow handling starts, and a
//! modified parent is written before recursing on the parent's own
//! underflow.

use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::{CacheError, PageCache};
use crate::page::{
    self, INTERNAL_RECORD_SIZE, LEAF_KEY_SIZE, PAGE_SIZE, PageError, PageId, PageKind, SLOT_SIZE,
    SlottedPage,
};

/// Descent gives up past this depth and reports corruption.
const MAX_DEPTH: usize = 100;

/// One step of a descent: which internal page was crossed and which child
/// index was followed (`None` for the right-most child).
#[derive(Debug, Clone, Copy)]
struct Crumb {
    page_id: PageId,
    child_index: Option<usize>,
}

/// A B+ tree over a page cache.
#[derive(Debug)]
pub struct BPlusTree {
    cache: Arc<PageCache>,
}

impl BPlusTree {
    /// Open the tree stored in `cache`, allocating the first root leaf if
    /// the table is brand new.
    pub fn new(cache: Arc<PageCache>) -> Result<Self, TreeError> {
        let tree = Self { cache };
        if tree.cache.root_page() == 0 {
            let id = tree.cache.allocate_page();
            let root = SlottedPage::new(id, PageKind::Leaf);
            drop(tree.cache.add_new_page(root)?);
            tree.cache.set_root(id);
        }
        Ok(tree)
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// Walk from the root to the leaf that owns `key`, recording a
    /// breadcrumb per internal page crossed. Each page is unpinned before
    /// its child is fetched.
    fn descend(&self, key: u64) -> Result<(PageId, Vec<Crumb>), TreeError> {
        let mut id = self.cache.root_page();
        let mut crumbs = Vec::new();
        for _ in 0..MAX_DEPTH {
            let node = match self.cache.fetch(id) {
                Ok(node) => node,
                Err(CacheError::InvalidPageId(_)) => {
                    return Err(TreeError::CorruptTree("child pointer outside allocated range"));
                }
                Err(e) => return Err(e.into()),
            };
            match node.kind() {
                PageKind::Leaf => return Ok((id, crumbs)),
                PageKind::Internal => {
                    let (child, child_index) = node.search_internal(key);
                    if child == 0 {
                        return Err(TreeError::CorruptTree("internal page routes to page 0"));
                    }
                    crumbs.push(Crumb {
                        page_id: id,
                        child_index,
                    });
                    id = child;
                }
            }
        }
        Err(TreeError::CorruptTree("descent exceeded maximum depth"))
    }

    // ------------------------------------------------------------------
    // Point lookup
    // ------------------------------------------------------------------

    /// Find the record stored under `key`, without its key prefix.
    pub fn search(&self, key: u64) -> Result<Vec<u8>, TreeError> {
        let (leaf_id, _) = self.descend(key)?;
        let leaf = self.cache.fetch(leaf_id)?;
        let (i, found) = leaf.search_leaf(key);
        if !found {
            return Err(TreeError::NotFound(key));
        }
        let body = leaf.get_record(i)?;
        Ok(body[LEAF_KEY_SIZE..].to_vec())
    }

    /// Count live records by walking the leaf chain.
    pub fn count(&self) -> Result<usize, TreeError> {
        let (mut leaf_id, _) = self.descend(0)?;
        let mut visited = HashSet::new();
        let mut total = 0usize;
        while leaf_id != 0 {
            if !visited.insert(leaf_id) {
                return Err(TreeError::CorruptChain(leaf_id));
            }
            let leaf = self.cache.fetch(leaf_id)?;
            total += leaf.num_active() as usize;
            leaf_id = leaf.next_leaf();
        }
        Ok(total)
    }

    /// Collect `(key, record)` pairs with keys in `[start, end]`, in key
    /// order, by walking the leaf chain from the leaf owning `start`.
    pub fn range_scan(&self, start: u64, end: u64) -> Result<Vec<(u64, Vec<u8>)>, TreeError> {
        let mut out = Vec::new();
        if start > end {
            return Ok(out);
        }
        let (mut leaf_id, _) = self.descend(start)?;
        let mut visited = HashSet::new();
        while leaf_id != 0 {
            if !visited.insert(leaf_id) {
                return Err(TreeError::CorruptChain(leaf_id));
            }
            let leaf = self.cache.fetch(leaf_id)?;
            if leaf.kind() != PageKind::Leaf {
                return Err(TreeError::CorruptChain(leaf_id));
            }
            // Walk the whole slot array: tombstones may sit anywhere in it.
            for i in 0..leaf.slot_count() {
                let Ok(body) = leaf.get_record(i) else {
                    continue;
                };
                let key = leaf.get_key(i);
                if key < start {
                    continue;
                }
                if key > end {
                    return Ok(out);
                }
                out.push((key, body[LEAF_KEY_SIZE..].to_vec()));
            }
            leaf_id = leaf.next_leaf();
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    /// Insert `record` under `key`. Fails with `DuplicateKey` if the key is
    /// already present.
    pub fn insert(&mut self, key: u64, record: &[u8]) -> Result<(), TreeError> {
        if record.len() > page::max_record_bytes() {
            return Err(TreeError::RecordTooLarge(record.len()));
        }
        let (leaf_id, mut crumbs) = self.descend(key)?;
        let body = page::leaf_record(key, record);

        let (promoted, right_id) = {
            let mut leaf = self.cache.fetch(leaf_id)?;
            let (_, found) = leaf.search_leaf(key);
            if found {
                return Err(TreeError::DuplicateKey(key));
            }
            match leaf.insert_sorted(&body) {
                Ok(_) => {
                    self.cache.write_page(&leaf)?;
                    return Ok(());
                }
                Err(PageError::PageFull) => {
                    // Ascending workloads split off only the newest record,
                    // leaving the left page full.
                    let sequential = leaf.last_live_key().is_none_or(|k| key > k);
                    let right_id = self.cache.allocate_page();
                    let (right, promoted) = leaf.split_leaf(right_id, sequential)?;
                    let mut right = self.cache.add_new_page(right)?;
                    if key < promoted {
                        leaf.insert_sorted(&body)?;
                    } else {
                        right.insert_sorted(&body)?;
                    }
                    self.cache.write_page(&leaf)?;
                    self.cache.write_page(&right)?;
                    (promoted, right_id)
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.propagate_split(promoted, leaf_id, right_id, &mut crumbs)
    }

    /// Push a split upward. At each breadcrumbed parent, insert
    /// `(promoted, left_id)` and re-aim the pointer that follows it at
    /// `right_id`; if the parent is full, split it too and continue with
    /// its median. An empty stack with a promotion left means the root
    /// itself split.
    fn propagate_split(
        &mut self,
        mut promoted: u64,
        mut left_id: PageId,
        mut right_id: PageId,
        crumbs: &mut Vec<Crumb>,
    ) -> Result<(), TreeError> {
        while let Some(crumb) = crumbs.pop() {
            let mut parent = self.cache.fetch(crumb.page_id)?;
            let record = page::internal_record(promoted, left_id);
            match parent.insert_sorted(&record) {
                Ok(i) => {
                    Self::aim_next_pointer(&mut parent, i, right_id)?;
                    self.cache.write_page(&parent)?;
                    return Ok(());
                }
                Err(PageError::PageFull) => {
                    let sequential = parent.last_live_key().is_none_or(|k| promoted > k);
                    let new_right_id = self.cache.allocate_page();
                    let (new_right, median) = parent.split_internal(new_right_id, sequential)?;
                    let mut new_right = self.cache.add_new_page(new_right)?;
                    if promoted < median {
                        let i = parent.insert_sorted(&record)?;
                        Self::aim_next_pointer(&mut parent, i, right_id)?;
                    } else {
                        let i = new_right.insert_sorted(&record)?;
                        Self::aim_next_pointer(&mut new_right, i, right_id)?;
                    }
                    self.cache.write_page(&parent)?;
                    self.cache.write_page(&new_right)?;
                    promoted = median;
                    left_id = crumb.page_id;
                    right_id = new_right_id;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.handle_root_split(promoted, left_id, right_id)
    }

    /// After inserting `(key, left)` at slot `i`, the pointer that used to
    /// cover the split range must move to the new right page: the next live
    /// record's child if one exists, else the right-most pointer.
    fn aim_next_pointer(
        parent: &mut SlottedPage,
        i: usize,
        right_id: PageId,
    ) -> Result<(), TreeError> {
        match parent.next_live_slot(i + 1) {
            Some(j) => parent.set_internal_child(j, right_id)?,
            None => parent.set_rightmost(right_id),
        }
        Ok(())
    }

    /// Grow the tree by one level: a fresh internal root holding one
    /// record `(promoted, old_root)` and `right_id` as its right-most
    /// child.
    fn handle_root_split(
        &mut self,
        promoted: u64,
        old_root: PageId,
        right_id: PageId,
    ) -> Result<(), TreeError> {
        let new_root_id = self.cache.allocate_page();
        let mut root = SlottedPage::new(new_root_id, PageKind::Internal);
        root.insert_sorted(&page::internal_record(promoted, old_root))?;
        root.set_rightmost(right_id);
        drop(self.cache.add_new_page(root)?);
        self.cache.set_root(new_root_id);
        tracing::debug!(new_root = new_root_id, "root split; tree grew a level");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete the record stored under `key`. Fails with `NotFound` if the
    /// key is absent.
    pub fn delete(&mut self, key: u64) -> Result<(), TreeError> {
        let (leaf_id, mut crumbs) = self.descend(key)?;
        let underfull = {
            let mut leaf = self.cache.fetch(leaf_id)?;
            let (i, found) = leaf.search_leaf(key);
            if !found {
                return Err(TreeError::NotFound(key));
            }
            leaf.delete(i)?;
            // Persist the leaf before any structural fix-up so parents and
            // chain pointers only ever refer to pages in a known state.
            self.cache.write_page(&leaf)?;
            leaf.is_underfull()
        };
        if underfull {
            self.handle_underflow(leaf_id, &mut crumbs)?;
        }
        Ok(())
    }

    /// Repair an underfull page: borrow from a sibling with surplus,
    /// else merge with a sibling that fits, else accept the fragmentation.
    /// The left sibling is preferred when both exist.
    fn handle_underflow(&mut self, page_id: PageId, crumbs: &mut Vec<Crumb>) -> Result<(), TreeError> {
        let Some(crumb) = crumbs.pop() else {
            return self.collapse_root(page_id);
        };
        let parent_id = crumb.page_id;
        let mut parent = self.cache.fetch(parent_id)?;

        // The sibling pair in left-to-right order, plus the index of the
        // parent record separating them.
        let (left_id, right_id, sep_index) = match crumb.child_index {
            Some(i) => {
                if let Some(j) = parent.prev_live_slot(i) {
                    (parent.internal_child(j), page_id, j)
                } else if let Some(j) = parent.next_live_slot(i + 1) {
                    (page_id, parent.internal_child(j), i)
                } else {
                    (page_id, parent.rightmost(), i)
                }
            }
            None => {
                let j = parent
                    .last_live_slot()
                    .ok_or(TreeError::CorruptTree("underfull child has no sibling"))?;
                (parent.internal_child(j), page_id, j)
            }
        };
        if left_id == 0 || right_id == 0 || left_id == right_id {
            return Err(TreeError::CorruptTree("invalid sibling pair"));
        }
        let sep_key = parent.get_key(sep_index);

        let mut left = self.cache.fetch(left_id)?;
        let mut right = self.cache.fetch(right_id)?;
        let node_is_right = right_id == page_id;

        if self.try_borrow(
            &mut parent, &mut left, &mut right, sep_index, sep_key, node_is_right,
        )? {
            return Ok(());
        }

        if left.can_merge_with(&right) {
            match left.kind() {
                PageKind::Leaf => left.merge_leaf(&mut right)?,
                PageKind::Internal => left.merge_internals(&mut right, sep_key)?,
            }
            parent.delete(sep_index)?;
            // The pointer that covered the right page now covers the
            // merged left page.
            match parent.next_live_slot(sep_index + 1) {
                Some(j) => parent.set_internal_child(j, left_id)?,
                None => parent.set_rightmost(left_id),
            }

            // Persist the survivor and the parent before recursing.
            self.cache.write_page(&left)?;
            self.cache.write_page(&parent)?;
            self.cache.free_page(right_id);

            let parent_underfull = parent.is_underfull();
            drop(left);
            drop(right);
            drop(parent);
            if parent_underfull {
                return self.handle_underflow(parent_id, crumbs);
            }
        }
        // Neither borrow nor merge possible: the underflow is accepted.
        Ok(())
    }

    /// Move one boundary record from a sibling with surplus into the
    /// underfull node, then rewrite the parent separator to the new
    /// boundary. Returns false when the donor has no surplus.
    #[allow(clippy::too_many_arguments)]
    fn try_borrow(
        &self,
        parent: &mut SlottedPage,
        left: &mut SlottedPage,
        right: &mut SlottedPage,
        sep_index: usize,
        sep_key: u64,
        node_is_right: bool,
    ) -> Result<bool, TreeError> {
        let donor: &SlottedPage = if node_is_right { left } else { right };
        let donated_len = match donor.kind() {
            PageKind::Internal => INTERNAL_RECORD_SIZE,
            PageKind::Leaf => {
                let j = if node_is_right {
                    donor.last_live_slot()
                } else {
                    donor.first_live_slot()
                };
                match j {
                    Some(j) => donor.get_record(j)?.len(),
                    None => return Ok(false),
                }
            }
        };
        if donor.used_space() < PAGE_SIZE / 2 + SLOT_SIZE + donated_len {
            return Ok(false);
        }

        let left_id = left.page_id;
        match left.kind() {
            PageKind::Leaf => {
                if node_is_right {
                    let j = left
                        .last_live_slot()
                        .ok_or(TreeError::CorruptTree("empty borrow donor"))?;
                    let moved = left.get_record(j)?.to_vec();
                    right.insert_sorted(&moved)?;
                    left.delete(j)?;
                } else {
                    let j = right
                        .first_live_slot()
                        .ok_or(TreeError::CorruptTree("empty borrow donor"))?;
                    let moved = right.get_record(j)?.to_vec();
                    left.insert_sorted(&moved)?;
                    right.delete(j)?;
                }
                let boundary = right
                    .first_live_key()
                    .ok_or(TreeError::CorruptTree("borrow left no boundary key"))?;
                parent.set_internal_record(sep_index, boundary, left_id)?;
            }
            PageKind::Internal => {
                if node_is_right {
                    // Demote the separator into the right node, pointing at
                    // the left node's right-most child; promote the left
                    // node's last key as the new separator.
                    right.insert_sorted(&page::internal_record(sep_key, left.rightmost()))?;
                    let j = left
                        .last_live_slot()
                        .ok_or(TreeError::CorruptTree("empty borrow donor"))?;
                    let new_sep = left.get_key(j);
                    let new_rightmost = left.internal_child(j);
                    left.delete(j)?;
                    left.set_rightmost(new_rightmost);
                    parent.set_internal_record(sep_index, new_sep, left_id)?;
                } else {
                    // Symmetric: demote the separator into the left node and
                    // promote the right node's first key.
                    left.insert_sorted(&page::internal_record(sep_key, left.rightmost()))?;
                    let j = right
                        .first_live_slot()
                        .ok_or(TreeError::CorruptTree("empty borrow donor"))?;
                    let new_sep = right.get_key(j);
                    left.set_rightmost(right.internal_child(j));
                    right.delete(j)?;
                    parent.set_internal_record(sep_index, new_sep, left_id)?;
                }
            }
        }

        self.cache.write_page(left)?;
        self.cache.write_page(right)?;
        self.cache.write_page(parent)?;
        Ok(true)
    }

    /// Root underflow: a leaf root and a non-empty internal root stand as
    /// they are; an internal root with zero live slots hands the tree to
    /// its right-most child and is freed.
    fn collapse_root(&mut self, root_id: PageId) -> Result<(), TreeError> {
        let (kind, active, rightmost) = {
            let root = self.cache.fetch(root_id)?;
            (root.kind(), root.num_active(), root.rightmost())
        };
        if kind == PageKind::Internal && active == 0 {
            if rightmost == 0 {
                return Err(TreeError::CorruptTree("empty root has no right-most child"));
            }
            self.cache.set_root(rightmost);
            self.cache.free_page(root_id);
            tracing::debug!(new_root = rightmost, "root collapsed; tree lost a level");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Vacuum / bulk load
    // ------------------------------------------------------------------

    /// Rebuild the tree as a dense run of pages: pack every live record
    /// into fresh leaves in one sequential pass, stack internal layers on
    /// top, write everything to a temp file, and atomically swap it in.
    /// The result has an empty free list and no tombstones.
    pub fn vacuum(&mut self) -> Result<(), TreeError> {
        // One pass over the leaf chain gathers every live record body in
        // key order.
        let (mut leaf_id, _) = self.descend(0)?;
        let mut bodies: Vec<Vec<u8>> = Vec::new();
        let mut visited = HashSet::new();
        while leaf_id != 0 {
            if !visited.insert(leaf_id) {
                return Err(TreeError::CorruptChain(leaf_id));
            }
            let leaf = self.cache.fetch(leaf_id)?;
            for i in 0..leaf.slot_count() {
                if let Ok(body) = leaf.get_record(i) {
                    bodies.push(body.to_vec());
                }
            }
            leaf_id = leaf.next_leaf();
        }

        // Pack the leaf layer, one full page at a time, chaining as we go.
        let mut pages: Vec<SlottedPage> = Vec::new();
        let mut layer: Vec<(u64, PageId)> = Vec::new();
        let mut current = SlottedPage::new(1, PageKind::Leaf);
        let mut next_id: PageId = 2;
        for body in &bodies {
            match current.insert_sorted(body) {
                Ok(_) => {}
                Err(PageError::PageFull) => {
                    let mut full =
                        std::mem::replace(&mut current, SlottedPage::new(next_id, PageKind::Leaf));
                    full.set_next_leaf(next_id);
                    next_id += 1;
                    layer.push((
                        full.first_live_key()
                            .ok_or(TreeError::CorruptTree("empty packed leaf"))?,
                        full.page_id,
                    ));
                    pages.push(full);
                    current.insert_sorted(body)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        layer.push((current.first_live_key().unwrap_or(0), current.page_id));
        pages.push(current);

        // Stack internal layers until a single root remains. A parent's
        // records are `(child[i].first_key, child[i-1])` with the last
        // child as its right-most pointer.
        while layer.len() > 1 {
            let mut parents: Vec<(u64, PageId)> = Vec::new();
            let mut children = layer.iter();
            let &(mut node_first_key, mut pending_child) = children
                .next()
                .ok_or(TreeError::CorruptTree("empty vacuum layer"))?;
            let mut node = SlottedPage::new(next_id, PageKind::Internal);
            next_id += 1;

            for &(child_key, child_id) in children {
                let record = page::internal_record(child_key, pending_child);
                match node.insert_sorted(&record) {
                    Ok(_) => {
                        pending_child = child_id;
                    }
                    Err(PageError::PageFull) => {
                        node.set_rightmost(pending_child);
                        parents.push((node_first_key, node.page_id));
                        pages.push(std::mem::replace(
                            &mut node,
                            SlottedPage::new(next_id, PageKind::Internal),
                        ));
                        next_id += 1;
                        node_first_key = child_key;
                        pending_child = child_id;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            node.set_rightmost(pending_child);
            parents.push((node_first_key, node.page_id));
            pages.push(node);
            layer = parents;
        }

        let root_id = layer
            .first()
            .map(|&(_, id)| id)
            .ok_or(TreeError::CorruptTree("vacuum produced no root"))?;

        tracing::info!(
            records = bodies.len(),
            pages = pages.len(),
            root = root_id,
            "vacuum rebuilt tree"
        );
        self.cache.swap_rebuilt(&pages, root_id)?;
        Ok(())
    }
}

/// Errors from tree operations.
#[derive(Debug)]
pub enum TreeError {
    /// The key is not present.
    NotFound(u64),
    /// The key is already present.
    DuplicateKey(u64),
    /// The record cannot fit two-per-page and would wedge splitting.
    RecordTooLarge(usize),
    /// A structural invariant failed during descent or fix-up.
    CorruptTree(&'static str),
    /// The leaf chain revisited a page or left the leaf level.
    CorruptChain(PageId),
    /// Page cache failure.
    Cache(CacheError),
    /// Page-level failure.
    Page(PageError),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "key not found: {key}"),
            Self::DuplicateKey(key) => write!(f, "duplicate key: {key}"),
            Self::RecordTooLarge(len) => write!(
                f,
                "record of {len} bytes exceeds the {} byte limit",
                page::max_record_bytes()
            ),
            Self::CorruptTree(msg) => write!(f, "corrupt tree: {msg}"),
            Self::CorruptChain(id) => write!(f, "corrupt leaf chain at page {id}"),
            Self::Cache(e) => write!(f, "tree cache error: {e}"),
            Self::Page(e) => write!(f, "tree page error: {e}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cache(e) => Some(e),
            Self::Page(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CacheError> for TreeError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

impl From<PageError> for TreeError {
    fn from(e: PageError) -> Self {
        Self::Page(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType, Schema};
    use tempfile::tempdir;

    fn test_schema() -> Schema {
        Schema::new("t", vec![Field::new("id", FieldType::Int)]).unwrap()
    }

    fn new_tree(capacity: usize) -> (tempfile::TempDir, BPlusTree) {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("t.db");
        let cache = PageCache::create(&path, test_schema(), capacity).expect("create cache");
        let tree = BPlusTree::new(cache).expect("create tree");
        (dir, tree)
    }

    fn payload(i: u64) -> Vec<u8> {
        format!("record_{i:050}").into_bytes() // ~57 bytes
    }

    #[test]
    fn test_empty_tree_is_a_single_leaf_root() {
        let (_dir, tree) = new_tree(64);
        let stats = tree.cache().stats();
        assert_eq!(stats.root_page, 1);
        assert_eq!(stats.next_page_id, 2);
        assert!(matches!(tree.search(1), Err(TreeError::NotFound(1))));
        assert_eq!(tree.count().unwrap(), 0);
    }

    #[test]
    fn test_insert_then_search() {
        let (_dir, mut tree) = new_tree(64);
        tree.insert(42, b"hello").unwrap();
        assert_eq!(tree.search(42).unwrap(), b"hello");
        assert_eq!(tree.count().unwrap(), 1);
        // Still a single leaf root.
        assert_eq!(tree.cache().stats().next_page_id, 2);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let (_dir, mut tree) = new_tree(64);
        tree.insert(7, b"first").unwrap();
        assert!(matches!(
            tree.insert(7, b"second"),
            Err(TreeError::DuplicateKey(7))
        ));
        assert_eq!(tree.search(7).unwrap(), b"first");
    }

    #[test]
    fn test_oversized_record_rejected() {
        let (_dir, mut tree) = new_tree(64);
        let big = vec![0u8; page::max_record_bytes() + 1];
        assert!(matches!(
            tree.insert(1, &big),
            Err(TreeError::RecordTooLarge(_))
        ));
    }

    #[test]
    fn test_ascending_inserts_split_and_stay_ordered() {
        let (_dir, mut tree) = new_tree(64);
        let n = 2000u64;
        for i in 1..=n {
            tree.insert(i, &payload(i)).unwrap();
        }

        assert_eq!(tree.count().unwrap(), n as usize);
        for i in 1..=n {
            assert_eq!(tree.search(i).unwrap(), payload(i), "key {i}");
        }

        let all = tree.range_scan(0, u64::MAX).unwrap();
        assert_eq!(all.len(), n as usize);
        let keys: Vec<u64> = all.iter().map(|(k, _)| *k).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(keys, sorted, "scan must be strictly ascending");
    }

    #[test]
    fn test_sequential_split_keeps_the_left_page_full() {
        let (_dir, mut tree) = new_tree(64);
        // Fill until the first split happens.
        let mut i = 1u64;
        while tree.cache().stats().next_page_id == 2 {
            tree.insert(i, &payload(i)).unwrap();
            i += 1;
        }
        let total = i - 1;

        // The split moved only the newest record; the incoming key then
        // landed beside it. The left page keeps everything else.
        let first = tree.cache().fetch(1).expect("fetch first leaf");
        let second_id = first.next_leaf();
        assert_ne!(second_id, 0);
        let second = tree.cache().fetch(second_id).expect("fetch second leaf");
        assert_eq!(second.num_active(), 2);
        assert_eq!(u64::from(first.num_active()), total - 2);
        assert!(!first.is_underfull());
    }

    #[test]
    fn test_random_order_inserts_scan_sorted() {
        let (_dir, mut tree) = new_tree(64);
        // A fixed permutation, no RNG needed.
        let n = 1000u64;
        let step = 607; // coprime with 1000
        let mut key = 13u64;
        for _ in 0..n {
            tree.insert(key, &payload(key)).unwrap();
            key = (key + step) % n;
        }

        let all = tree.range_scan(0, u64::MAX).unwrap();
        assert_eq!(all.len(), n as usize);
        for window in all.windows(2) {
            assert!(window[0].0 < window[1].0);
        }
    }

    #[test]
    fn test_range_scan_bounds_are_inclusive() {
        let (_dir, mut tree) = new_tree(64);
        for i in 1..=500u64 {
            tree.insert(i, &payload(i)).unwrap();
        }

        let hits = tree.range_scan(200, 300).unwrap();
        assert_eq!(hits.len(), 101);
        assert_eq!(hits.first().map(|(k, _)| *k), Some(200));
        assert_eq!(hits.last().map(|(k, _)| *k), Some(300));
    }

    #[test]
    fn test_delete_simple() {
        let (_dir, mut tree) = new_tree(64);
        tree.insert(1, b"one").unwrap();
        tree.insert(2, b"two").unwrap();

        tree.delete(1).unwrap();
        assert!(matches!(tree.search(1), Err(TreeError::NotFound(1))));
        assert_eq!(tree.search(2).unwrap(), b"two");
        assert!(matches!(tree.delete(1), Err(TreeError::NotFound(1))));
    }

    #[test]
    fn test_delete_triggers_borrow_from_left() {
        let (_dir, mut tree) = new_tree(64);
        // Ascending fill until the first split: left leaf full, right leaf
        // holds exactly one record.
        let mut i = 1u64;
        while tree.cache().stats().next_page_id == 2 {
            tree.insert(i, &payload(i)).unwrap();
            i += 1;
        }
        let last = i - 1;

        // Empty the right leaf; the left sibling has surplus, so a borrow
        // refills it and rewrites the separator.
        tree.delete(last).unwrap();
        assert_eq!(tree.search(last - 1).unwrap(), payload(last - 1));
        let all = tree.range_scan(0, u64::MAX).unwrap();
        assert_eq!(all.len(), (last - 1) as usize);
    }

    #[test]
    fn test_delete_everything_collapses_to_a_leaf_root() {
        let (_dir, mut tree) = new_tree(64);
        let n = 1500u64;
        for i in 1..=n {
            tree.insert(i, &payload(i)).unwrap();
        }
        let grown = tree.cache().stats();
        assert!(grown.next_page_id > 2, "tree should have split");

        for i in 1..=n {
            tree.delete(i).unwrap();
        }

        assert_eq!(tree.count().unwrap(), 0);
        let stats = tree.cache().stats();
        // Merges returned the orphaned pages to the allocator.
        assert!(stats.free_pages > 0);
        // The root is a leaf again.
        let root = tree.cache().fetch(stats.root_page).expect("fetch root");
        assert_eq!(root.kind(), PageKind::Leaf);
    }

    #[test]
    fn test_freed_pages_are_reused() {
        let (_dir, mut tree) = new_tree(64);
        let n = 1500u64;
        for i in 1..=n {
            tree.insert(i, &payload(i)).unwrap();
        }
        for i in 1..=n {
            tree.delete(i).unwrap();
        }
        let after_delete = tree.cache().stats();
        assert!(after_delete.free_pages > 0);

        for i in 1..=n {
            tree.insert(i, &payload(i)).unwrap();
        }
        let after_refill = tree.cache().stats();
        assert!(
            after_refill.next_page_id <= after_delete.next_page_id + 2,
            "refill should draw from the free list, not fresh ids"
        );
    }

    #[test]
    fn test_delete_every_other_key() {
        let (_dir, mut tree) = new_tree(64);
        let n = 2000u64;
        for i in 1..=n {
            tree.insert(i, &payload(i)).unwrap();
        }
        for i in (2..=n).step_by(2) {
            tree.delete(i).unwrap();
        }

        let all = tree.range_scan(0, u64::MAX).unwrap();
        assert_eq!(all.len(), (n / 2) as usize);
        for (pos, (key, _)) in all.iter().enumerate() {
            assert_eq!(*key, 2 * pos as u64 + 1);
        }
    }

    #[test]
    fn test_no_pins_survive_operations() {
        let (_dir, mut tree) = new_tree(64);
        for i in 1..=600u64 {
            tree.insert(i, &payload(i)).unwrap();
            assert_eq!(tree.cache().stats().pinned_pages, 0, "insert leaked a pin");
        }
        let _ = tree.range_scan(100, 400).unwrap();
        assert_eq!(tree.cache().stats().pinned_pages, 0, "scan leaked a pin");
        for i in 1..=600u64 {
            tree.delete(i).unwrap();
            assert_eq!(tree.cache().stats().pinned_pages, 0, "delete leaked a pin");
        }
    }

    #[test]
    fn test_small_cache_still_works() {
        // Capacity close to the minimum a single operation needs.
        let (_dir, mut tree) = new_tree(8);
        let n = 1200u64;
        for i in 1..=n {
            tree.insert(i, &payload(i)).unwrap();
        }
        assert_eq!(tree.count().unwrap(), n as usize);
        for i in (1..=n).step_by(97) {
            assert_eq!(tree.search(i).unwrap(), payload(i));
        }
    }

    #[test]
    fn test_three_level_tree_roundtrip() {
        // Enough ascending records to split internal pages, not just
        // leaves: an internal page holds ~250 routing records.
        let (_dir, mut tree) = new_tree(128);
        let n = 16_000u64;
        for i in 1..=n {
            tree.insert(i, &payload(i)).unwrap();
        }

        // The root must now be internal over internal pages.
        let root = tree.cache().stats().root_page;
        let root_page = tree.cache().fetch(root).expect("fetch root");
        assert_eq!(root_page.kind(), PageKind::Internal);
        let child = tree.cache().fetch(root_page.internal_child(0)).expect("fetch child");
        assert_eq!(child.kind(), PageKind::Internal);
        drop(child);
        drop(root_page);

        assert_eq!(tree.count().unwrap(), n as usize);
        for i in (1..=n).step_by(997) {
            assert_eq!(tree.search(i).unwrap(), payload(i));
        }

        for i in 1..=n {
            tree.delete(i).unwrap();
        }
        assert_eq!(tree.count().unwrap(), 0);
        let stats = tree.cache().stats();
        let root = tree.cache().fetch(stats.root_page).expect("fetch root");
        assert_eq!(root.kind(), PageKind::Leaf);
    }

    #[test]
    fn test_vacuum_preserves_content_and_shrinks() {
        let (_dir, mut tree) = new_tree(64);
        let n = 2000u64;
        for i in 1..=n {
            tree.insert(i, &payload(i)).unwrap();
        }
        for i in (2..=n).step_by(2) {
            tree.delete(i).unwrap();
        }

        let before = tree.cache().stats();
        let expected = tree.range_scan(0, u64::MAX).unwrap();

        tree.vacuum().unwrap();

        let after = tree.cache().stats();
        assert!(after.num_pages < before.num_pages, "vacuum must shrink");
        assert_eq!(after.free_pages, 0, "vacuum resets the free list");
        assert_eq!(tree.range_scan(0, u64::MAX).unwrap(), expected);
        for i in (1..=n).step_by(2) {
            assert_eq!(tree.search(i).unwrap(), payload(i));
        }
    }

    #[test]
    fn test_vacuum_empty_tree() {
        let (_dir, mut tree) = new_tree(64);
        tree.vacuum().unwrap();
        assert_eq!(tree.count().unwrap(), 0);
        let stats = tree.cache().stats();
        assert_eq!(stats.num_pages, 1);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("t.db");
        let n = 800u64;

        {
            let cache = PageCache::create(&path, test_schema(), 64).expect("create");
            let mut tree = BPlusTree::new(cache).expect("tree");
            for i in 1..=n {
                tree.insert(i, &payload(i)).unwrap();
            }
            tree.cache().flush_all().expect("flush");
        }

        let cache = PageCache::open(&path, 64).expect("open");
        let tree = BPlusTree::new(cache).expect("tree");
        assert_eq!(tree.count().unwrap(), n as usize);
        for i in (1..=n).step_by(61) {
            assert_eq!(tree.search(i).unwrap(), payload(i));
        }
    }
}
