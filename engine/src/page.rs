//! Fixed-size slotted pages.
//!
//! Every tree page is exactly 4096 bytes:
//!
//! ```text
//! +--------+-------------------------------------------+
//! | 0      | page kind (0 = leaf, 1 = internal)        |
//! | 1-2    | number of active (non-tombstone) slots    |
//! | 3-4    | free-space pointer (lowest record byte)   |
//! | 5-8    | rightmost child page id (internal only)   |
//! | 9-12   | next leaf page id (leaf only, 0 = end)    |
//! | 13-    | slot directory, 4 bytes per slot, growing |
//! |        | down: { u16 offset, u16 length }          |
//! | ...    | free space                                |
//! | -4095  | record bodies, growing up from the end    |
//! +--------+-------------------------------------------+
//! ```
//!
//! Leaf record bodies are `[u64 key][record bytes]`; internal bodies are a
//! fixed 12 bytes, `[u64 key][u32 child page id]`. The right-most child of an
//! internal page lives in the page header, not in a record.
//!
//! Deletion tombstones a slot (offset 0, length 0) and leaves the record
//! bytes in place. Tombstones are compacted away before splits and merges;
//! until then every iteration must walk the full slot array, and leaf search
//! must be a linear scan, because a tombstone probed mid-binary-search reads
//! as key 0.

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Size of the fixed page header.
pub const PAGE_HEADER_SIZE: usize = 13;

/// Size of one slot directory entry.
pub const SLOT_SIZE: usize = 4;

/// Size of an internal record body: u64 key + u32 child.
pub const INTERNAL_RECORD_SIZE: usize = 12;

/// Bytes of the key prefix at the start of every leaf record body.
pub const LEAF_KEY_SIZE: usize = 8;

/// A page identifier. Page 0 holds the table header; tree pages start at 1.
pub type PageId = u32;

/// The two tree page kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    Leaf = 0,
    Internal = 1,
}

impl TryFrom<u8> for PageKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Leaf),
            1 => Ok(Self::Internal),
            _ => Err(value),
        }
    }
}

/// One slot directory entry. `offset == 0` marks a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    offset: u16,
    length: u16,
}

impl Slot {
    const TOMBSTONE: Self = Self {
        offset: 0,
        length: 0,
    };

    const fn is_tombstone(self) -> bool {
        self.offset == 0
    }
}

/// A decoded slotted page.
///
/// The record area is kept as a raw 4096-byte image so record bytes stay at
/// their slotted offsets; the header fields and slot directory are decoded.
#[derive(Debug, Clone)]
pub struct SlottedPage {
    pub page_id: PageId,
    kind: PageKind,
    num_active: u16,
    free_ptr: u16,
    rightmost: PageId,
    next_leaf: PageId,
    slots: Vec<Slot>,
    body: Box<[u8; PAGE_SIZE]>,
}

#[allow(clippy::cast_possible_truncation)] // offsets and lengths are bounded by PAGE_SIZE
impl SlottedPage {
    /// Create an empty page of the given kind.
    #[must_use]
    pub fn new(page_id: PageId, kind: PageKind) -> Self {
        Self {
            page_id,
            kind,
            num_active: 0,
            free_ptr: PAGE_SIZE as u16,
            rightmost: 0,
            next_leaf: 0,
            slots: Vec::new(),
            body: Box::new([0u8; PAGE_SIZE]),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> PageKind {
        self.kind
    }

    /// Count of live (non-tombstone) slots.
    #[must_use]
    pub const fn num_active(&self) -> u16 {
        self.num_active
    }

    /// Length of the slot array, tombstones included. Iteration bounds must
    /// use this, not `num_active`.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Next leaf in the chain (leaf pages only; 0 = end of chain).
    #[must_use]
    pub const fn next_leaf(&self) -> PageId {
        self.next_leaf
    }

    pub const fn set_next_leaf(&mut self, id: PageId) {
        self.next_leaf = id;
    }

    /// Right-most child (internal pages only).
    #[must_use]
    pub const fn rightmost(&self) -> PageId {
        self.rightmost
    }

    pub const fn set_rightmost(&mut self, id: PageId) {
        self.rightmost = id;
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Serialize to the on-disk image. Free space serializes as zeros, so a
    /// decode/encode pair is deterministic.
    #[must_use]
    pub fn to_bytes(&self) -> Box<[u8; PAGE_SIZE]> {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        buf[0] = self.kind as u8;
        buf[1..3].copy_from_slice(&self.num_active.to_le_bytes());
        buf[3..5].copy_from_slice(&self.free_ptr.to_le_bytes());
        buf[5..9].copy_from_slice(&self.rightmost.to_le_bytes());
        buf[9..13].copy_from_slice(&self.next_leaf.to_le_bytes());

        let mut at = PAGE_HEADER_SIZE;
        for slot in &self.slots {
            buf[at..at + 2].copy_from_slice(&slot.offset.to_le_bytes());
            buf[at + 2..at + 4].copy_from_slice(&slot.length.to_le_bytes());
            at += SLOT_SIZE;
        }

        for slot in &self.slots {
            if slot.is_tombstone() {
                continue;
            }
            let off = slot.offset as usize;
            let len = slot.length as usize;
            buf[off..off + len].copy_from_slice(&self.body[off..off + len]);
        }
        buf
    }

    /// Decode a page image. The slot array is rebuilt by scanning entries
    /// until the stored active count has been seen; trailing tombstones
    /// decode as free space.
    pub fn from_bytes(bytes: &[u8; PAGE_SIZE], page_id: PageId) -> Result<Self, PageError> {
        let kind = PageKind::try_from(bytes[0]).map_err(PageError::InvalidKind)?;
        let num_active = u16::from_le_bytes([bytes[1], bytes[2]]);
        let free_ptr = u16::from_le_bytes([bytes[3], bytes[4]]);
        let rightmost = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let next_leaf = u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);

        if free_ptr as usize > PAGE_SIZE {
            return Err(PageError::Corrupt("free-space pointer out of range"));
        }

        let mut slots = Vec::new();
        let mut live = 0u16;
        let mut at = PAGE_HEADER_SIZE;
        while live < num_active {
            if at + SLOT_SIZE > free_ptr as usize {
                return Err(PageError::Corrupt("slot directory overruns record area"));
            }
            let offset = u16::from_le_bytes([bytes[at], bytes[at + 1]]);
            let length = u16::from_le_bytes([bytes[at + 2], bytes[at + 3]]);
            let slot = Slot { offset, length };
            if !slot.is_tombstone() {
                if (offset as usize) < PAGE_HEADER_SIZE
                    || offset as usize + length as usize > PAGE_SIZE
                {
                    return Err(PageError::Corrupt("slot points outside the page"));
                }
                live += 1;
            }
            slots.push(slot);
            at += SLOT_SIZE;
        }

        let mut body = Box::new([0u8; PAGE_SIZE]);
        body.copy_from_slice(bytes);

        Ok(Self {
            page_id,
            kind,
            num_active,
            free_ptr,
            rightmost,
            next_leaf,
            slots,
            body,
        })
    }

    // ------------------------------------------------------------------
    // Record access
    // ------------------------------------------------------------------

    /// Key of record `i`; 0 for tombstones and out-of-range indexes.
    #[must_use]
    pub fn get_key(&self, i: usize) -> u64 {
        match self.slots.get(i) {
            Some(slot) if !slot.is_tombstone() => {
                let off = slot.offset as usize;
                u64::from_le_bytes([
                    self.body[off],
                    self.body[off + 1],
                    self.body[off + 2],
                    self.body[off + 3],
                    self.body[off + 4],
                    self.body[off + 5],
                    self.body[off + 6],
                    self.body[off + 7],
                ])
            }
            _ => 0,
        }
    }

    /// Full body bytes of record `i`.
    pub fn get_record(&self, i: usize) -> Result<&[u8], PageError> {
        match self.slots.get(i) {
            Some(slot) if !slot.is_tombstone() => {
                let off = slot.offset as usize;
                Ok(&self.body[off..off + slot.length as usize])
            }
            _ => Err(PageError::NotFound),
        }
    }

    /// Child pointer of internal record `i` (bytes 8..12 of its body).
    #[must_use]
    pub fn internal_child(&self, i: usize) -> PageId {
        match self.slots.get(i) {
            Some(slot) if !slot.is_tombstone() => {
                let off = slot.offset as usize + LEAF_KEY_SIZE;
                u32::from_le_bytes([
                    self.body[off],
                    self.body[off + 1],
                    self.body[off + 2],
                    self.body[off + 3],
                ])
            }
            _ => 0,
        }
    }

    /// Rewrite the child pointer of internal record `i` in place.
    pub fn set_internal_child(&mut self, i: usize, child: PageId) -> Result<(), PageError> {
        match self.slots.get(i) {
            Some(slot) if !slot.is_tombstone() => {
                let off = slot.offset as usize + LEAF_KEY_SIZE;
                self.body[off..off + 4].copy_from_slice(&child.to_le_bytes());
                Ok(())
            }
            _ => Err(PageError::NotFound),
        }
    }

    /// Rewrite internal record `i` as `(key, child)` in place. The new key
    /// must preserve the page's ordering, which holds for separator updates
    /// during borrows.
    pub fn set_internal_record(
        &mut self,
        i: usize,
        key: u64,
        child: PageId,
    ) -> Result<(), PageError> {
        match self.slots.get(i) {
            Some(slot) if !slot.is_tombstone() => {
                let off = slot.offset as usize;
                self.body[off..off + 8].copy_from_slice(&key.to_le_bytes());
                self.body[off + 8..off + 12].copy_from_slice(&child.to_le_bytes());
                Ok(())
            }
            _ => Err(PageError::NotFound),
        }
    }

    /// Index of the first live slot at or after `from`.
    #[must_use]
    pub fn next_live_slot(&self, from: usize) -> Option<usize> {
        (from..self.slots.len()).find(|&i| !self.slots[i].is_tombstone())
    }

    /// Index of the last live slot strictly before `before`.
    #[must_use]
    pub fn prev_live_slot(&self, before: usize) -> Option<usize> {
        (0..before.min(self.slots.len()))
            .rev()
            .find(|&i| !self.slots[i].is_tombstone())
    }

    /// Index of the first live slot.
    #[must_use]
    pub fn first_live_slot(&self) -> Option<usize> {
        self.next_live_slot(0)
    }

    /// Index of the last live slot.
    #[must_use]
    pub fn last_live_slot(&self) -> Option<usize> {
        self.prev_live_slot(self.slots.len())
    }

    /// Key of the first live record.
    #[must_use]
    pub fn first_live_key(&self) -> Option<u64> {
        self.first_live_slot().map(|i| self.get_key(i))
    }

    /// Key of the last live record.
    #[must_use]
    pub fn last_live_key(&self) -> Option<u64> {
        self.last_live_slot().map(|i| self.get_key(i))
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Binary search for the slot index at which to insert `key`, keeping
    /// the live keys in ascending order. A tombstone at the midpoint is
    /// skipped by probing the next live slot; if the probe runs out, the
    /// whole upper half is dead and the search narrows left.
    #[must_use]
    pub fn find_insert_position(&self, key: u64) -> usize {
        let mut lo = 0usize;
        let mut hi = self.slots.len();
        while lo < hi {
            let mid = usize::midpoint(lo, hi);
            let mut probe = mid;
            while probe < hi && self.slots[probe].is_tombstone() {
                probe += 1;
            }
            if probe == hi {
                hi = mid;
            } else if self.get_key(probe) < key {
                lo = probe + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Linear scan for `key` among live leaf records.
    ///
    /// Returns `(i, true)` on a match, or `(i, false)` where `i` is the
    /// position of the first live key greater than `key` (or one past the
    /// slot array). A binary search is unusable here: a tombstone probed at
    /// the midpoint reads as key 0.
    #[must_use]
    pub fn search_leaf(&self, key: u64) -> (usize, bool) {
        for i in 0..self.slots.len() {
            if self.slots[i].is_tombstone() {
                continue;
            }
            let k = self.get_key(i);
            if k == key {
                return (i, true);
            }
            if k > key {
                return (i, false);
            }
        }
        (self.slots.len(), false)
    }

    /// Route `key` through an internal page: the child of the first live
    /// record whose key is greater than `key`, or the right-most child with
    /// no record index. Keys equal to a separator belong to the right of it.
    #[must_use]
    pub fn search_internal(&self, key: u64) -> (PageId, Option<usize>) {
        let mut lo = 0usize;
        let mut hi = self.slots.len();
        while lo < hi {
            let mid = usize::midpoint(lo, hi);
            let mut probe = mid;
            while probe < hi && self.slots[probe].is_tombstone() {
                probe += 1;
            }
            if probe == hi {
                hi = mid;
            } else if self.get_key(probe) <= key {
                lo = probe + 1;
            } else {
                hi = probe;
            }
        }
        match self.next_live_slot(lo) {
            Some(i) => (self.internal_child(i), Some(i)),
            None => (self.rightmost, None),
        }
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Insert a record body in key order. The first 8 bytes of `record`
    /// must be the little-endian key.
    pub fn insert_sorted(&mut self, record: &[u8]) -> Result<usize, PageError> {
        let len = record.len();
        if len < LEAF_KEY_SIZE || len > PAGE_SIZE - PAGE_HEADER_SIZE - SLOT_SIZE {
            return Err(PageError::BadRecord(len));
        }
        let slot_end = PAGE_HEADER_SIZE + (self.slots.len() + 1) * SLOT_SIZE;
        let free = self.free_ptr as usize;
        if free < len || free - len < slot_end {
            return Err(PageError::PageFull);
        }

        let key = u64::from_le_bytes([
            record[0], record[1], record[2], record[3], record[4], record[5], record[6], record[7],
        ]);
        let i = self.find_insert_position(key);

        let offset = free - len;
        self.body[offset..offset + len].copy_from_slice(record);
        self.slots.insert(
            i,
            Slot {
                offset: offset as u16,
                length: len as u16,
            },
        );
        self.free_ptr = offset as u16;
        self.num_active += 1;
        Ok(i)
    }

    /// Tombstone slot `i`. The record bytes stay behind until `compact`.
    pub fn delete(&mut self, i: usize) -> Result<(), PageError> {
        match self.slots.get_mut(i) {
            Some(slot) if !slot.is_tombstone() => {
                *slot = Slot::TOMBSTONE;
                self.num_active -= 1;
                Ok(())
            }
            _ => Err(PageError::NotFound),
        }
    }

    /// Rebuild the slot and record areas with only live entries, preserving
    /// order and resetting the free-space pointer.
    pub fn compact(&mut self) {
        let live: Vec<Vec<u8>> = self
            .slots
            .iter()
            .filter(|s| !s.is_tombstone())
            .map(|s| {
                let off = s.offset as usize;
                self.body[off..off + s.length as usize].to_vec()
            })
            .collect();

        self.slots.clear();
        self.num_active = 0;
        self.free_ptr = PAGE_SIZE as u16;
        for record in live {
            self.push_record(&record);
        }
    }

    /// Append an already-ordered record without searching. Only used from
    /// compaction and splits, where capacity is known to suffice.
    fn push_record(&mut self, record: &[u8]) {
        let len = record.len();
        let offset = self.free_ptr as usize - len;
        self.body[offset..offset + len].copy_from_slice(record);
        self.slots.push(Slot {
            offset: offset as u16,
            length: len as u16,
        });
        self.free_ptr = offset as u16;
        self.num_active += 1;
    }

    /// Drop the slots at and above `keep`, recomputing the record area.
    /// Callers compact first, so every kept slot is live.
    fn truncate_slots(&mut self, keep: usize) {
        self.slots.truncate(keep);
        let kept: Vec<Vec<u8>> = self
            .slots
            .iter()
            .map(|s| {
                let off = s.offset as usize;
                self.body[off..off + s.length as usize].to_vec()
            })
            .collect();
        self.slots.clear();
        self.num_active = 0;
        self.free_ptr = PAGE_SIZE as u16;
        for record in kept {
            self.push_record(&record);
        }
    }

    // ------------------------------------------------------------------
    // Space accounting
    // ------------------------------------------------------------------

    /// Bytes occupied by the header, live slots, and live record bodies.
    #[must_use]
    pub fn used_space(&self) -> usize {
        let live_bytes: usize = self
            .slots
            .iter()
            .filter(|s| !s.is_tombstone())
            .map(|s| s.length as usize)
            .sum();
        PAGE_HEADER_SIZE + self.num_active as usize * SLOT_SIZE + live_bytes
    }

    /// A page is underfull when its live content is under half the page.
    /// The root is exempt from this rule, which the tree enforces.
    #[must_use]
    pub fn is_underfull(&self) -> bool {
        self.used_space() < PAGE_SIZE / 2
    }

    /// Whether the live contents of both pages fit in one.
    #[must_use]
    pub fn can_merge_with(&self, other: &Self) -> bool {
        self.used_space() + other.used_space() - PAGE_HEADER_SIZE <= PAGE_SIZE
    }

    // ------------------------------------------------------------------
    // Split and merge
    // ------------------------------------------------------------------

    /// Split a full leaf. With the sequential hint only the last record
    /// moves to the new right page, which keeps ascending-insert workloads
    /// from leaving every left page half empty; otherwise the split is at
    /// the midpoint. Returns the right page and its first key (the key to
    /// promote). The leaf chain is spliced here.
    pub fn split_leaf(
        &mut self,
        new_page_id: PageId,
        sequential: bool,
    ) -> Result<(Self, u64), PageError> {
        self.compact();
        let n = self.slots.len();
        let split_at = if sequential { n.saturating_sub(1) } else { n / 2 };

        let mut right = Self::new(new_page_id, PageKind::Leaf);
        for i in split_at..n {
            let record = self.get_record(i)?.to_vec();
            right.insert_sorted(&record)?;
        }
        self.truncate_slots(split_at);

        right.next_leaf = self.next_leaf;
        self.next_leaf = new_page_id;

        let promoted = right.first_live_key().ok_or(PageError::NotFound)?;
        Ok((right, promoted))
    }

    /// Split a full internal page around its median record. The median key
    /// is promoted and stored in neither half; the median's child becomes
    /// the left page's new right-most child, and the old right-most child
    /// moves to the right page.
    pub fn split_internal(
        &mut self,
        new_page_id: PageId,
        sequential: bool,
    ) -> Result<(Self, u64), PageError> {
        self.compact();
        let n = self.slots.len();
        let median = if sequential { n.saturating_sub(1) } else { n / 2 };

        let promoted = self.get_key(median);
        let median_child = self.internal_child(median);

        let mut right = Self::new(new_page_id, PageKind::Internal);
        for i in median + 1..n {
            let record = self.get_record(i)?.to_vec();
            right.insert_sorted(&record)?;
        }
        right.rightmost = self.rightmost;

        self.truncate_slots(median);
        self.rightmost = median_child;

        Ok((right, promoted))
    }

    /// Append every live record of `other` and take over its chain link.
    /// `other` becomes an orphan; the caller frees its page id.
    pub fn merge_leaf(&mut self, other: &mut Self) -> Result<(), PageError> {
        self.compact();
        other.compact();
        for i in 0..other.slot_count() {
            let record = other.get_record(i)?.to_vec();
            self.insert_sorted(&record)?;
        }
        self.next_leaf = other.next_leaf;
        Ok(())
    }

    /// Merge a right internal sibling into this page. The parent's
    /// separator key is demoted as a record pointing at this page's old
    /// right-most child, then `other`'s records and right-most child are
    /// taken over. `other` becomes an orphan.
    pub fn merge_internals(&mut self, other: &mut Self, separator_key: u64) -> Result<(), PageError> {
        self.compact();
        other.compact();

        let demoted = internal_record(separator_key, self.rightmost);
        self.insert_sorted(&demoted)?;

        for i in 0..other.slot_count() {
            let record = other.get_record(i)?.to_vec();
            self.insert_sorted(&record)?;
        }
        self.rightmost = other.rightmost;
        Ok(())
    }
}

/// Build a 12-byte internal record body.
#[must_use]
pub fn internal_record(key: u64, child: PageId) -> [u8; INTERNAL_RECORD_SIZE] {
    let mut record = [0u8; INTERNAL_RECORD_SIZE];
    record[..8].copy_from_slice(&key.to_le_bytes());
    record[8..].copy_from_slice(&child.to_le_bytes());
    record
}

/// Build a leaf record body: key prefix followed by the serialized record.
#[must_use]
pub fn leaf_record(key: u64, record: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(LEAF_KEY_SIZE + record.len());
    body.extend_from_slice(&key.to_le_bytes());
    body.extend_from_slice(record);
    body
}

/// Largest serialized record the tree accepts. Two key-prefixed records
/// plus their slots must always fit in one page so a split can make
/// progress.
#[must_use]
pub const fn max_record_bytes() -> usize {
    (PAGE_SIZE - PAGE_HEADER_SIZE) / 2 - SLOT_SIZE - LEAF_KEY_SIZE
}

/// Errors from page-level operations.
#[derive(Debug, PartialEq, Eq)]
pub enum PageError {
    /// The record plus one slot entry does not fit in the page's free
    /// space. Handled by the tree via a split; never user-visible.
    PageFull,
    /// The requested slot is out of range or a tombstone.
    NotFound,
    /// A record body with an impossible length.
    BadRecord(usize),
    /// Unknown page kind byte in a stored page.
    InvalidKind(u8),
    /// A structural check failed while decoding.
    Corrupt(&'static str),
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PageFull => write!(f, "page full"),
            Self::NotFound => write!(f, "record not found in page"),
            Self::BadRecord(len) => write!(f, "invalid record length: {len}"),
            Self::InvalidKind(k) => write!(f, "invalid page kind: {k}"),
            Self::Corrupt(msg) => write!(f, "corrupt page: {msg}"),
        }
    }
}

impl std::error::Error for PageError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with_keys(keys: &[u64]) -> SlottedPage {
        let mut page = SlottedPage::new(1, PageKind::Leaf);
        for &k in keys {
            let body = leaf_record(k, &k.to_le_bytes());
            page.insert_sorted(&body).unwrap();
        }
        page
    }

    #[test]
    fn test_new_page_is_empty() {
        let page = SlottedPage::new(1, PageKind::Leaf);
        assert_eq!(page.num_active(), 0);
        assert_eq!(page.slot_count(), 0);
        assert_eq!(page.used_space(), PAGE_HEADER_SIZE);
        assert!(page.is_underfull());
    }

    #[test]
    fn test_insert_sorted_keeps_order() {
        let page = leaf_with_keys(&[5, 1, 9, 3, 7]);
        let keys: Vec<u64> = (0..page.slot_count()).map(|i| page.get_key(i)).collect();
        assert_eq!(keys, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut page = leaf_with_keys(&[2, 4, 6, 8]);
        page.set_next_leaf(17);
        let (i, found) = page.search_leaf(4);
        assert!(found);
        page.delete(i).unwrap(); // keep a tombstone in the image

        let bytes = page.to_bytes();
        let restored = SlottedPage::from_bytes(&bytes, 1).unwrap();

        assert_eq!(restored.kind(), PageKind::Leaf);
        assert_eq!(restored.num_active(), 3);
        assert_eq!(restored.next_leaf(), 17);
        let keys: Vec<u64> = (0..restored.slot_count())
            .filter(|&i| restored.get_record(i).is_ok())
            .map(|i| restored.get_key(i))
            .collect();
        assert_eq!(keys, vec![2, 6, 8]);

        // A second encode of the decoded page is bit-identical.
        assert_eq!(&restored.to_bytes()[..], &bytes[..]);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        let bytes = Box::new([0xABu8; PAGE_SIZE]);
        assert!(matches!(
            SlottedPage::from_bytes(&bytes, 1),
            Err(PageError::InvalidKind(0xAB))
        ));
    }

    #[test]
    fn test_get_record_tombstone_is_not_found() {
        let mut page = leaf_with_keys(&[1, 2, 3]);
        page.delete(1).unwrap();
        assert_eq!(page.get_record(1), Err(PageError::NotFound));
        assert_eq!(page.get_key(1), 0);
        assert_eq!(page.num_active(), 2);
        assert_eq!(page.slot_count(), 3);
    }

    #[test]
    fn test_search_leaf_skips_tombstones() {
        let mut page = leaf_with_keys(&[10, 20, 30, 40]);
        page.delete(1).unwrap();

        let (i, found) = page.search_leaf(30);
        assert!(found);
        assert_eq!(page.get_key(i), 30);

        let (_, found) = page.search_leaf(20);
        assert!(!found);

        // Key 0 never matches a tombstone.
        let (_, found) = page.search_leaf(0);
        assert!(!found);
    }

    #[test]
    fn test_find_insert_position_with_tombstones() {
        let mut page = leaf_with_keys(&[10, 20, 30, 40, 50]);
        page.delete(2).unwrap();

        assert_eq!(page.find_insert_position(5), 0);
        assert_eq!(page.find_insert_position(45), 4);
        assert_eq!(page.find_insert_position(60), 5);
    }

    #[test]
    fn test_page_full() {
        let mut page = SlottedPage::new(1, PageKind::Leaf);
        let payload = [0u8; 100];
        let mut key = 0u64;
        loop {
            let body = leaf_record(key, &payload);
            match page.insert_sorted(&body) {
                Ok(_) => key += 1,
                Err(PageError::PageFull) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        // 13 + n*(4 + 108) <= 4096 -> n = 36
        assert_eq!(page.num_active(), 36);
        assert!(!page.is_underfull());
    }

    #[test]
    fn test_compact_reclaims_tombstones() {
        let mut page = leaf_with_keys(&[1, 2, 3, 4, 5]);
        page.delete(0).unwrap();
        page.delete(3).unwrap();
        let used_before = page.used_space();

        page.compact();

        assert_eq!(page.num_active(), 3);
        assert_eq!(page.slot_count(), 3);
        assert_eq!(page.used_space(), used_before);
        let keys: Vec<u64> = (0..3).map(|i| page.get_key(i)).collect();
        assert_eq!(keys, vec![2, 4, 5]);
    }

    #[test]
    fn test_split_leaf_midpoint() {
        let mut page = leaf_with_keys(&[1, 2, 3, 4, 5, 6]);
        page.set_next_leaf(99);

        let (right, promoted) = page.split_leaf(2, false).unwrap();

        assert_eq!(promoted, 4);
        assert_eq!(page.num_active(), 3);
        assert_eq!(right.num_active(), 3);
        assert_eq!(right.first_live_key(), Some(4));
        assert_eq!(page.next_leaf(), 2);
        assert_eq!(right.next_leaf(), 99);
    }

    #[test]
    fn test_split_leaf_sequential_moves_one() {
        let mut page = leaf_with_keys(&[1, 2, 3, 4, 5, 6]);

        let (right, promoted) = page.split_leaf(2, true).unwrap();

        assert_eq!(promoted, 6);
        assert_eq!(page.num_active(), 5);
        assert_eq!(right.num_active(), 1);
    }

    #[test]
    fn test_split_internal_promotes_median() {
        let mut page = SlottedPage::new(1, PageKind::Internal);
        for (k, child) in [(10u64, 100u32), (20, 200), (30, 300), (40, 400), (50, 500)] {
            page.insert_sorted(&internal_record(k, child)).unwrap();
        }
        page.set_rightmost(600);

        let (right, promoted) = page.split_internal(2, false).unwrap();

        assert_eq!(promoted, 30);
        // The median is stored in neither half.
        assert_eq!(page.num_active(), 2);
        assert_eq!(right.num_active(), 2);
        assert_eq!(page.rightmost(), 300);
        assert_eq!(right.rightmost(), 600);
        assert_eq!(right.first_live_key(), Some(40));
    }

    #[test]
    fn test_search_internal_routing() {
        let mut page = SlottedPage::new(1, PageKind::Internal);
        page.insert_sorted(&internal_record(10, 100)).unwrap();
        page.insert_sorted(&internal_record(20, 200)).unwrap();
        page.set_rightmost(300);

        // Keys below the first separator go to its child.
        assert_eq!(page.search_internal(5), (100, Some(0)));
        // A key equal to a separator belongs to the right of it.
        assert_eq!(page.search_internal(10), (200, Some(1)));
        assert_eq!(page.search_internal(15), (200, Some(1)));
        // Keys at or above the last separator go right-most.
        assert_eq!(page.search_internal(20), (300, None));
        assert_eq!(page.search_internal(1000), (300, None));
    }

    #[test]
    fn test_merge_leaf() {
        let mut left = leaf_with_keys(&[1, 2, 3]);
        let mut right = leaf_with_keys(&[4, 5]);
        right.set_next_leaf(42);
        left.set_next_leaf(right.page_id);
        left.delete(0).unwrap();

        assert!(left.can_merge_with(&right));
        left.merge_leaf(&mut right).unwrap();

        assert_eq!(left.num_active(), 4);
        assert_eq!(left.next_leaf(), 42);
        let keys: Vec<u64> = (0..left.slot_count()).map(|i| left.get_key(i)).collect();
        assert_eq!(keys, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_merge_internals_demotes_separator() {
        let mut left = SlottedPage::new(1, PageKind::Internal);
        left.insert_sorted(&internal_record(10, 100)).unwrap();
        left.set_rightmost(150);

        let mut right = SlottedPage::new(2, PageKind::Internal);
        right.insert_sorted(&internal_record(30, 300)).unwrap();
        right.set_rightmost(350);

        left.merge_internals(&mut right, 20).unwrap();

        assert_eq!(left.num_active(), 3);
        let keys: Vec<u64> = (0..3).map(|i| left.get_key(i)).collect();
        assert_eq!(keys, vec![10, 20, 30]);
        // The demoted separator points at the old right-most child.
        assert_eq!(left.internal_child(1), 150);
        assert_eq!(left.rightmost(), 350);
    }

    #[test]
    fn test_used_space_ignores_tombstones() {
        let mut page = leaf_with_keys(&[1, 2]);
        let before = page.used_space();
        page.delete(0).unwrap();
        let record_len = LEAF_KEY_SIZE + 8;
        assert_eq!(page.used_space(), before - SLOT_SIZE - record_len);
    }
}
