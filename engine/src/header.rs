//! Table header on page 0.
//!
//! The header is the sole persistent metadata for a table file: magic,
//! format version, root page id, next page id, page count, the serialized
//! schema, and the free-page list, zero-padded to one page. It is owned in
//! memory by the page cache and written back on flush.

use crate::codec::{CodecError, Reader, Writer};
use crate::page::{PAGE_SIZE, PageId};
use crate::schema::{Schema, SchemaError};

/// Magic bytes identifying a table file.
pub const MAGIC: [u8; 4] = *b"GDBT";

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

/// The decoded table header.
#[derive(Debug, Clone)]
pub struct TableHeader {
    /// Format version number.
    pub version: u16,
    /// Root page of the tree; 0 until the first root leaf is allocated.
    pub root_page: PageId,
    /// Next page id to hand out when the free list is empty.
    pub next_page_id: PageId,
    /// Number of tree pages; recomputed as `next_page_id - 1` at flush.
    pub num_pages: u32,
    /// The table's schema.
    pub schema: Schema,
    /// Reusable page ids, popped LIFO by the allocator.
    pub free_list: Vec<PageId>,
}

impl TableHeader {
    /// Header for a freshly created table. No root exists yet; the tree
    /// allocates its first leaf (page 1) on open.
    #[must_use]
    pub const fn new(schema: Schema) -> Self {
        Self {
            version: FORMAT_VERSION,
            root_page: 0,
            next_page_id: 1,
            num_pages: 0,
            schema,
            free_list: Vec::new(),
        }
    }

    /// Serialize the header, zero-padded to a full page.
    #[allow(clippy::cast_possible_truncation)] // list length is bounded by the page
    pub fn to_bytes(&self) -> Result<Box<[u8; PAGE_SIZE]>, HeaderError> {
        let mut w = Writer::with_capacity(PAGE_SIZE);
        w.put_bytes(&MAGIC);
        w.put_u16(self.version);
        w.put_u32(self.root_page);
        w.put_u32(self.next_page_id);
        w.put_u32(self.num_pages);
        w.put_bytes(&self.schema.to_bytes());
        w.put_u32(self.free_list.len() as u32);
        for &id in &self.free_list {
            w.put_u32(id);
        }

        let bytes = w.into_bytes();
        if bytes.len() > PAGE_SIZE {
            return Err(HeaderError::TooLarge(bytes.len()));
        }
        let mut page = Box::new([0u8; PAGE_SIZE]);
        page[..bytes.len()].copy_from_slice(&bytes);
        Ok(page)
    }

    /// Parse and validate a header page.
    pub fn from_bytes(bytes: &[u8; PAGE_SIZE]) -> Result<Self, HeaderError> {
        let mut r = Reader::new(bytes);

        let magic = r.read_bytes(4)?;
        if magic != MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(magic);
            return Err(HeaderError::BadMagic(found));
        }

        let version = r.read_u16()?;
        if version != FORMAT_VERSION {
            return Err(HeaderError::BadVersion(version));
        }

        let root_page = r.read_u32()?;
        let next_page_id = r.read_u32()?;
        let num_pages = r.read_u32()?;
        let schema = Schema::read_from(&mut r)?;

        let free_count = r.read_u32()? as usize;
        let mut free_list = Vec::with_capacity(free_count);
        for _ in 0..free_count {
            free_list.push(r.read_u32()?);
        }

        Ok(Self {
            version,
            root_page,
            next_page_id,
            num_pages,
            schema,
            free_list,
        })
    }
}

/// Errors from reading or writing the table header.
#[derive(Debug)]
pub enum HeaderError {
    /// The file does not start with the table magic.
    BadMagic([u8; 4]),
    /// Unknown format version.
    BadVersion(u16),
    /// The schema plus free list no longer fit in one page.
    TooLarge(usize),
    /// Truncated or malformed header bytes.
    Codec(CodecError),
    /// Malformed schema bytes.
    Schema(SchemaError),
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadMagic(m) => {
                write!(f, "bad table magic: {:?}", String::from_utf8_lossy(m))
            }
            Self::BadVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::TooLarge(n) => write!(f, "header of {n} bytes exceeds one page"),
            Self::Codec(e) => write!(f, "header codec error: {e}"),
            Self::Schema(e) => write!(f, "header schema error: {e}"),
        }
    }
}

impl std::error::Error for HeaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            Self::Schema(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for HeaderError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<SchemaError> for HeaderError {
    fn from(e: SchemaError) -> Self {
        Self::Schema(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType};

    fn test_schema() -> Schema {
        Schema::new(
            "users",
            vec![
                Field::new("id", FieldType::Int),
                Field::new("name", FieldType::Str),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_header_roundtrip() {
        let mut header = TableHeader::new(test_schema());
        header.root_page = 7;
        header.next_page_id = 12;
        header.num_pages = 11;
        header.free_list = vec![3, 9, 4];

        let bytes = header.to_bytes().unwrap();
        let restored = TableHeader::from_bytes(&bytes).unwrap();

        assert_eq!(restored.version, FORMAT_VERSION);
        assert_eq!(restored.root_page, 7);
        assert_eq!(restored.next_page_id, 12);
        assert_eq!(restored.num_pages, 11);
        assert_eq!(restored.schema, test_schema());
        assert_eq!(restored.free_list, vec![3, 9, 4]);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = Box::new([0u8; PAGE_SIZE]);
        bytes[..4].copy_from_slice(b"NOPE");
        assert!(matches!(
            TableHeader::from_bytes(&bytes),
            Err(HeaderError::BadMagic(_))
        ));
    }

    #[test]
    fn test_bad_version() {
        let mut header = TableHeader::new(test_schema());
        header.version = 99;
        let bytes = header.to_bytes().unwrap();
        assert!(matches!(
            TableHeader::from_bytes(&bytes),
            Err(HeaderError::BadVersion(99))
        ));
    }

    #[test]
    fn test_fresh_header() {
        let header = TableHeader::new(test_schema());
        assert_eq!(header.root_page, 0);
        assert_eq!(header.next_page_id, 1);
        assert_eq!(header.num_pages, 0);
        assert!(header.free_list.is_empty());
    }
}
