//! Table file I/O.
//!
//! This module reads and writes raw pages against a single `<table>.db`
//! file. Byte 0..4095 is the table header; page `n` lives at byte
//! `n * 4096`. Durability is explicit: callers decide when to `sync`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::header::{HeaderError, TableHeader};
use crate::page::{PAGE_SIZE, PageId, SlottedPage};

/// A table file handle with page-granular I/O.
#[derive(Debug)]
pub struct TableFile {
    file: File,
    path: PathBuf,
}

impl TableFile {
    /// Create a new table file at `path` and write its header page.
    ///
    /// Fails if the file already exists.
    pub fn create(path: &Path, header: &TableHeader) -> Result<Self, FileError> {
        if path.exists() {
            return Err(FileError::AlreadyExists(path.to_path_buf()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(FileError::Io)?;

        file.write_all(&header.to_bytes()?[..]).map_err(FileError::Io)?;
        file.sync_all().map_err(FileError::Io)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing table file and parse its header.
    pub fn open(path: &Path) -> Result<(Self, TableHeader), FileError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(FileError::Io)?;

        let mut buf = Box::new([0u8; PAGE_SIZE]);
        file.seek(SeekFrom::Start(0)).map_err(FileError::Io)?;
        file.read_exact(&mut buf[..]).map_err(FileError::Io)?;
        let header = TableHeader::from_bytes(&buf)?;

        Ok((
            Self {
                file,
                path: path.to_path_buf(),
            },
            header,
        ))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the raw bytes of page `page_id`.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Box<[u8; PAGE_SIZE]>, FileError> {
        let offset = u64::from(page_id) * PAGE_SIZE as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(FileError::Io)?;

        let mut buf = Box::new([0u8; PAGE_SIZE]);
        self.file.read_exact(&mut buf[..]).map_err(FileError::Io)?;
        Ok(buf)
    }

    /// Write the raw bytes of page `page_id`.
    pub fn write_page(&mut self, page_id: PageId, bytes: &[u8; PAGE_SIZE]) -> Result<(), FileError> {
        let offset = u64::from(page_id) * PAGE_SIZE as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(FileError::Io)?;
        self.file.write_all(&bytes[..]).map_err(FileError::Io)?;
        Ok(())
    }

    /// Write the header to page 0.
    pub fn write_header(&mut self, header: &TableHeader) -> Result<(), FileError> {
        let bytes = header.to_bytes()?;
        self.file.seek(SeekFrom::Start(0)).map_err(FileError::Io)?;
        self.file.write_all(&bytes[..]).map_err(FileError::Io)?;
        Ok(())
    }

    /// Flush all pending writes to stable storage.
    pub fn sync(&self) -> Result<(), FileError> {
        self.file.sync_all().map_err(FileError::Io)
    }
}

/// Write a complete rebuilt table (header plus pages in id order) to a
/// fresh file and fsync it. Used by vacuum, which then atomically renames
/// the result over the live file.
pub fn write_rebuilt(
    path: &Path,
    header: &TableHeader,
    pages: &[SlottedPage],
) -> Result<(), FileError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(FileError::Io)?;

    file.write_all(&header.to_bytes()?[..]).map_err(FileError::Io)?;
    for page in pages {
        let offset = u64::from(page.page_id) * PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(offset)).map_err(FileError::Io)?;
        file.write_all(&page.to_bytes()[..]).map_err(FileError::Io)?;
    }
    file.sync_all().map_err(FileError::Io)?;
    Ok(())
}

/// Errors from table file operations.
#[derive(Debug)]
pub enum FileError {
    /// I/O failure.
    Io(std::io::Error),
    /// `create` refused to clobber an existing file.
    AlreadyExists(PathBuf),
    /// The header failed to parse or serialize.
    Header(HeaderError),
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "table file already exists: {}", p.display()),
            Self::Header(e) => write!(f, "table header error: {e}"),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Header(e) => Some(e),
            Self::AlreadyExists(_) => None,
        }
    }
}

impl From<HeaderError> for FileError {
    fn from(e: HeaderError) -> Self {
        Self::Header(e)
    }
}

impl From<std::io::Error> for FileError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageKind;
    use crate::schema::{Field, FieldType, Schema};
    use tempfile::tempdir;

    fn test_header() -> TableHeader {
        let schema = Schema::new("t", vec![Field::new("id", FieldType::Int)]).unwrap();
        TableHeader::new(schema)
    }

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("t.db");

        {
            let file = TableFile::create(&path, &test_header()).expect("create");
            file.sync().expect("sync");
        }

        let (_, header) = TableFile::open(&path).expect("open");
        assert_eq!(header.root_page, 0);
        assert_eq!(header.next_page_id, 1);
    }

    #[test]
    fn test_create_refuses_existing() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("t.db");
        std::fs::write(&path, b"something").expect("write");

        assert!(matches!(
            TableFile::create(&path, &test_header()),
            Err(FileError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("t.db");
        std::fs::write(&path, vec![0u8; PAGE_SIZE]).expect("write");

        assert!(matches!(
            TableFile::open(&path),
            Err(FileError::Header(HeaderError::BadMagic(_)))
        ));
    }

    #[test]
    fn test_page_roundtrip() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("t.db");
        let mut file = TableFile::create(&path, &test_header()).expect("create");

        let mut page = SlottedPage::new(1, PageKind::Leaf);
        page.insert_sorted(&crate::page::leaf_record(7, b"seven")).unwrap();
        file.write_page(1, &page.to_bytes()).expect("write");
        file.sync().expect("sync");

        let bytes = file.read_page(1).expect("read");
        let restored = SlottedPage::from_bytes(&bytes, 1).expect("decode");
        assert_eq!(restored.num_active(), 1);
        assert_eq!(restored.get_key(0), 7);
    }

    #[test]
    fn test_header_rewrite() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("t.db");
        let mut header = test_header();

        {
            let mut file = TableFile::create(&path, &header).expect("create");
            header.root_page = 3;
            header.next_page_id = 9;
            file.write_header(&header).expect("write header");
            file.sync().expect("sync");
        }

        let (_, restored) = TableFile::open(&path).expect("open");
        assert_eq!(restored.root_page, 3);
        assert_eq!(restored.next_page_id, 9);
    }
}
