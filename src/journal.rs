//! The rollback journal.
//!
//! Before a commit touches the database file, the pre-image of every
//! page it will overwrite is written to `<db>-journal` and fsynced.
//! Deleting the journal is the commit point: a journal found at open
//! means the last commit did not finish, and replaying it restores the
//! pre-state. Recovery is idempotent.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::info;

use crate::{
    btree::consts::{DB_HEADER_SIZE, PAGE_SIZE},
    error::DbError,
    io::{ByteReader, ByteWriter},
    types::{DbResult, PageIndex},
};

pub const JOURNAL_MAGIC: &[u8; 8] = b"minisql\n";
pub const JOURNAL_VERSION: u32 = 1;
pub const JOURNAL_HEADER_SIZE: usize = 29;

/// Pre-image of one page. `body` is the page body: full page for any
/// page but 0, the part after the database header for page 0.
pub struct JournalEntry {
    pub page_index: PageIndex,
    pub body: Vec<u8>,
}

pub fn journal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("-journal");
    PathBuf::from(name)
}

fn entry_body_size(page_index: PageIndex) -> usize {
    if page_index == 0 {
        PAGE_SIZE - DB_HEADER_SIZE
    } else {
        PAGE_SIZE
    }
}

fn marshal_header(db_header_changed: bool, num_pages: u32, crc: u32) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(JOURNAL_HEADER_SIZE);
    w.write_bytes(JOURNAL_MAGIC);
    w.write(&JOURNAL_VERSION);
    w.write(&(PAGE_SIZE as u32));
    w.write(&(db_header_changed as u8));
    w.write(&num_pages);
    w.write(&crc);
    w.write(&0u32); // reserved
    w.into_bytes()
}

/// Build and finalize the journal for one commit: header first (with
/// placeholder counters), then the body, then the rewritten header, and
/// one fsync before returning.
pub fn write_journal(
    db_path: &Path,
    db_header_preimage: Option<&[u8]>,
    entries: &[JournalEntry],
) -> DbResult<()> {
    let path = journal_path(db_path);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;

    // phase 1: placeholder header + body
    file.write_all(&marshal_header(db_header_preimage.is_some(), 0, 0))?;

    let mut body = Vec::new();
    if let Some(h) = db_header_preimage {
        debug_assert_eq!(h.len(), DB_HEADER_SIZE);
        body.extend_from_slice(h);
    }
    for entry in entries {
        debug_assert_eq!(entry.body.len(), entry_body_size(entry.page_index));
        let mut w = ByteWriter::new();
        w.write(&entry.page_index);
        body.extend_from_slice(&w.into_bytes());
        body.extend_from_slice(&entry.body);
    }
    file.write_all(&body)?;

    // phase 2: finalize with the real counters and checksum
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&marshal_header(
        db_header_preimage.is_some(),
        entries.len() as u32,
        crc,
    ))?;
    file.sync_all()?;
    Ok(())
}

/// The commit point: once the journal is gone, the commit is durable.
pub fn remove_journal(db_path: &Path) -> DbResult<()> {
    let path = journal_path(db_path);
    std::fs::remove_file(&path)?;
    // make the unlink durable before declaring the commit done
    if let Some(dir) = path.parent() {
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(())
}

/// Replay the journal into the database file if one is present.
/// Returns whether a recovery happened. A missing or empty journal
/// means the previous shutdown was clean; an unreadable one aborts the
/// open.
pub fn recover(db_path: &Path) -> DbResult<bool> {
    let path = journal_path(db_path);
    let mut journal = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let mut raw = Vec::new();
    journal.read_to_end(&mut raw)?;
    if raw.is_empty() {
        std::fs::remove_file(&path)?;
        return Ok(false);
    }
    if raw.len() < JOURNAL_HEADER_SIZE {
        return Err(DbError::CorruptJournal("truncated header".into()));
    }

    let mut r = ByteReader::new(&raw);
    let magic = r.read_bytes(8).map_err(corrupt_journal)?;
    if magic != JOURNAL_MAGIC {
        return Err(DbError::CorruptJournal(format!(
            "bad magic {}",
            hex::encode(magic)
        )));
    }
    let version: u32 = r.read().map_err(corrupt_journal)?;
    if version != JOURNAL_VERSION {
        return Err(DbError::CorruptJournal(format!("bad version {}", version)));
    }
    let page_size: u32 = r.read().map_err(corrupt_journal)?;
    if page_size as usize != PAGE_SIZE {
        return Err(DbError::CorruptJournal(format!(
            "page size {} does not match {}",
            page_size, PAGE_SIZE
        )));
    }
    let db_header_changed: u8 = r.read().map_err(corrupt_journal)?;
    let num_pages: u32 = r.read().map_err(corrupt_journal)?;
    let expected_crc: u32 = r.read().map_err(corrupt_journal)?;
    let _reserved: u32 = r.read().map_err(corrupt_journal)?;

    let body = &raw[JOURNAL_HEADER_SIZE..];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != expected_crc {
        return Err(DbError::CorruptJournal("checksum mismatch".into()));
    }

    let mut r = ByteReader::new(body);
    let header_preimage = if db_header_changed != 0 {
        Some(r.read_bytes(DB_HEADER_SIZE).map_err(corrupt_journal)?)
    } else {
        None
    };

    let mut entries = Vec::with_capacity(num_pages as usize);
    for _ in 0..num_pages {
        let page_index: PageIndex = r.read().map_err(corrupt_journal)?;
        let body = r
            .read_bytes(entry_body_size(page_index))
            .map_err(corrupt_journal)?;
        entries.push((page_index, body));
    }
    if r.remaining() != 0 {
        return Err(DbError::CorruptJournal("trailing bytes".into()));
    }

    info!(
        "replaying journal: {} pages{}",
        num_pages,
        if header_preimage.is_some() {
            " + db header"
        } else {
            ""
        }
    );

    let mut db = OpenOptions::new().read(true).write(true).open(db_path)?;
    if let Some(h) = header_preimage {
        db.seek(SeekFrom::Start(0))?;
        db.write_all(h)?;
    }
    for (page_index, body) in entries {
        let offset = if page_index == 0 {
            DB_HEADER_SIZE as u64
        } else {
            page_index as u64 * PAGE_SIZE as u64
        };
        db.seek(SeekFrom::Start(offset))?;
        db.write_all(body)?;
    }
    db.sync_all()?;
    std::fs::remove_file(&path)?;
    Ok(true)
}

fn corrupt_journal(_: DbError) -> DbError {
    DbError::CorruptJournal("truncated".into())
}
