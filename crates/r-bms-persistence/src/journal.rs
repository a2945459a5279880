//! ---
//! bms_section: "03-persistence-logging"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Persistence abstractions and storage bindings."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{PersistenceError, Result};

/// Journal format version written into every header.
pub const JOURNAL_VERSION: u16 = 1;

/// First line of every journal file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalHeader {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
}

impl JournalHeader {
    fn new() -> Self {
        let created_at = Utc::now();
        Self {
            version: JOURNAL_VERSION,
            created_at,
            hash: header_digest(created_at),
        }
    }

    fn verify(&self, path: &Path) -> Result<()> {
        if self.hash != header_digest(self.created_at) {
            return Err(PersistenceError::HeaderMismatch(path.to_path_buf()));
        }
        Ok(())
    }
}

fn header_digest(created_at: DateTime<Utc>) -> String {
    hex::encode(Sha256::digest(created_at.to_rfc3339().as_bytes()))
}

/// One ledger mutation as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Sequential identifier assigned when appending.
    pub sequence: u64,
    /// Time of the recorded mutation.
    pub timestamp: DateTime<Utc>,
    /// Mutation payload.
    pub payload: serde_json::Value,
}

impl JournalEntry {
    /// Construct an entry; the sequence is assigned on append.
    pub fn new(timestamp: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            sequence: 0,
            timestamp,
            payload,
        }
    }
}

/// Append-only journal writer.
pub struct JournalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
}

impl std::fmt::Debug for JournalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalWriter")
            .field("path", &self.path)
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}

impl JournalWriter {
    /// Open a journal for appending, writing a header if the file is new.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let exists = path.exists();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        if !exists || is_empty(path)? {
            write_header(&mut writer)?;
            return Ok(Self {
                path: path.to_path_buf(),
                writer,
                next_sequence: 0,
            });
        }

        let next_sequence = determine_last_sequence(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            next_sequence,
        })
    }

    /// Append an entry and return its assigned sequence number.
    pub fn append(&mut self, mut entry: JournalEntry) -> Result<u64> {
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        let line = serde_json::to_string(&entry)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(entry.sequence)
    }

    /// Drop all entries and start over with a fresh header.
    pub fn reset(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;
        // Reopen in append mode so later writes never seek back over the header.
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.next_sequence = 0;
        Ok(())
    }

    /// Location of the journal on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_header(writer: &mut BufWriter<File>) -> Result<()> {
    let line = serde_json::to_string(&JournalHeader::new())?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn is_empty(path: &Path) -> Result<bool> {
    Ok(fs::metadata(path)?.len() == 0)
}

fn determine_last_sequence(path: &Path) -> Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut last_seq = 0u64;
    for line in reader.lines().skip(1) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<JournalEntry>(&line) {
            last_seq = entry.sequence;
        }
    }
    Ok(last_seq)
}

fn read_header(reader: &mut BufReader<File>, path: &Path) -> Result<()> {
    let mut first_line = String::new();
    reader.read_line(&mut first_line)?;
    let header: JournalHeader = serde_json::from_str(first_line.trim()).map_err(|source| {
        PersistenceError::Corrupt {
            path: path.to_path_buf(),
            source,
        }
    })?;
    header.verify(path)
}

/// Replay the journal in order, invoking the callback for each entry.
///
/// A torn final line (crash mid-append) ends the replay instead of failing it.
pub fn replay<F>(path: &Path, mut handler: F) -> Result<usize>
where
    F: FnMut(JournalEntry) -> Result<()>,
{
    let mut count = 0usize;
    let mut lines = JournalReader::open(path)?.peekable();
    while let Some(next) = lines.next() {
        let entry = match next {
            Ok(entry) => entry,
            Err(PersistenceError::Json(_)) if lines.peek().is_none() => {
                tracing::warn!(path = %path.display(), "ignoring torn journal tail");
                break;
            }
            Err(err) => return Err(err),
        };
        handler(entry)?;
        count += 1;
    }
    Ok(count)
}

/// Streaming iterator over journal entries.
pub struct JournalReader {
    lines: std::io::Lines<BufReader<File>>,
}

impl JournalReader {
    /// Open the journal for sequential reading after validating its header.
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        read_header(&mut reader, path)?;
        Ok(Self {
            lines: reader.lines(),
        })
    }
}

impl Iterator for JournalReader {
    type Item = Result<JournalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    return Some(serde_json::from_str(&line).map_err(PersistenceError::from))
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}
