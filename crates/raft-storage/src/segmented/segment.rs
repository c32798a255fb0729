//! # segment
//!
//! why: one file of the durable log; knows its own layout and nothing about its neighbours
//! relations: owned and sequenced by segmented/mod.rs
//! what: SegmentHeader, Segment (record offsets + terms), record encode/scan/read

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use raft_core::{LogEntry, LogIndex, Marshal, RaftError, ReplicatedContent, Result, Term};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const FILE_PREFIX: &str = "raft.log.";

/// prev_index i64 + prev_term u64
pub(crate) const HEADER_LEN: u64 = 16;

/// term u64 + length u32 + crc32 u32
const RECORD_HEADER_LEN: u64 = 16;

pub(crate) fn file_name(seq: u64) -> String {
    format!("{}{}", FILE_PREFIX, seq)
}

pub(crate) fn parse_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(FILE_PREFIX)?.parse().ok()
}

/// Entry boundary a segment continues from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentHeader {
    pub prev_index: LogIndex,
    pub prev_term: Term,
}

impl SegmentHeader {
    fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_i64::<LittleEndian>(self.prev_index)?;
        out.write_u64::<LittleEndian>(self.prev_term)
    }

    fn read_from<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            prev_index: input.read_i64::<LittleEndian>()?,
            prev_term: input.read_u64::<LittleEndian>()?,
        })
    }
}

/// append one framed record for `entry` to `buf`
pub(crate) fn encode_record(entry: &LogEntry, buf: &mut Vec<u8>) -> Result<()> {
    let payload = entry.content.to_bytes()?;
    let len = u32::try_from(payload.len())
        .map_err(|_| RaftError::CorruptRecord(format!("entry of {} bytes too large", payload.len())))?;
    buf.write_u64::<LittleEndian>(entry.term)?;
    buf.write_u32::<LittleEndian>(len)?;
    buf.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Outcome of scanning a segment's records after the header
pub(crate) struct Scan {
    pub records: Vec<(u64, Term)>,
    /// end of the last intact record
    pub valid_len: u64,
    /// why scanning stopped early, if it did
    pub torn: Option<String>,
}

pub(crate) fn scan_records(bytes: &[u8]) -> Scan {
    let mut records = Vec::new();
    let mut offset = HEADER_LEN;
    let total = bytes.len() as u64;
    let torn = loop {
        let remaining = total.saturating_sub(offset);
        if remaining == 0 {
            break None;
        }
        if remaining < RECORD_HEADER_LEN {
            break Some(format!("short record header at offset {}", offset));
        }
        let header = &bytes[offset as usize..(offset + RECORD_HEADER_LEN) as usize];
        let term = LittleEndian::read_u64(&header[0..8]);
        let len = LittleEndian::read_u32(&header[8..12]) as u64;
        let crc = LittleEndian::read_u32(&header[12..16]);
        if remaining - RECORD_HEADER_LEN < len {
            break Some(format!("short payload at offset {}", offset));
        }
        let start = (offset + RECORD_HEADER_LEN) as usize;
        let payload = &bytes[start..start + len as usize];
        if crc32fast::hash(payload) != crc {
            break Some(format!("checksum mismatch at offset {}", offset));
        }
        records.push((offset, term));
        offset += RECORD_HEADER_LEN + len;
    };
    Scan {
        records,
        valid_len: offset,
        torn,
    }
}

/// read and verify the record at `offset`
pub(crate) fn read_record(file: &mut File, offset: u64) -> Result<LogEntry> {
    file.seek(SeekFrom::Start(offset))?;
    let term = file.read_u64::<LittleEndian>().map_err(short_read)?;
    let len = file.read_u32::<LittleEndian>().map_err(short_read)?;
    let crc = file.read_u32::<LittleEndian>().map_err(short_read)?;
    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload).map_err(short_read)?;
    if crc32fast::hash(&payload) != crc {
        return Err(RaftError::CorruptRecord(format!(
            "checksum mismatch at offset {}",
            offset
        )));
    }
    Ok(LogEntry::new(term, ReplicatedContent::from_bytes(&payload)?))
}

fn short_read(err: io::Error) -> RaftError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        RaftError::CorruptRecord("record ended early".into())
    } else {
        RaftError::Io(err)
    }
}

pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// In-memory index of one segment file
#[derive(Debug)]
pub(crate) struct Segment {
    pub seq: u64,
    pub path: PathBuf,
    pub header: SegmentHeader,
    /// file offset and term of each entry, in index order
    pub records: Vec<(u64, Term)>,
    /// bytes in the file that belong to the log
    pub len: u64,
}

impl Segment {
    /// write a new segment holding only its header, synced with its directory
    pub fn create(dir: &Path, seq: u64, header: SegmentHeader) -> io::Result<Self> {
        let path = dir.join(file_name(seq));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut buf = Vec::with_capacity(HEADER_LEN as usize);
        header.write_to(&mut buf)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        sync_dir(dir)?;
        Ok(Self {
            seq,
            path,
            header,
            records: Vec::new(),
            len: HEADER_LEN,
        })
    }

    /// rebuild from file contents; the caller decides what a torn scan means
    pub fn from_bytes(seq: u64, path: PathBuf, bytes: &[u8]) -> io::Result<(Self, Option<String>)> {
        let header = SegmentHeader::read_from(&mut Cursor::new(bytes))?;
        let Scan {
            records,
            valid_len,
            torn,
        } = scan_records(bytes);
        let segment = Self {
            seq,
            path,
            header,
            records,
            len: valid_len,
        };
        Ok((segment, torn))
    }

    pub fn open_append(&self) -> io::Result<File> {
        OpenOptions::new().append(true).open(&self.path)
    }

    pub fn open_read(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    pub fn remove(&self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }

    pub fn last_index(&self) -> LogIndex {
        self.header.prev_index + self.records.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.records
            .last()
            .map(|(_, term)| *term)
            .unwrap_or(self.header.prev_term)
    }

    pub fn contains(&self, index: LogIndex) -> bool {
        index > self.header.prev_index && index <= self.last_index()
    }

    /// offset and term of the entry at `index`, which must be contained
    pub fn record(&self, index: LogIndex) -> Option<(u64, Term)> {
        if !self.contains(index) {
            return None;
        }
        self.records
            .get((index - self.header.prev_index - 1) as usize)
            .copied()
    }
}
