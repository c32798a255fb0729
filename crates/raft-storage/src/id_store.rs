//! # id_store
//!
//! why: the id allocator must never hand out a range twice across restarts
//! relations: implements raft_core::id_alloc::IdAllocationStore for the allocator state machine
//! what: DurableIdAllocationStore (two alternating record files), InMemoryIdAllocationStore

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use parking_lot::Mutex;
use raft_core::id_alloc::{IdAllocationState, IdAllocationStore, IdRange, IdType, IdTypeState};
use raft_core::{LogIndex, RaftError, Result, NO_INDEX};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// log_index i64, id_type u32, first_unallocated u64, owned_start u64,
/// owned_length u64, crc32 u32
const RECORD_LEN: usize = 40;
const CRC_OFFSET: usize = RECORD_LEN - 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

impl Side {
    fn file_name(self) -> &'static str {
        match self {
            Side::A => "id-allocation.a",
            Side::B => "id-allocation.b",
        }
    }

    fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Record {
    log_index: LogIndex,
    id_type: IdType,
    state: IdTypeState,
}

impl Record {
    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        let start = buf.len();
        let (owned_start, owned_length) = self
            .state
            .owned_range
            .map(|range| (range.start, range.length))
            .unwrap_or((0, 0));
        buf.write_i64::<LittleEndian>(self.log_index)?;
        buf.write_u32::<LittleEndian>(self.id_type.tag())?;
        buf.write_u64::<LittleEndian>(self.state.first_unallocated)?;
        buf.write_u64::<LittleEndian>(owned_start)?;
        buf.write_u64::<LittleEndian>(owned_length)?;
        let crc = crc32fast::hash(&buf[start..]);
        buf.write_u32::<LittleEndian>(crc)
    }

    /// None when the checksum does not match
    fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        let crc = LittleEndian::read_u32(&bytes[CRC_OFFSET..RECORD_LEN]);
        if crc32fast::hash(&bytes[..CRC_OFFSET]) != crc {
            return Ok(None);
        }
        let owned_start = LittleEndian::read_u64(&bytes[20..28]);
        let owned_length = LittleEndian::read_u64(&bytes[28..36]);
        Ok(Some(Self {
            log_index: LittleEndian::read_i64(&bytes[0..8]),
            id_type: IdType::from_tag(LittleEndian::read_u32(&bytes[8..12]))?,
            state: IdTypeState {
                first_unallocated: LittleEndian::read_u64(&bytes[12..20]),
                owned_range: (owned_length > 0).then(|| IdRange::new(owned_start, owned_length)),
            },
        }))
    }
}

/// Valid prefix of one store file
struct Replay {
    records: Vec<Record>,
    valid_len: u64,
    file_len: u64,
}

impl Replay {
    fn read(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for chunk in bytes.chunks_exact(RECORD_LEN) {
            match Record::decode(chunk)? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        Ok(Self {
            valid_len: (records.len() * RECORD_LEN) as u64,
            file_len: bytes.len() as u64,
            records,
        })
    }

    fn last_index(&self) -> LogIndex {
        self.records.last().map(|r| r.log_index).unwrap_or(NO_INDEX)
    }

    fn state(&self) -> IdAllocationState {
        let mut state = IdAllocationState::new();
        for record in &self.records {
            state.set_type_state(record.id_type, record.state);
            state.set_last_applied(record.log_index.max(state.last_applied()));
        }
        state
    }
}

/// Id allocation state kept in two files written alternately.
///
/// Each change appends one fixed-size record. When the active file holds
/// `records_per_file` records the store switches to the other file, empties
/// it and writes a full snapshot there first, so neither file grows without
/// bound and one of them is always complete.
pub struct DurableIdAllocationStore {
    dir: PathBuf,
    records_per_file: usize,
    active: Side,
    writer: File,
    written: usize,
    recovered: IdAllocationState,
}

impl DurableIdAllocationStore {
    pub fn open(dir: impl AsRef<Path>, records_per_file: usize) -> Result<Self> {
        if records_per_file == 0 {
            return Err(RaftError::Config("records_per_file must be positive".into()));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let a = Replay::read(&dir.join(Side::A.file_name()))?;
        let b = Replay::read(&dir.join(Side::B.file_name()))?;
        let (active, replay) = pick(a, b);

        let path = dir.join(active.file_name());
        let writer = OpenOptions::new().create(true).append(true).open(&path)?;
        if replay.valid_len < replay.file_len {
            warn!(
                file = active.file_name(),
                valid_len = replay.valid_len,
                file_len = replay.file_len,
                "dropping torn id allocation records"
            );
            writer.set_len(replay.valid_len).map_err(RaftError::durability)?;
            writer.sync_all().map_err(RaftError::durability)?;
        }

        let recovered = replay.state();
        info!(
            file = active.file_name(),
            records = replay.records.len(),
            last_applied = recovered.last_applied(),
            "id allocation store opened"
        );
        Ok(Self {
            dir,
            records_per_file,
            active,
            writer,
            written: replay.records.len(),
            recovered,
        })
    }

    fn switch_with_snapshot(&mut self, state: &IdAllocationState) -> Result<()> {
        let next = self.active.other();
        let path = self.dir.join(next.file_name());
        let mut writer = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(RaftError::durability)?;

        let mut buf = Vec::with_capacity(RECORD_LEN * IdType::ALL.len());
        let mut count = 0;
        for (id_type, type_state) in state.iter() {
            Record {
                log_index: state.last_applied(),
                id_type,
                state: type_state,
            }
            .encode(&mut buf)?;
            count += 1;
        }
        writer.write_all(&buf).map_err(RaftError::durability)?;
        writer.sync_all().map_err(RaftError::durability)?;

        debug!(file = next.file_name(), records = count, "id allocation store switched files");
        self.active = next;
        self.writer = writer;
        self.written = count;
        Ok(())
    }
}

/// Choose the file whose last record is newest. A newer file that knows fewer
/// id types than the other was cut off while its snapshot was written.
fn pick(a: Replay, b: Replay) -> (Side, Replay) {
    let types = |replay: &Replay| replay.state().iter().count();
    let (newer, older) = if b.last_index() > a.last_index() {
        ((Side::B, b), (Side::A, a))
    } else {
        ((Side::A, a), (Side::B, b))
    };
    if types(&newer.1) < types(&older.1) {
        older
    } else {
        newer
    }
}

impl IdAllocationStore for DurableIdAllocationStore {
    fn load(&mut self) -> Result<IdAllocationState> {
        Ok(self.recovered.clone())
    }

    fn persist(&mut self, state: &IdAllocationState, changed: IdType) -> Result<()> {
        if self.written >= self.records_per_file {
            return self.switch_with_snapshot(state);
        }
        let mut buf = Vec::with_capacity(RECORD_LEN);
        Record {
            log_index: state.last_applied(),
            id_type: changed,
            state: state.type_state(changed),
        }
        .encode(&mut buf)?;
        self.writer.write_all(&buf).map_err(RaftError::durability)?;
        self.writer.sync_data().map_err(RaftError::durability)?;
        self.written += 1;
        Ok(())
    }
}

/// Store for tests; clones share state so a "restart" can reload it
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdAllocationStore {
    state: Arc<Mutex<IdAllocationState>>,
}

impl InMemoryIdAllocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> IdAllocationState {
        self.state.lock().clone()
    }
}

impl IdAllocationStore for InMemoryIdAllocationStore {
    fn load(&mut self) -> Result<IdAllocationState> {
        Ok(self.state.lock().clone())
    }

    fn persist(&mut self, state: &IdAllocationState, _changed: IdType) -> Result<()> {
        *self.state.lock() = state.clone();
        Ok(())
    }
}
