//! # segmented
//!
//! why: the durable raft log; appends are synced before they are acknowledged
//! relations: implements raft_core::RaftLog on top of segment.rs files
//! what: SegmentedRaftLog (recovery, append + rotation, truncate, skip, prune, cursors)

mod segment;

use parking_lot::RwLock;
use raft_core::log::{check_monotonic_terms, cursor_start_error};
use raft_core::{
    EntryCursor, LogEntry, LogIndex, RaftError, RaftLog, RaftLogConfig, ReadableRaftLog, Result,
    Term, NO_INDEX,
};
use segment::{encode_record, parse_file_name, read_record, sync_dir, Segment, SegmentHeader, HEADER_LEN};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

struct State {
    dir: PathBuf,
    /// ordered by sequence; never empty, the last one takes appends
    segments: Vec<Segment>,
    writer: File,
    rotate_at_bytes: u64,
    /// sequence for the next new file; never handed out twice by one open log,
    /// so a cursor's cached handle can't alias a recreated file
    next_seq: u64,
    /// set once a write or sync failed part way; the file tail is unknown
    poisoned: bool,
}

impl State {
    fn current(&self) -> &Segment {
        &self.segments[self.segments.len() - 1]
    }

    fn current_mut(&mut self) -> &mut Segment {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    fn prev_index(&self) -> LogIndex {
        self.segments[0].header.prev_index
    }

    fn prev_term(&self) -> Term {
        self.segments[0].header.prev_term
    }

    fn append_index(&self) -> LogIndex {
        self.current().last_index()
    }

    fn not_found(&self, index: LogIndex) -> RaftError {
        RaftError::index_not_found(index, self.prev_index(), self.append_index())
    }

    fn locate(&self, index: LogIndex) -> Result<(&Segment, u64, Term)> {
        self.segments
            .iter()
            .rev()
            .find_map(|segment| {
                segment
                    .record(index)
                    .map(|(offset, term)| (segment, offset, term))
            })
            .ok_or_else(|| self.not_found(index))
    }

    fn term(&self, index: LogIndex) -> Result<Term> {
        if index == self.prev_index() {
            return Ok(self.prev_term());
        }
        self.locate(index).map(|(_, _, term)| term)
    }

    fn last_term(&self) -> Term {
        self.segments
            .iter()
            .rev()
            .find(|segment| !segment.records.is_empty())
            .map(Segment::last_term)
            .unwrap_or_else(|| self.prev_term())
    }

    fn start_segment(&mut self, header: SegmentHeader) -> io::Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let segment = Segment::create(&self.dir, seq, header)?;
        self.writer = segment.open_append()?;
        self.segments.push(segment);
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.poisoned {
            return Err(RaftError::durability(io::Error::new(
                io::ErrorKind::Other,
                "log stopped after an earlier write failure",
            )));
        }
        Ok(())
    }

    /// a failed write leaves the file tail unknown, so no further writes are taken
    fn poison(&mut self, err: io::Error) -> RaftError {
        error!(
            segment = self.current().seq,
            error = %err,
            "log write failed, refusing further writes"
        );
        self.poisoned = true;
        RaftError::durability(err)
    }

    fn rotate(&mut self) -> Result<()> {
        let header = SegmentHeader {
            prev_index: self.append_index(),
            prev_term: self.last_term(),
        };
        let closed = self.current().seq;
        self.start_segment(header).map_err(RaftError::durability)?;
        info!(
            closed_segment = closed,
            new_segment = self.current().seq,
            prev_index = header.prev_index,
            "rotated log segment"
        );
        Ok(())
    }
}

/// Durable log stored as a sequence of `raft.log.<seq>` files.
///
/// Each file starts with the index and term of the entry before its first
/// record, so the log can begin anywhere and prefixes are dropped a whole
/// file at a time.
pub struct SegmentedRaftLog {
    state: RwLock<State>,
}

impl SegmentedRaftLog {
    /// open or create the log in `dir`, repairing a torn tail
    pub fn open(dir: impl AsRef<Path>, config: &RaftLogConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segments = recover_segments(&dir)?;
        if segments.is_empty() {
            let seq = next_free_seq(&dir)?;
            let header = SegmentHeader {
                prev_index: NO_INDEX,
                prev_term: 0,
            };
            segments.push(Segment::create(&dir, seq, header).map_err(RaftError::durability)?);
        }
        let writer = segments[segments.len() - 1].open_append()?;
        let next_seq = segments[segments.len() - 1].seq + 1;

        let state = State {
            dir,
            segments,
            writer,
            rotate_at_bytes: config.rotate_at_bytes,
            next_seq,
            poisoned: false,
        };
        info!(
            dir = %state.dir.display(),
            segments = state.segments.len(),
            prev_index = state.prev_index(),
            append_index = state.append_index(),
            "segmented raft log opened"
        );
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// number of segment files currently backing the log
    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    pub fn dir(&self) -> PathBuf {
        self.state.read().dir.clone()
    }
}

fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(seq) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_file_name)
        {
            segments.push((seq, path));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

fn next_free_seq(dir: &Path) -> Result<u64> {
    Ok(list_segments(dir)?
        .last()
        .map(|(seq, _)| seq + 1)
        .unwrap_or(0))
}

fn recover_segments(dir: &Path) -> Result<Vec<Segment>> {
    let files = list_segments(dir)?;
    let last_seq = files.last().map(|(seq, _)| *seq);
    let mut segments: Vec<Segment> = Vec::with_capacity(files.len());

    for (seq, path) in files {
        let is_last = Some(seq) == last_seq;
        let bytes = fs::read(&path)?;

        if (bytes.len() as u64) < HEADER_LEN {
            if !is_last {
                return Err(RaftError::CorruptRecord(format!(
                    "{}: incomplete segment header",
                    path.display()
                )));
            }
            warn!(segment = seq, "removing segment with incomplete header");
            fs::remove_file(&path).map_err(RaftError::durability)?;
            sync_dir(dir).map_err(RaftError::durability)?;
            continue;
        }

        let (segment, torn) = Segment::from_bytes(seq, path, &bytes)?;
        if let Some(reason) = torn {
            if !is_last {
                return Err(RaftError::CorruptRecord(format!(
                    "{}: {}",
                    segment.path.display(),
                    reason
                )));
            }
            warn!(
                segment = seq,
                reason = %reason,
                valid_len = segment.len,
                file_len = bytes.len(),
                "truncating torn tail"
            );
            let file = segment.open_append().map_err(RaftError::durability)?;
            file.set_len(segment.len).map_err(RaftError::durability)?;
            file.sync_all().map_err(RaftError::durability)?;
        }

        if let Some(previous) = segments.last() {
            if segment.header.prev_index != previous.last_index() {
                info!(
                    segment = seq,
                    prev_index = segment.header.prev_index,
                    previous_last_index = previous.last_index(),
                    "log skipped forward, dropping earlier segments"
                );
                for stale in segments.drain(..) {
                    stale.remove().map_err(RaftError::durability)?;
                }
                sync_dir(dir).map_err(RaftError::durability)?;
            }
        }
        debug!(
            segment = seq,
            prev_index = segment.header.prev_index,
            entries = segment.records.len(),
            "recovered segment"
        );
        segments.push(segment);
    }
    Ok(segments)
}

impl ReadableRaftLog for SegmentedRaftLog {
    fn append_index(&self) -> LogIndex {
        self.state.read().append_index()
    }

    fn prev_index(&self) -> LogIndex {
        self.state.read().prev_index()
    }

    fn prev_term(&self) -> Term {
        self.state.read().prev_term()
    }

    fn read_entry_term(&self, index: LogIndex) -> Result<Term> {
        self.state.read().term(index)
    }

    fn read_entry(&self, index: LogIndex) -> Result<LogEntry> {
        let state = self.state.read();
        let (segment, offset, _) = state.locate(index)?;
        let mut file = open_for_read(&state, segment, index)?;
        read_record(&mut file, offset)
    }

    fn get_entry_cursor(&self, from_index: LogIndex) -> EntryCursor<'_> {
        let (prev_index, end) = {
            let state = self.state.read();
            (state.prev_index(), state.append_index())
        };
        if let Some(err) = cursor_start_error(from_index, prev_index, end) {
            return Box::new(std::iter::once(Err(err)));
        }
        Box::new(SegmentCursor {
            log: self,
            next: from_index,
            end,
            handle: None,
        })
    }
}

fn open_for_read(state: &State, segment: &Segment, index: LogIndex) -> Result<File> {
    segment.open_read().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => state.not_found(index),
        _ => RaftError::Io(e),
    })
}

/// Walks entries up to the append index seen at creation, keeping one read
/// handle open per segment it is in.
struct SegmentCursor<'a> {
    log: &'a SegmentedRaftLog,
    next: LogIndex,
    end: LogIndex,
    handle: Option<(u64, File)>,
}

impl SegmentCursor<'_> {
    fn read(&mut self, index: LogIndex) -> Result<LogEntry> {
        let state = self.log.state.read();
        let (segment, offset, _) = state.locate(index)?;
        let cached = matches!(&self.handle, Some((seq, _)) if *seq == segment.seq);
        if !cached {
            self.handle = Some((segment.seq, open_for_read(&state, segment, index)?));
        }
        match self.handle.as_mut() {
            Some((_, file)) => read_record(file, offset),
            None => Err(state.not_found(index)),
        }
    }
}

impl Iterator for SegmentCursor<'_> {
    type Item = Result<(LogIndex, LogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.end {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.read(index).map(|entry| (index, entry)))
    }
}

impl RaftLog for SegmentedRaftLog {
    fn append(&self, entries: &[LogEntry]) -> Result<LogIndex> {
        let mut state = self.state.write();
        state.ensure_writable()?;
        check_monotonic_terms(state.last_term(), entries)?;
        if entries.is_empty() {
            return Ok(state.append_index());
        }

        let base = state.current().len;
        let mut buf = Vec::new();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push((base + buf.len() as u64, entry.term));
            encode_record(entry, &mut buf)?;
        }
        let written = state
            .writer
            .write_all(&buf)
            .and_then(|()| state.writer.sync_data());
        if let Err(err) = written {
            // best effort: drop whatever part of the batch reached the file
            let _ = state.writer.set_len(base);
            return Err(state.poison(err));
        }

        let current = state.current_mut();
        current.records.extend(records);
        current.len += buf.len() as u64;

        if state.current().len >= state.rotate_at_bytes {
            state.rotate()?;
        }
        Ok(state.append_index())
    }

    fn truncate(&self, from_index: LogIndex) -> Result<()> {
        let mut state = self.state.write();
        state.ensure_writable()?;
        if from_index <= state.prev_index() {
            return Err(state.not_found(from_index));
        }
        if from_index > state.append_index() {
            return Ok(());
        }

        // whole segments starting at or after from_index, newest first
        let mut removed = 0;
        while state.segments.len() > 1 && state.current().header.prev_index >= from_index - 1 {
            if let Some(segment) = state.segments.pop() {
                segment.remove().map_err(RaftError::durability)?;
                removed += 1;
            }
        }
        if removed > 0 {
            sync_dir(&state.dir).map_err(RaftError::durability)?;
            state.writer = state.current().open_append()?;
        }

        let current = state.current_mut();
        let keep = (from_index - 1 - current.header.prev_index) as usize;
        let new_len = current
            .records
            .get(keep)
            .map(|(offset, _)| *offset)
            .unwrap_or(current.len);
        current.records.truncate(keep);
        current.len = new_len;
        let cut = state
            .writer
            .set_len(new_len)
            .and_then(|()| state.writer.sync_all());
        if let Err(err) = cut {
            return Err(state.poison(err));
        }

        info!(
            from_index,
            removed_segments = removed,
            append_index = state.append_index(),
            "log truncated"
        );
        Ok(())
    }

    fn skip(&self, index: LogIndex, term: Term) -> Result<LogIndex> {
        let mut state = self.state.write();
        state.ensure_writable()?;
        if index <= state.append_index() {
            return Ok(state.append_index());
        }

        state
            .start_segment(SegmentHeader {
                prev_index: index,
                prev_term: term,
            })
            .map_err(RaftError::durability)?;
        let older = state.segments.len() - 1;
        for segment in state.segments.drain(..older) {
            segment.remove().map_err(RaftError::durability)?;
        }
        sync_dir(&state.dir).map_err(RaftError::durability)?;

        info!(index, term, "log skipped");
        Ok(state.append_index())
    }

    fn prune(&self, safe_index: LogIndex) -> Result<LogIndex> {
        let mut state = self.state.write();
        let mut removed = 0;
        while state.segments.len() > 1 && state.segments[1].header.prev_index <= safe_index {
            let segment = state.segments.remove(0);
            segment.remove().map_err(RaftError::durability)?;
            removed += 1;
        }
        if removed > 0 {
            sync_dir(&state.dir).map_err(RaftError::durability)?;
            info!(
                safe_index,
                removed_segments = removed,
                prev_index = state.prev_index(),
                "log pruned"
            );
        }
        Ok(state.prev_index())
    }
}
