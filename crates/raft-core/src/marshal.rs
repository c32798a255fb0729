//! # marshal
//!
//! why: one symmetric binary encoding shared by the segment files and the wire
//! relations: used by raft-storage segments, message.rs frames, id store records
//! what: Marshal trait, impls for content kinds, LogEntry and AppendEntriesRequest

use crate::content::{ContentKind, MemberId, MemberSet, ReplicatedContent, ReplicatedIdAllocationRequest};
use crate::error::{RaftError, Result};
use crate::id_alloc::IdType;
use crate::log::LogEntry;
use crate::message::AppendEntriesRequest;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use uuid::Uuid;

/// Symmetric encode/decode of a value over byte streams
pub trait Marshal: Sized {
    fn marshal<W: Write>(&self, out: &mut W) -> Result<()>;

    fn unmarshal<R: Read>(input: &mut R) -> Result<Self>;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.marshal(&mut buf)?;
        Ok(buf)
    }

    /// decode one frame that must fill `bytes` exactly
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut input = Cursor::new(bytes);
        let value = Self::unmarshal(&mut input)?;
        let used = input.position() as usize;
        if used != bytes.len() {
            return Err(RaftError::CorruptRecord(format!(
                "{} trailing bytes after frame",
                bytes.len() - used
            )));
        }
        Ok(value)
    }
}

/// running out of bytes mid-frame means the frame is torn, not an io failure
pub(crate) fn read_error(err: io::Error) -> RaftError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        RaftError::CorruptRecord("frame ended early".into())
    } else {
        RaftError::Io(err)
    }
}

fn write_len<W: Write>(out: &mut W, len: usize, what: &str) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| RaftError::CorruptRecord(format!("{} of {} too large for a frame", what, len)))?;
    out.write_u32::<LittleEndian>(len)?;
    Ok(())
}

fn write_bytes<W: Write>(out: &mut W, bytes: &[u8]) -> Result<()> {
    write_len(out, bytes.len(), "payload length")?;
    out.write_all(bytes)?;
    Ok(())
}

fn read_bytes<R: Read>(input: &mut R) -> Result<Vec<u8>> {
    let len = input.read_u32::<LittleEndian>().map_err(read_error)? as usize;
    // take() keeps a garbage length from allocating before we hit the end
    let mut buf = Vec::new();
    (&mut *input).take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(RaftError::CorruptRecord(format!(
            "expected {} payload bytes, found {}",
            len,
            buf.len()
        )));
    }
    Ok(buf)
}

impl Marshal for MemberId {
    fn marshal<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(self.uuid().as_bytes())?;
        Ok(())
    }

    fn unmarshal<R: Read>(input: &mut R) -> Result<Self> {
        let mut raw = [0u8; 16];
        input.read_exact(&mut raw).map_err(read_error)?;
        Ok(MemberId::new(Uuid::from_bytes(raw)))
    }
}

impl Marshal for MemberSet {
    fn marshal<W: Write>(&self, out: &mut W) -> Result<()> {
        write_len(out, self.len(), "member count")?;
        for member in self.members() {
            member.marshal(out)?;
        }
        Ok(())
    }

    fn unmarshal<R: Read>(input: &mut R) -> Result<Self> {
        let count = input.read_u32::<LittleEndian>().map_err(read_error)?;
        let mut members = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            members.push(MemberId::unmarshal(input)?);
        }
        Ok(MemberSet::new(members))
    }
}

impl Marshal for ReplicatedIdAllocationRequest {
    fn marshal<W: Write>(&self, out: &mut W) -> Result<()> {
        self.owner.marshal(out)?;
        out.write_u32::<LittleEndian>(self.id_type.tag())?;
        out.write_u64::<LittleEndian>(self.range_start)?;
        out.write_u64::<LittleEndian>(self.range_length)?;
        Ok(())
    }

    fn unmarshal<R: Read>(input: &mut R) -> Result<Self> {
        let owner = MemberId::unmarshal(input)?;
        let id_type = IdType::from_tag(input.read_u32::<LittleEndian>().map_err(read_error)?)?;
        let range_start = input.read_u64::<LittleEndian>().map_err(read_error)?;
        let range_length = input.read_u64::<LittleEndian>().map_err(read_error)?;
        Ok(Self::new(owner, id_type, range_start, range_length))
    }
}

impl Marshal for ReplicatedContent {
    fn marshal<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_u8(self.kind() as u8)?;
        match self {
            ReplicatedContent::NewLeaderBarrier => Ok(()),
            ReplicatedContent::MemberSet(set) => set.marshal(out),
            ReplicatedContent::IdAllocation(request) => request.marshal(out),
            ReplicatedContent::Transaction(payload) => write_bytes(out, payload),
        }
    }

    fn unmarshal<R: Read>(input: &mut R) -> Result<Self> {
        let tag = input.read_u8().map_err(read_error)?;
        let kind = ContentKind::try_from(tag).map_err(RaftError::UnknownContentType)?;
        Ok(match kind {
            ContentKind::NewLeaderBarrier => ReplicatedContent::NewLeaderBarrier,
            ContentKind::MemberSet => ReplicatedContent::MemberSet(MemberSet::unmarshal(input)?),
            ContentKind::IdAllocation => {
                ReplicatedContent::IdAllocation(ReplicatedIdAllocationRequest::unmarshal(input)?)
            }
            ContentKind::Transaction => ReplicatedContent::Transaction(read_bytes(input)?),
        })
    }
}

impl Marshal for LogEntry {
    fn marshal<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_u64::<LittleEndian>(self.term)?;
        self.content.marshal(out)
    }

    fn unmarshal<R: Read>(input: &mut R) -> Result<Self> {
        let term = input.read_u64::<LittleEndian>().map_err(read_error)?;
        let content = ReplicatedContent::unmarshal(input)?;
        Ok(LogEntry::new(term, content))
    }
}

impl Marshal for AppendEntriesRequest {
    fn marshal<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_u64::<LittleEndian>(self.leader_term)?;
        out.write_i64::<LittleEndian>(self.prev_log_index)?;
        out.write_u64::<LittleEndian>(self.prev_log_term)?;
        out.write_i64::<LittleEndian>(self.leader_commit)?;
        write_len(out, self.entries.len(), "entry count")?;
        for entry in &self.entries {
            entry.marshal(out)?;
        }
        Ok(())
    }

    fn unmarshal<R: Read>(input: &mut R) -> Result<Self> {
        let leader_term = input.read_u64::<LittleEndian>().map_err(read_error)?;
        let prev_log_index = input.read_i64::<LittleEndian>().map_err(read_error)?;
        let prev_log_term = input.read_u64::<LittleEndian>().map_err(read_error)?;
        let leader_commit = input.read_i64::<LittleEndian>().map_err(read_error)?;
        let count = input.read_u32::<LittleEndian>().map_err(read_error)?;
        let mut entries = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            entries.push(LogEntry::unmarshal(input)?);
        }
        Ok(AppendEntriesRequest {
            leader_term,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        })
    }
}
