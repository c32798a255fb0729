//! # config
//!
//! why: every tunable is handed to constructors explicitly, never read from globals
//! relations: consumed by raft-storage backends, node.rs pruning, id allocation
//! what: RaftLogConfig, IdAllocationConfig, ReplicationConfig (json loadable)

use crate::error::{RaftError, Result};
use serde::{Deserialize, Serialize};

/// Settings for the log backends and pruning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftLogConfig {
    /// a segment is rotated once its file reaches this many bytes
    pub rotate_at_bytes: u64,
    /// number of live entries kept by the bounded in-memory log
    pub in_memory_capacity: usize,
    /// entries kept below the applied index when pruning
    pub prune_safety_margin: u64,
}

impl Default for RaftLogConfig {
    fn default() -> Self {
        Self {
            rotate_at_bytes: 64 * 1024 * 1024, // 64MB
            in_memory_capacity: 1024,
            prune_safety_margin: 1000,
        }
    }
}

/// Settings for the id allocator state machine and its store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdAllocationConfig {
    /// records written to one store file before switching to the other
    pub records_per_file: usize,
    /// ids requested per allocation round trip
    pub default_range_length: u64,
    pub max_acquire_attempts: u32,
}

impl Default for IdAllocationConfig {
    fn default() -> Self {
        Self {
            records_per_file: 1024,
            default_range_length: 1024,
            max_acquire_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub log: RaftLogConfig,
    pub id_allocation: IdAllocationConfig,
}

impl ReplicationConfig {
    /// parse and validate a json document; missing fields take defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ReplicationConfig =
            serde_json::from_str(json).map_err(|e| RaftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log.rotate_at_bytes == 0 {
            return Err(RaftError::Config("log.rotate_at_bytes must be positive".into()));
        }
        if self.log.in_memory_capacity == 0 {
            return Err(RaftError::Config("log.in_memory_capacity must be positive".into()));
        }
        if self.id_allocation.records_per_file == 0 {
            return Err(RaftError::Config(
                "id_allocation.records_per_file must be positive".into(),
            ));
        }
        if self.id_allocation.default_range_length == 0 {
            return Err(RaftError::Config(
                "id_allocation.default_range_length must be positive".into(),
            ));
        }
        if self.id_allocation.max_acquire_attempts == 0 {
            return Err(RaftError::Config(
                "id_allocation.max_acquire_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}
