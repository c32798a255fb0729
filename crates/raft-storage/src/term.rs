//! # term
//!
//! why: the highest seen term must survive restarts or a member could vote twice
//! relations: implements raft_core::TermStore, used by RaftNode
//! what: FileTermStore (json, atomic replace), InMemoryTermStore

use raft_core::{RaftError, Result, Term, TermStore};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const TERM_FILE: &str = "term.json";
const TERM_TEMP_FILE: &str = "term.tmp";

#[derive(Serialize, Deserialize, Default)]
struct TermState {
    term: Term,
}

/// term store backed by a small json file in the log directory
pub struct FileTermStore {
    dir: PathBuf,
}

impl FileTermStore {
    /// creates the directory if it doesn't exist
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn term_path(&self) -> PathBuf {
        self.dir.join(TERM_FILE)
    }
}

impl TermStore for FileTermStore {
    fn load_term(&self) -> Result<Term> {
        let path = self.term_path();
        if !path.exists() {
            return Ok(0); // fresh member
        }
        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;
        let state: TermState = serde_json::from_str(&contents)
            .map_err(|e| RaftError::CorruptRecord(format!("{}: {}", path.display(), e)))?;
        Ok(state.term)
    }

    fn save_term(&mut self, term: Term) -> Result<()> {
        let json = serde_json::to_string_pretty(&TermState { term })
            .map_err(|e| RaftError::CorruptRecord(e.to_string()))?;

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join(TERM_TEMP_FILE);
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, self.term_path())?;
            File::open(&self.dir)?.sync_all()
        };
        write().map_err(RaftError::durability)
    }
}

/// term store for tests; forgets everything on drop
#[derive(Debug, Default)]
pub struct InMemoryTermStore {
    term: Term,
}

impl InMemoryTermStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TermStore for InMemoryTermStore {
    fn load_term(&self) -> Result<Term> {
        Ok(self.term)
    }

    fn save_term(&mut self, term: Term) -> Result<()> {
        self.term = term;
        Ok(())
    }
}
