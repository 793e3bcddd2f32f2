//! On-disk layout per §6: one append-only log of newline-delimited
//! canonical-JSON commit records per repository path, plus a
//! `repo-state.json` sidecar holding the latest durable head per key and
//! a rolling checksum of the log prefix.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::commit::Commit;
use crate::error::Result;

const LOG_FILE: &str = "commits.ndjson";
const STATE_FILE: &str = "repo-state.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RepoState {
    heads: BTreeMap<String, String>,
    checksum: u64,
}

pub struct Storage {
    path: PathBuf,
    log_file: File,
    state: RepoState,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Storage> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path.join(LOG_FILE))?;
        let state = Self::load_state(&path)?;
        Ok(Storage { path, log_file, state })
    }

    fn load_state(path: &Path) -> Result<RepoState> {
        let state_path = path.join(STATE_FILE);
        if !state_path.exists() {
            return Ok(RepoState::default());
        }
        let bytes = fs::read(&state_path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save_state(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        fs::write(self.path.join(STATE_FILE), bytes)?;
        Ok(())
    }

    /// Scans the full log in file order. Used on `Repository::open` to
    /// rebuild in-memory indices.
    pub fn load_all(&self) -> Result<Vec<Commit>> {
        let log_path = self.path.join(LOG_FILE);
        if !log_path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&log_path)?);
        let mut commits = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            commits.push(Commit::from_log_bytes(line.as_bytes())?);
        }
        Ok(commits)
    }

    /// Appends one commit record and updates the sidecar's rolling
    /// checksum and per-key durable head.
    pub fn append(&mut self, commit: &Commit) -> Result<()> {
        let bytes = commit.to_log_bytes()?;
        self.log_file.write_all(&bytes)?;
        self.log_file.write_all(b"\n")?;
        self.log_file.flush()?;
        self.state.checksum = roll_checksum(self.state.checksum, &bytes);
        self.state.heads.insert(commit.key.clone(), commit.id.clone());
        self.save_state()
    }

    pub fn durable_head(&self, key: &str) -> Option<&str> {
        self.state.heads.get(key).map(String::as_str)
    }

    /// Re-scans the log and compares its checksum against the sidecar's,
    /// for corruption detection on open.
    pub fn verify_checksum(&self) -> Result<bool> {
        let mut checksum = 0u64;
        for commit in self.load_all()? {
            checksum = roll_checksum(checksum, &commit.to_log_bytes()?);
        }
        Ok(checksum == self.state.checksum)
    }
}

fn roll_checksum(prior: u64, bytes: &[u8]) -> u64 {
    let hash = blake3::hash(bytes);
    let chunk = u64::from_le_bytes(hash.as_bytes()[0..8].try_into().unwrap());
    prior.rotate_left(1) ^ chunk
}
