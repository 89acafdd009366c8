use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Local;
use tracing::{debug, info};

use crate::backend::{Token, Vocabulary};
use crate::error::{EngineError, Result};
use crate::session::validate_principal;

const CHATS_DIR: &str = "db_chats";

/// Rendered split of `embd_inp` around `n_consumed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationView {
    pub consumed: String,
    pub remaining: String,
}

impl ConversationView {
    /// Control tokens are rendered so the remaining text can be resubmitted
    /// verbatim.
    pub fn partition<V: Vocabulary>(vocab: &V, embd_inp: &[Token], n_consumed: usize) -> Self {
        let split = n_consumed.min(embd_inp.len());
        let render = |tokens: &[Token]| {
            let bytes: Vec<u8> = tokens
                .iter()
                .flat_map(|&t| vocab.token_to_piece(t, true))
                .collect();
            String::from_utf8_lossy(&bytes).into_owned()
        };
        Self {
            consumed: render(&embd_inp[..split]),
            remaining: render(&embd_inp[split..]),
        }
    }
}

/// Per-principal log of past conversations under
/// `<cache_root>/<principal>/db_chats`, one timestamp-named file each.
#[derive(Debug, Clone)]
pub struct ChatLog {
    cache_root: PathBuf,
    max_chats: usize,
}

impl ChatLog {
    pub fn new(cache_root: impl Into<PathBuf>, max_chats: usize) -> Self {
        Self {
            cache_root: cache_root.into(),
            max_chats: max_chats.max(1),
        }
    }

    fn chats_dir(&self, principal: &str) -> Result<PathBuf> {
        validate_principal(principal)?;
        let dir = self.cache_root.join(principal).join(CHATS_DIR);
        fs::create_dir_all(&dir)
            .map_err(|e| EngineError::ChatLog(format!("cannot create {}: {}", dir.display(), e)))?;
        Ok(dir)
    }

    fn write_conversation(path: &Path, principal: &str, conversation: &str) -> Result<()> {
        fs::write(path, format!("{}\n{}", principal, conversation))
            .map_err(|e| EngineError::ChatLog(format!("Failed to write {}: {}", path.display(), e)))
    }

    /// Files sorted oldest first by last write, then by name.
    fn entries(&self, principal: &str) -> Result<Vec<PathBuf>> {
        let dir = self.chats_dir(principal)?;
        let read = fs::read_dir(&dir)
            .map_err(|e| EngineError::ChatLog(format!("Error reading directory {}: {}", dir.display(), e)))?;

        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in read {
            let entry = entry.map_err(|e| EngineError::ChatLog(e.to_string()))?;
            let meta = entry.metadata().map_err(|e| EngineError::ChatLog(e.to_string()))?;
            if meta.is_file() {
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                files.push((modified, entry.path()));
            }
        }
        files.sort();
        Ok(files.into_iter().map(|(_, p)| p).collect())
    }

    pub fn latest(&self, principal: &str) -> Result<Option<PathBuf>> {
        Ok(self.entries(principal)?.pop())
    }

    /// Starts an empty conversation file named after the local time.
    pub fn new_chat(&self, principal: &str) -> Result<PathBuf> {
        let dir = self.chats_dir(principal)?;
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

        let mut path = dir.join(&stamp);
        let mut n = 1;
        while path.exists() {
            path = dir.join(format!("{}_{}", stamp, n));
            n += 1;
        }

        Self::write_conversation(&path, principal, "")?;
        info!(path = %path.display(), "started new chat");
        Ok(path)
    }

    /// Keeps the most recently written `max_chats` files. Returns how many
    /// were deleted.
    pub fn clean(&self, principal: &str) -> Result<usize> {
        let files = self.entries(principal)?;
        if files.len() <= self.max_chats {
            return Ok(0);
        }
        let excess = files.len() - self.max_chats;
        for path in &files[..excess] {
            fs::remove_file(path).map_err(|e| {
                EngineError::ChatLog(format!("Error deleting file {}: {}", path.display(), e))
            })?;
            debug!(path = %path.display(), "deleted old chat");
        }
        Ok(excess)
    }

    /// Overwrites the most recent conversation file, creating one if needed.
    pub fn save_conversation(&self, principal: &str, conversation: &str) -> Result<PathBuf> {
        let path = match self.latest(principal)? {
            Some(path) => path,
            None => self.new_chat(principal)?,
        };
        Self::write_conversation(&path, principal, conversation)?;
        Ok(path)
    }
}
