use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};

use crate::backend::Token;
use crate::error::{EngineError, Result};

const MAGIC: &[u8; 4] = b"RSES";
const VERSION: u32 = 1;
const ZSTD_LEVEL: i32 = 3;

/// `magic | version | n_tokens | tokens | state_len | sha256(state) | zstd(state)`
pub(super) fn encode_session(tokens: &[Token], state: &[u8]) -> Result<Vec<u8>> {
    let compressed = zstd::encode_all(state, ZSTD_LEVEL)?;
    let digest = Sha256::digest(state);

    let mut out = Vec::with_capacity(56 + tokens.len() * 4 + compressed.len());
    out.write_all(MAGIC)?;
    out.write_u32::<LittleEndian>(VERSION)?;
    out.write_u32::<LittleEndian>(tokens.len() as u32)?;
    for &t in tokens {
        out.write_u32::<LittleEndian>(t)?;
    }
    out.write_u64::<LittleEndian>(compressed.len() as u64)?;
    out.write_all(digest.as_slice())?;
    out.write_all(&compressed)?;
    Ok(out)
}

pub(super) fn decode_session(bytes: &[u8], max_tokens: usize) -> Result<(Vec<Token>, Vec<u8>)> {
    let corrupt = |what: &str| EngineError::SessionLoad(what.to_string());
    let mut rdr = Cursor::new(bytes);

    let mut magic = [0u8; 4];
    rdr.read_exact(&mut magic).map_err(|_| corrupt("truncated header"))?;
    if &magic != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = rdr.read_u32::<LittleEndian>().map_err(|_| corrupt("truncated header"))?;
    if version != VERSION {
        return Err(EngineError::SessionLoad(format!("unsupported version {}", version)));
    }

    let n_tokens = rdr.read_u32::<LittleEndian>().map_err(|_| corrupt("truncated header"))? as usize;
    if n_tokens > max_tokens {
        return Err(EngineError::SessionLoad(format!(
            "token count {} exceeds context {}",
            n_tokens, max_tokens
        )));
    }
    let mut tokens = Vec::with_capacity(n_tokens);
    for _ in 0..n_tokens {
        tokens.push(rdr.read_u32::<LittleEndian>().map_err(|_| corrupt("truncated token list"))?);
    }

    let state_len = rdr.read_u64::<LittleEndian>().map_err(|_| corrupt("truncated state header"))? as usize;
    let mut digest = [0u8; 32];
    rdr.read_exact(&mut digest).map_err(|_| corrupt("truncated digest"))?;

    let start = rdr.position() as usize;
    let compressed = bytes
        .get(start..)
        .filter(|rest| rest.len() == state_len)
        .ok_or_else(|| corrupt("state length mismatch"))?;
    let state = zstd::decode_all(compressed)
        .map_err(|e| EngineError::SessionLoad(format!("state decompression failed: {}", e)))?;
    if Sha256::digest(&state).as_slice() != digest {
        return Err(corrupt("state digest mismatch"));
    }

    Ok((tokens, state))
}

/// Writes through a sibling temp file, fsyncs, then renames over `final_path`
/// so a reader never sees a half-written session.
pub(super) fn persist_session_file(final_path: &Path, payload: &[u8]) -> Result<()> {
    let base_dir = final_path
        .parent()
        .ok_or_else(|| EngineError::InvalidCachePath(format!("{} has no parent", final_path.display())))?;
    fs::create_dir_all(base_dir)?;

    let mut tmp_name = final_path
        .file_name()
        .ok_or_else(|| EngineError::InvalidCachePath(format!("{} has no file name", final_path.display())))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path: PathBuf = base_dir.join(tmp_name);

    // A previous call may have died between create and rename.
    if tmp_path.exists() {
        fs::remove_file(&tmp_path)?;
    }

    let mut tmp_file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)?;

    if let Err(e) = tmp_file.write_all(payload) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    if let Err(e) = tmp_file.sync_all() {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    drop(tmp_file);

    if let Err(e) = fs::rename(&tmp_path, final_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    Ok(())
}
