//! Per-principal session caches: the token history fed to the model plus an
//! opaque snapshot of the context, so a later call can resume without
//! re-evaluating what is already in the cache.

mod store_io;

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{info, warn};

use crate::backend::{InferenceContext, Token};
use crate::error::{EngineError, Result};

const SESSIONS_DIR: &str = "sessions";

pub(crate) fn validate_principal(principal: &str) -> Result<()> {
    if principal.is_empty()
        || principal == "."
        || principal == ".."
        || principal.contains(['/', '\\'])
    {
        return Err(EngineError::InvalidCachePath(format!(
            "invalid principal '{}'",
            principal
        )));
    }
    Ok(())
}

/// `<cache_root>/<principal>/sessions/<name>`, leading slashes of `name`
/// stripped. Traversal and absolute components are rejected.
pub fn session_path(cache_root: &Path, principal: &str, name: &str) -> Result<PathBuf> {
    validate_principal(principal)?;

    let relative = Path::new(name.trim_start_matches('/'));
    if relative.as_os_str().is_empty() {
        return Err(EngineError::InvalidCachePath("empty cache name".to_string()));
    }
    for comp in relative.components() {
        if !matches!(comp, Component::Normal(_)) {
            return Err(EngineError::InvalidCachePath(format!(
                "Invalid cache name {:?}: traversal or absolute components are not allowed",
                name
            )));
        }
    }

    Ok(cache_root.join(principal).join(SESSIONS_DIR).join(relative))
}

/// Restores the context from `path` and returns the stored tokens.
///
/// A missing or empty file yields an empty history. An unreadable or corrupt
/// file is logged and also yields an empty history with a cleared context.
pub fn load_session<C: InferenceContext>(path: &Path, ctx: &mut C) -> Vec<Token> {
    info!(path = %path.display(), "attempting to load saved session");

    let bytes = match fs::read(path) {
        Ok(bytes) if bytes.is_empty() => {
            info!("session file is empty, a new session will be initialized");
            return Vec::new();
        }
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("session file does not exist, will create");
            return Vec::new();
        }
        Err(e) => {
            warn!(error = %e, "failed to read session file, starting fresh");
            return Vec::new();
        }
    };

    let restored = store_io::decode_session(&bytes, ctx.n_ctx()).and_then(|(tokens, state)| {
        ctx.state_restore(&state)?;
        Ok(tokens)
    });

    match restored {
        Ok(tokens) => {
            info!(n_tokens = tokens.len(), "loaded a session with prompt size");
            tokens
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to load session file, starting fresh");
            ctx.kv_clear();
            Vec::new()
        }
    }
}

pub fn save_session<C: InferenceContext>(path: &Path, tokens: &[Token], ctx: &C) -> Result<()> {
    let state = ctx.state_snapshot()?;
    let payload = store_io::encode_session(tokens, &state)?;
    store_io::persist_session_file(path, &payload)?;
    info!(path = %path.display(), n_tokens = tokens.len(), "saved session");
    Ok(())
}

/// Length of the longest common prefix, compared by token id.
pub fn match_prefix(session: &[Token], request: &[Token]) -> usize {
    session
        .iter()
        .zip(request)
        .take_while(|(a, b)| a == b)
        .count()
}

/// When the request is a strict prefix of the session, drop the session tail
/// and one more token so the last request token is evaluated again and its
/// logits are fresh. Returns whether the session was truncated.
pub fn reconcile(session: &mut Vec<Token>, request_len: usize, n_matching: usize) -> bool {
    if n_matching == request_len && session.len() > request_len {
        session.truncate(request_len.saturating_sub(1));
        return true;
    }
    false
}

/// Returns `false` when there was nothing to delete.
pub fn remove_session(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "deleted session cache");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub fn copy_session(from: &Path, to: &Path) -> Result<()> {
    if !from.is_file() {
        return Err(EngineError::InvalidCachePath(format!(
            "cache file {} not found",
            from.display()
        )));
    }
    let payload = fs::read(from)?;
    store_io::persist_session_file(to, &payload)
}

#[cfg(test)]
mod tests {
    use super::{
        copy_session, load_session, match_prefix, reconcile, remove_session, save_session,
        session_path,
    };
    use crate::backend::scripted::{ScriptedModel, BOS};
    use crate::backend::{ContextOptions, InferenceContext, LanguageModel};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn path_is_scoped_to_principal() {
        let root = Path::new(".canister_cache");
        let path = session_path(root, "2vxsx-fae", "/chat.cache").expect("scoped path");
        assert_eq!(path, PathBuf::from(".canister_cache/2vxsx-fae/sessions/chat.cache"));

        assert!(session_path(root, "2vxsx-fae", "../other/sessions/x").is_err());
        assert!(session_path(root, "2vxsx-fae", "").is_err());
        assert!(session_path(root, "2vxsx-fae", "///").is_err());
        assert!(session_path(root, "../evil", "x").is_err());
        assert!(session_path(root, "", "x").is_err());
    }

    #[test]
    fn prefix_match_is_by_token_id() {
        assert_eq!(match_prefix(&[1, 2, 3, 4], &[1, 2, 9]), 2);
        assert_eq!(match_prefix(&[], &[1, 2]), 0);
        assert_eq!(match_prefix(&[1, 2, 3], &[1, 2, 3]), 3);
        assert_eq!(match_prefix(&[1, 2, 3], &[1, 2, 3, 4, 5]), 3);
    }

    #[test]
    fn shorter_request_truncates_to_one_before_its_end() {
        let mut session = vec![1, 2, 3, 4, 5, 6];
        let request = [1, 2, 3, 4];
        let n = match_prefix(&session, &request);
        assert!(reconcile(&mut session, request.len(), n));
        assert_eq!(session, vec![1, 2, 3]);

        let mut equal = vec![1, 2, 3];
        assert!(!reconcile(&mut equal, 3, 3));
        assert_eq!(equal.len(), 3);

        let mut diverging = vec![1, 2, 7, 8];
        assert!(!reconcile(&mut diverging, 3, 2));
    }

    #[test]
    fn save_then_load_restores_tokens_and_state() {
        let base = mk_temp_dir("resumable_session");
        let path = base.join("p").join("sessions").join("chat.cache");
        let model = ScriptedModel::story();
        let opts = ContextOptions { n_ctx: 64, n_batch: 8 };

        let mut ctx = model.new_context(&opts).expect("context");
        let tokens = vec![BOS, 3, 4, 5];
        ctx.decode(&tokens, 0).expect("decode");
        save_session(&path, &tokens, &ctx).expect("save");

        let mut fresh = model.new_context(&opts).expect("context");
        assert_eq!(load_session(&path, &mut fresh), tokens);
        assert_eq!(fresh.cells().tokens_in_order(), tokens);
        assert!(fresh.logits().is_ok());

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn corrupt_or_missing_file_starts_fresh() {
        let base = mk_temp_dir("resumable_session_bad");
        fs::create_dir_all(&base).expect("create base");
        let model = ScriptedModel::story();
        let mut ctx = model
            .new_context(&ContextOptions { n_ctx: 64, n_batch: 8 })
            .expect("context");

        assert!(load_session(&base.join("absent.cache"), &mut ctx).is_empty());

        let empty = base.join("empty.cache");
        fs::write(&empty, b"").expect("write empty");
        assert!(load_session(&empty, &mut ctx).is_empty());

        let garbage = base.join("garbage.cache");
        fs::write(&garbage, b"not a session at all").expect("write garbage");
        ctx.decode(&[BOS, 3], 0).expect("decode");
        assert!(load_session(&garbage, &mut ctx).is_empty());
        assert!(ctx.cells().is_empty());

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn copy_and_remove() {
        let base = mk_temp_dir("resumable_session_copy");
        let src = base.join("sessions").join("a.cache");
        let dst = base.join("sessions").join("b.cache");

        assert!(copy_session(&src, &dst).is_err());
        let model = ScriptedModel::story();
        let ctx = model
            .new_context(&ContextOptions { n_ctx: 64, n_batch: 8 })
            .expect("context");
        save_session(&src, &[BOS], &ctx).expect("save");
        copy_session(&src, &dst).expect("copy");
        assert_eq!(fs::read(&src).expect("src"), fs::read(&dst).expect("dst"));

        assert!(remove_session(&dst).expect("remove"));
        assert!(!remove_session(&dst).expect("remove again"));

        let _ = fs::remove_dir_all(&base);
    }

    fn mk_temp_dir(prefix: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time ok")
            .as_nanos();
        std::env::temp_dir().join(format!("{}_{}_{}", prefix, std::process::id(), ts))
    }
}
