use path_absolutize::Absolutize;
use std::path::{Path, PathBuf};

use crate::error::{DatalinkError, DatalinkResult, IoResultExt};

/// Longest token identifier accepted; token ids become file names.
pub const MAX_TOKEN_ID_LEN: usize = 255;

/// Prefix reserved for in-flight temporary files inside the token directory.
pub const TEMP_PREFIX: char = '.';

/// Normalize a host path to an absolute path without resolving symlinks.
pub fn normalize_abs_path(p: &Path) -> DatalinkResult<PathBuf> {
    let abs = p
        .absolutize()
        .io_context(|| format!("could not absolutize path \"{}\"", p.display()))?;
    Ok(abs.to_path_buf())
}

/// Resolve the path an external file reference points at.
/// Relative paths are taken under `base`; the result must stay inside `base`.
pub fn resolve_target(base: &Path, target: &Path) -> DatalinkResult<PathBuf> {
    if target.as_os_str().is_empty() {
        return Err(DatalinkError::InvalidArgument("external file path is empty".into()));
    }
    let base_abs = normalize_abs_path(base)?;
    let joined = if target.is_absolute() { target.to_path_buf() } else { base_abs.join(target) };
    let cand = normalize_abs_path(&joined)?;
    if !is_prefix_path(&cand, &base_abs) || cand == base_abs {
        return Err(DatalinkError::InvalidArgument(format!(
            "external file \"{}\" is outside the base directory \"{}\"",
            cand.display(),
            base_abs.display()
        )));
    }
    Ok(cand)
}

fn is_prefix_path(path: &Path, prefix: &Path) -> bool {
    // Compare component-wise to avoid false positives like /data/x vs /data2
    if cfg!(windows) {
        let pr = path.components().next();
        let rr = prefix.components().next();
        if pr != rr { return false; }
    }
    path.starts_with(prefix)
}

/// Check a caller-supplied token identifier before it is used as a file name.
pub fn validate_token_id(token_id: &str) -> DatalinkResult<()> {
    if token_id.is_empty() {
        return Err(DatalinkError::InvalidArgument("token identifier is empty".into()));
    }
    if token_id.len() > MAX_TOKEN_ID_LEN {
        return Err(DatalinkError::InvalidArgument(format!(
            "token identifier is longer than {} bytes",
            MAX_TOKEN_ID_LEN
        )));
    }
    if token_id.starts_with(TEMP_PREFIX) {
        return Err(DatalinkError::InvalidArgument(format!("token identifier \"{}\" starts with '.'", token_id)));
    }
    if token_id.chars().any(|c| c == '/' || c == '\\' || c == '\0') {
        return Err(DatalinkError::InvalidArgument(format!(
            "token identifier \"{}\" contains a path separator or NUL",
            token_id.escape_default()
        )));
    }
    Ok(())
}

#[inline]
pub fn token_file(token_dir: &Path, token_id: &str) -> PathBuf { token_dir.join(token_id) }

/// Temporary name used while a record is being written, unique per attempt.
/// It does not embed the token id, so any valid id leaves room for it.
#[inline]
pub fn token_temp_file(token_dir: &Path) -> PathBuf {
    token_dir.join(format!("{}{}.tmp", TEMP_PREFIX, uuid::Uuid::new_v4().simple()))
}

#[inline]
pub fn is_temp_name(name: &str) -> bool { name.starts_with(TEMP_PREFIX) }

#[cfg(test)]
#[path = "paths_tests.rs"]
mod paths_tests;
