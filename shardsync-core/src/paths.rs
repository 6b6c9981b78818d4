use crate::{Result, SyncError};
use std::path::{Path, PathBuf};

/// Normalizes a remote path to `/a/b` form. The root is `/`.
pub fn normalize_remote_path(path: &str) -> Result<String> {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Ok("/".to_string());
    }

    let mut components = Vec::new();
    for component in trimmed.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(SyncError::InvalidRequest(format!(
                "invalid remote path component '{}' in {}",
                component, path
            )));
        }
        components.push(component);
    }

    Ok(format!("/{}", components.join("/")))
}

/// True when `path` equals `prefix` or lies below it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Maps a remote path onto the local mirror rooted at `local_root`.
pub fn local_path_for(local_root: &Path, remote_path: &str) -> PathBuf {
    let mut local = local_root.to_path_buf();
    for component in remote_path.split('/').filter(|c| !c.is_empty()) {
        local.push(component);
    }
    local
}

/// Maps a path relative to the local root onto its remote form.
pub fn remote_path_for(relative: &Path) -> String {
    let components: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    format!("/{}", components.join("/"))
}
