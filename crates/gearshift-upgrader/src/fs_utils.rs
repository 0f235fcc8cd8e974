use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

pub fn remove_path_if_exists(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Replaces `path` through a sibling temp file so readers never observe a
/// partially written file. A replaced file keeps its mode and owner.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path has no parent directory: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{file_name}.tmp-{}", std::process::id()));

    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to flush {}", tmp_path.display()))?;
    drop(file);

    if let Err(err) = inherit_metadata(path, &tmp_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("failed to replace {}", path.display()));
    }
    Ok(())
}

fn inherit_metadata(existing: &Path, replacement: &Path) -> Result<()> {
    let metadata = match fs::metadata(existing) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", existing.display()));
        }
    };
    fs::set_permissions(replacement, metadata.permissions())
        .with_context(|| format!("failed to set permissions on {}", replacement.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        let current = fs::metadata(replacement)
            .with_context(|| format!("failed to stat {}", replacement.display()))?;
        if current.uid() != metadata.uid() || current.gid() != metadata.gid() {
            std::os::unix::fs::chown(replacement, Some(metadata.uid()), Some(metadata.gid()))
                .with_context(|| format!("failed to chown {}", replacement.display()))?;
        }
    }
    Ok(())
}

pub fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
