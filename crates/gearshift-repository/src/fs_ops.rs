use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Copies every entry under `source_root` onto `destination_root`, replacing
/// files that exist in both trees and leaving destination-only files alone.
/// Top-level names listed in `skip` are not copied.
pub fn overlay_dir(source_root: &Path, destination_root: &Path, skip: &[&str]) -> Result<()> {
    if !source_root.is_dir() {
        anyhow::bail!(
            "overlay source is not a directory: {}",
            source_root.display()
        );
    }

    fs::create_dir_all(destination_root).with_context(|| {
        format!(
            "failed creating overlay destination {}",
            destination_root.display()
        )
    })?;

    let mut queue: VecDeque<(PathBuf, PathBuf)> = VecDeque::new();
    queue.push_back((source_root.to_path_buf(), destination_root.to_path_buf()));

    while let Some((from_dir, to_dir)) = queue.pop_front() {
        let top_level = from_dir == source_root;
        for entry in fs::read_dir(&from_dir)
            .with_context(|| format!("failed reading overlay directory {}", from_dir.display()))?
        {
            let entry = entry?;
            if top_level
                && skip
                    .iter()
                    .any(|name| entry.file_name().to_string_lossy() == *name)
            {
                continue;
            }

            let from_path = entry.path();
            let to_path = to_dir.join(entry.file_name());
            let metadata = fs::symlink_metadata(&from_path)
                .with_context(|| format!("failed to stat {}", from_path.display()))?;

            if metadata.is_dir() {
                fs::create_dir_all(&to_path)
                    .with_context(|| format!("failed creating directory {}", to_path.display()))?;
                queue.push_back((from_path, to_path));
                continue;
            }

            #[cfg(unix)]
            if metadata.file_type().is_symlink() {
                let target = fs::read_link(&from_path)
                    .with_context(|| format!("failed to read symlink {}", from_path.display()))?;
                if fs::symlink_metadata(&to_path).is_ok() {
                    fs::remove_file(&to_path).with_context(|| {
                        format!("failed replacing existing entry {}", to_path.display())
                    })?;
                }
                std::os::unix::fs::symlink(&target, &to_path).with_context(|| {
                    format!(
                        "failed to create symlink {} -> {}",
                        to_path.display(),
                        target.display()
                    )
                })?;
                continue;
            }

            if metadata.is_file() {
                fs::copy(&from_path, &to_path).with_context(|| {
                    format!(
                        "failed copying file from {} to {}",
                        from_path.display(),
                        to_path.display()
                    )
                })?;
            }
        }
    }

    Ok(())
}
