use anyhow::{Context, Result};
use gearshift_core::CartridgeManifest;
use std::fs;
use std::path::{Path, PathBuf};

pub const PREUPGRADE_STATE: &str = ".preupgrade_state";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GearLayout {
    gear_home: PathBuf,
}

impl GearLayout {
    pub fn new(gear_home: impl Into<PathBuf>) -> Self {
        Self {
            gear_home: gear_home.into(),
        }
    }

    pub fn for_gear(gear_base_dir: &Path, uuid: &str) -> Self {
        Self::new(gear_base_dir.join(uuid))
    }

    pub fn gear_home(&self) -> &Path {
        &self.gear_home
    }

    pub fn env_dir(&self) -> PathBuf {
        self.gear_home.join(".env")
    }

    pub fn user_env_dir(&self) -> PathBuf {
        self.env_dir().join("user_vars")
    }

    pub fn app_root_dir(&self) -> PathBuf {
        self.gear_home.join("app-root")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.app_root_dir().join("runtime")
    }

    pub fn state_path(&self) -> PathBuf {
        self.runtime_dir().join(".state")
    }

    pub fn preupgrade_state_path(&self) -> PathBuf {
        self.runtime_dir().join(PREUPGRADE_STATE)
    }

    pub fn itinerary_path(&self) -> PathBuf {
        self.runtime_dir().join(".upgrade_itinerary.json")
    }

    pub fn progress_path(&self) -> PathBuf {
        self.runtime_dir().join(".upgrade_progress.json")
    }

    pub fn cartridge_dir(&self, manifest: &CartridgeManifest) -> PathBuf {
        manifest.instance_dir(&self.gear_home)
    }

    /// True only for a real directory; a symlinked gear home is rejected.
    pub fn is_real_gear_dir(&self) -> bool {
        fs::symlink_metadata(&self.gear_home)
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false)
    }

    /// Creates `app-root/runtime` when missing. Returns whether it was created.
    pub fn ensure_runtime_dir(&self) -> Result<bool> {
        let dir = self.runtime_dir();
        if dir.is_dir() {
            return Ok(false);
        }

        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o750))
                .with_context(|| format!("failed to set permissions on {}", dir.display()))?;
        }
        Ok(true)
    }
}
