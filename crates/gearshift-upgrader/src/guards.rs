use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gearshift_core::CartridgeManifest;

use crate::node::{CartridgeModel, PriorityBoost, QuotaControl};
use crate::progress::UpgradeProgress;

/// Keeps the gear unlocked for one cartridge; relocks when dropped.
pub struct GearUnlock<'a> {
    cartridges: &'a dyn CartridgeModel,
    manifest: &'a CartridgeManifest,
}

impl<'a> GearUnlock<'a> {
    pub fn acquire(
        cartridges: &'a dyn CartridgeModel,
        manifest: &'a CartridgeManifest,
    ) -> Result<Self> {
        cartridges
            .unlock_gear(manifest)
            .with_context(|| format!("failed to unlock gear for {}", manifest.name))?;
        Ok(Self {
            cartridges,
            manifest,
        })
    }
}

impl Drop for GearUnlock<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.cartridges.lock_gear(self.manifest) {
            log::warn!("failed to relock gear for {}: {err:#}", self.manifest.name);
        }
    }
}

pub struct PriorityBoostGuard<'a> {
    priority: &'a dyn PriorityBoost,
}

impl<'a> PriorityBoostGuard<'a> {
    pub fn acquire(priority: &'a dyn PriorityBoost) -> Result<Self> {
        priority.boost().context("failed to boost gear priority")?;
        Ok(Self { priority })
    }
}

impl Drop for PriorityBoostGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.priority.restore() {
            log::warn!("failed to restore gear priority: {err:#}");
        }
    }
}

/// Process working directory pinned to `dir` until dropped.
pub struct WorkingDirGuard {
    previous: Option<PathBuf>,
}

impl WorkingDirGuard {
    pub fn enter(dir: &Path) -> Result<Self> {
        // The previous directory may already be gone; then there is nothing to return to.
        let previous = env::current_dir().ok();
        env::set_current_dir(dir)
            .with_context(|| format!("failed to enter {}", dir.display()))?;
        Ok(Self { previous })
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        let Some(previous) = &self.previous else {
            return;
        };
        if let Err(err) = env::set_current_dir(previous) {
            log::warn!("failed to return to {}: {err}", previous.display());
        }
    }
}

/// Hard limits captured before relaxation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub hard_block_limit: u64,
    pub hard_inode_limit: u64,
}

/// Relaxed quota awaiting restore. `restore` reports through the progress
/// log; dropping without it still resets the limits.
pub struct RelaxedQuota<'a> {
    quota: &'a dyn QuotaControl,
    snapshot: Option<QuotaSnapshot>,
}

impl RelaxedQuota<'_> {
    pub fn snapshot(&self) -> Option<QuotaSnapshot> {
        self.snapshot
    }

    pub fn restore(mut self, progress: &mut UpgradeProgress) -> Result<()> {
        let Some(snapshot) = self.snapshot.take() else {
            return Ok(());
        };
        self.quota
            .set_quota(snapshot.hard_block_limit, snapshot.hard_inode_limit)
            .context("failed to reset quota")?;
        progress.log(format!(
            "Resetting quota blocks: {}  inodes: {}",
            snapshot.hard_block_limit, snapshot.hard_inode_limit
        ))
    }
}

impl Drop for RelaxedQuota<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            if let Err(err) = self
                .quota
                .set_quota(snapshot.hard_block_limit, snapshot.hard_inode_limit)
            {
                log::warn!("failed to reset quota: {err:#}");
            }
        }
    }
}

/// Doubles each hard limit whose usage is above half of it.
pub fn relax_quota<'a>(
    quota: &'a dyn QuotaControl,
    progress: &mut UpgradeProgress,
) -> Result<RelaxedQuota<'a>> {
    let usage = quota.get_quota().context("failed to read quota")?;
    let relax_blocks = usage.blocks_hard > 0 && usage.blocks_used * 2 > usage.blocks_hard;
    let relax_inodes = usage.inodes_hard > 0 && usage.inodes_used * 2 > usage.inodes_hard;

    if !relax_blocks && !relax_inodes {
        return Ok(RelaxedQuota {
            quota,
            snapshot: None,
        });
    }

    let blocks = if relax_blocks {
        usage.blocks_hard * 2
    } else {
        usage.blocks_hard
    };
    let inodes = if relax_inodes {
        usage.inodes_hard * 2
    } else {
        usage.inodes_hard
    };

    progress.log(format!("Relaxing quota to blocks={blocks}, inodes={inodes}"))?;
    quota
        .set_quota(blocks, inodes)
        .context("failed to relax quota")?;

    Ok(RelaxedQuota {
        quota,
        snapshot: Some(QuotaSnapshot {
            hard_block_limit: usage.blocks_hard,
            hard_inode_limit: usage.inodes_hard,
        }),
    })
}
