use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gearshift_core::{CartridgeManifest, CartridgeRepository};

use crate::fs_ops::overlay_dir;

const METADATA_DIR: &str = "metadata";
const MANIFEST_FILE: &str = "manifest.toml";

/// File-backed cartridge repository laid out as
/// `<root>/<name>/<cartridge_version>/{metadata/manifest.toml, ...payload}`.
#[derive(Debug, Clone)]
pub struct CartridgeIndex {
    root: PathBuf,
}

impl CartridgeIndex {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// All manifests published for `name`, newest cartridge version first.
    pub fn cartridge_versions(&self, name: &str) -> Result<Vec<CartridgeManifest>> {
        let cartridge_dir = self.root.join(name);
        if !cartridge_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut manifests = Vec::new();
        for entry in fs::read_dir(&cartridge_dir)
            .with_context(|| format!("failed to read cartridge directory: {name}"))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let path = entry.path().join(METADATA_DIR).join(MANIFEST_FILE);
            if !path.is_file() {
                log::debug!("ignoring repository entry without manifest: {}", path.display());
                continue;
            }

            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed reading manifest: {}", path.display()))?;
            let manifest = CartridgeManifest::from_toml_str(&content)
                .with_context(|| format!("failed parsing manifest: {}", path.display()))?;
            if manifest.name != name {
                anyhow::bail!(
                    "manifest {} declares cartridge '{}' but is stored under '{}'",
                    path.display(),
                    manifest.name,
                    name
                );
            }
            manifests.push(manifest);
        }

        manifests.sort_by(|a, b| b.cartridge_version.cmp(&a.cartridge_version));
        Ok(manifests)
    }

    pub fn payload_dir(&self, manifest: &CartridgeManifest) -> PathBuf {
        self.root
            .join(&manifest.name)
            .join(manifest.cartridge_version.to_string())
    }
}

impl CartridgeRepository for CartridgeIndex {
    fn select(&self, name: &str, version: &str) -> Result<Option<CartridgeManifest>> {
        Ok(self
            .cartridge_versions(name)?
            .into_iter()
            .find(|manifest| manifest.supports_version(version)))
    }

    fn overlay(&self, manifest: &CartridgeManifest, target: &Path) -> Result<()> {
        let payload = self.payload_dir(manifest);
        overlay_dir(&payload, target, &[METADATA_DIR]).with_context(|| {
            format!(
                "failed to overlay {} {} onto {}",
                manifest.name,
                manifest.cartridge_version,
                target.display()
            )
        })
    }
}
