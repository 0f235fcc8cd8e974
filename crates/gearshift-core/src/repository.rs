use std::path::Path;

use anyhow::Result;

use crate::CartridgeManifest;

/// Source of target cartridge manifests and their payloads.
pub trait CartridgeRepository {
    /// Latest manifest for cartridge `name` that supports `version`.
    fn select(&self, name: &str, version: &str) -> Result<Option<CartridgeManifest>>;

    /// Merges the manifest's payload onto an existing instance directory.
    /// Files the payload does not ship are left in place.
    fn overlay(&self, manifest: &CartridgeManifest, target: &Path) -> Result<()>;
}
