use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::ident::CartridgeIdent;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CartridgeManifest {
    pub name: String,
    #[serde(alias = "cartridge_vendor")]
    pub vendor: String,
    pub version: String,
    pub cartridge_version: Version,
    pub short_name: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub versions: BTreeSet<String>,
    #[serde(default)]
    pub compatible_versions: BTreeSet<String>,
    #[serde(default)]
    pub processed_templates: Vec<String>,
    #[serde(default)]
    pub setup_rewritten: Vec<String>,
}

impl CartridgeManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let mut manifest: Self =
            toml::from_str(input).context("failed to parse cartridge manifest")?;

        for (field, value) in [
            ("name", &manifest.name),
            ("vendor", &manifest.vendor),
            ("version", &manifest.version),
            ("short_name", &manifest.short_name),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("cartridge manifest field '{field}' must not be empty"));
            }
        }
        // Idents are dash-delimited, so only the name may carry dashes.
        if manifest.name.contains('/')
            || manifest.vendor.contains('-')
            || manifest.version.contains('-')
            || !manifest.cartridge_version.pre.is_empty()
        {
            return Err(anyhow!(
                "cartridge manifest '{}' has an invalid vendor, version or cartridge_version",
                manifest.name
            ));
        }

        if manifest.directory.trim().is_empty() {
            manifest.directory = manifest.short_name.to_ascii_lowercase();
        }
        validate_relative_path(&manifest.directory).with_context(|| {
            format!("invalid directory for cartridge '{}'", manifest.name)
        })?;

        if manifest.versions.iter().all(|value| value.trim().is_empty()) {
            return Err(anyhow!(
                "cartridge manifest '{}' must list at least one supported version",
                manifest.name
            ));
        }

        for path in manifest
            .processed_templates
            .iter()
            .chain(manifest.setup_rewritten.iter())
        {
            validate_relative_path(path).with_context(|| {
                format!("invalid template or setup path for cartridge '{}'", manifest.name)
            })?;
        }

        Ok(manifest)
    }

    pub fn cartridge_key(&self) -> String {
        crate::cartridge_key(&self.name, &self.version)
    }

    pub fn supports_version(&self, version: &str) -> bool {
        self.versions.contains(version)
    }

    pub fn is_compatible_with(&self, cartridge_version: &str) -> bool {
        self.compatible_versions.contains(cartridge_version)
    }

    pub fn is_latest(&self, cartridge_version: &str) -> bool {
        self.cartridge_version.to_string() == cartridge_version
    }

    pub fn ident(&self) -> CartridgeIdent {
        CartridgeIdent::new(
            &self.vendor,
            &self.name,
            &self.version,
            self.cartridge_version.to_string(),
        )
    }

    pub fn instance_dir(&self, gear_home: &Path) -> PathBuf {
        gear_home.join(&self.directory)
    }
}

fn validate_relative_path(value: &str) -> anyhow::Result<()> {
    let path = Path::new(value.trim_end_matches('/'));
    if value.trim().is_empty() || path.is_absolute() {
        return Err(anyhow!("path must be relative and non-empty: '{value}'"));
    }
    if path
        .components()
        .any(|component| matches!(component, std::path::Component::ParentDir))
    {
        return Err(anyhow!("path must not escape the cartridge directory: '{value}'"));
    }
    Ok(())
}
