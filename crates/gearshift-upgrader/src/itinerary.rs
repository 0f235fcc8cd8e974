use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use gearshift_core::{
    cartridge_key, CartridgeIdent, CartridgeRepository, Itinerary, UpgradeType,
};

use crate::fs_utils::{remove_file_if_exists, write_atomic};
use crate::node::CartridgeModel;
use crate::progress::UpgradeProgress;
use crate::GearLayout;

pub const COMPUTE_ITINERARY_STEP: &str = "compute_itinerary";

pub fn read_itinerary(layout: &GearLayout) -> Result<Option<Itinerary>> {
    let path = layout.itinerary_path();
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read itinerary: {}", path.display()));
        }
    };
    let itinerary = serde_json::from_slice(&raw)
        .with_context(|| format!("failed parsing itinerary: {}", path.display()))?;
    Ok(Some(itinerary))
}

pub fn write_itinerary(layout: &GearLayout, itinerary: &Itinerary) -> Result<()> {
    let payload =
        serde_json::to_vec_pretty(itinerary).context("failed to serialize itinerary")?;
    write_atomic(&layout.itinerary_path(), &payload)
}

pub fn remove_itinerary(layout: &GearLayout) -> Result<()> {
    let path = layout.itinerary_path();
    remove_file_if_exists(&path)
        .with_context(|| format!("failed to remove itinerary: {}", path.display()))
}

/// First `env/OPENSHIFT_*_IDENT` file of a cartridge instance, by name.
pub fn find_ident_path(cartridge_dir: &Path) -> Result<Option<PathBuf>> {
    let env_dir = cartridge_dir.join("env");
    let entries = match fs::read_dir(&env_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read {}", env_dir.display()));
        }
    };

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("OPENSHIFT_") && name.ends_with("_IDENT") && entry.file_type()?.is_file()
        {
            candidates.push(entry.path());
        }
    }
    candidates.sort();
    Ok(candidates.into_iter().next())
}

pub fn read_ident(ident_path: &Path) -> Result<CartridgeIdent> {
    let raw = fs::read_to_string(ident_path)
        .with_context(|| format!("failed to read ident: {}", ident_path.display()))?;
    CartridgeIdent::parse(&raw)
        .with_context(|| format!("failed to parse ident: {}", ident_path.display()))
}

pub struct ItineraryPlanner<'a> {
    pub layout: &'a GearLayout,
    pub cartridges: &'a dyn CartridgeModel,
    pub repository: &'a dyn CartridgeRepository,
    pub supported_vendors: &'a [String],
    pub ignore_cartridge_version: bool,
}

impl ItineraryPlanner<'_> {
    /// Plans once inside the `compute_itinerary` step and always answers with
    /// the persisted copy, so a resumed run follows the original plan.
    pub fn compute(&self, progress: &mut UpgradeProgress) -> Result<Itinerary> {
        progress.step(COMPUTE_ITINERARY_STEP, |progress, context| {
            let itinerary = self.plan(progress)?;
            context.insert("entries", itinerary.entries.len());
            write_itinerary(self.layout, &itinerary)
        })?;

        read_itinerary(self.layout)?.ok_or_else(|| {
            anyhow!(
                "itinerary missing after planning: {}",
                self.layout.itinerary_path().display()
            )
        })
    }

    fn plan(&self, progress: &mut UpgradeProgress) -> Result<Itinerary> {
        let mut itinerary = Itinerary::default();

        for manifest in self.cartridges.installed_cartridges()? {
            let cartridge_dir = self.layout.cartridge_dir(&manifest);
            if !cartridge_dir.is_dir() {
                progress.log(format!(
                    "Skipping upgrade for {}: cartridge manifest does not match gear layout: {} is not a directory",
                    manifest.name,
                    cartridge_dir.display()
                ))?;
                continue;
            }

            let Some(ident_path) = find_ident_path(&cartridge_dir)? else {
                progress.log(format!(
                    "Skipping upgrade for {}: no ident marker under {}",
                    manifest.name,
                    cartridge_dir.join("env").display()
                ))?;
                continue;
            };
            let ident = match read_ident(&ident_path) {
                Ok(ident) => ident,
                Err(err) => {
                    progress.log(format!("Skipping upgrade for {}: {err:#}", manifest.name))?;
                    continue;
                }
            };

            if !self
                .supported_vendors
                .iter()
                .any(|vendor| vendor == &ident.vendor)
            {
                progress.log(format!(
                    "No upgrade available for cartridge {ident}, {} not supported.",
                    ident.vendor
                ))?;
                continue;
            }

            let Some(next_manifest) = self.repository.select(&ident.name, &ident.version)? else {
                progress.log(format!(
                    "No upgrade available for cartridge {ident}, cartridge not found in repository."
                ))?;
                continue;
            };

            if !next_manifest.supports_version(&ident.version) {
                progress.log(format!(
                    "No upgrade available for cartridge {ident}, version {} not in {:?}",
                    ident.version, next_manifest.versions
                ))?;
                continue;
            }

            if next_manifest.is_latest(&ident.cartridge_version) {
                if self.ignore_cartridge_version {
                    progress.log(format!(
                        "Refreshing cartridge {ident}, ignoring cartridge version."
                    ))?;
                } else {
                    progress.log(format!(
                        "No upgrade required for cartridge {ident}, already at latest version {}.",
                        ident.cartridge_version
                    ))?;
                    continue;
                }
            }

            let upgrade_type = if next_manifest.is_compatible_with(&ident.cartridge_version) {
                UpgradeType::Compatible
            } else {
                UpgradeType::Incompatible
            };

            progress.log(format!(
                "Creating itinerary entry for {} upgrade of {ident}",
                upgrade_type.as_str()
            ))?;
            itinerary.create_entry(cartridge_key(&ident.name, &ident.version), upgrade_type);
        }

        Ok(itinerary)
    }
}
