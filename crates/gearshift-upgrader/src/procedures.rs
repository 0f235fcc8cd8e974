use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use gearshift_core::CartridgeManifest;

use crate::env::load_gear_env;
use crate::fs_utils::{remove_file_if_exists, remove_path_if_exists};
use crate::guards::GearUnlock;
use crate::node::{NodeServices, ShellCommand};
use crate::progress::UpgradeProgress;
use crate::GearLayout;

/// In-place upgrade of one cartridge instance directory.
pub struct CartridgeUpgrade<'a> {
    pub node: NodeServices<'a>,
    pub layout: &'a GearLayout,
    pub run_as_gear_user: bool,
}

impl CartridgeUpgrade<'_> {
    /// Overlay, drop rendered templates, then secure and run the upgrade
    /// script with the gear unlocked.
    pub fn compatible_upgrade(
        &self,
        progress: &mut UpgradeProgress,
        current_cartridge_version: &str,
        next: &CartridgeManifest,
        target: &Path,
    ) -> Result<()> {
        self.node.repository.overlay(next, target)?;

        for path in self.node.container.processed_templates(next) {
            remove_file_if_exists(&path)
                .with_context(|| format!("failed to remove template {}", path.display()))?;
        }
        progress.log(format!("Removed processed templates for {}", next.name))?;

        let _unlocked = GearUnlock::acquire(self.node.cartridges, next)?;
        self.secure(next, target)?;
        self.run_upgrade_script(progress, target, current_cartridge_version, next)
    }

    /// Full reinitialization: clear what setup regenerates, overlay, then
    /// setup, templates, endpoints and frontend as separate steps.
    pub fn incompatible_upgrade(
        &self,
        progress: &mut UpgradeProgress,
        current_cartridge_version: &str,
        next: &CartridgeManifest,
        version: &str,
        target: &Path,
    ) -> Result<()> {
        for path in self.node.container.setup_rewritten(next) {
            remove_path_if_exists(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }

        self.node.repository.overlay(next, target)?;

        let name = &next.name;
        {
            let _unlocked = GearUnlock::acquire(self.node.cartridges, next)?;
            self.secure(next, target)?;
            self.run_upgrade_script(progress, target, current_cartridge_version, next)?;

            progress.step(&format!("{name}_setup"), |progress, context| {
                let output = self.node.cartridges.setup(next, version)?;
                progress.log_with(format!("Executed setup for {name}"), [("stdout", output.as_str())])?;
                context.insert("cartridge", name.to_lowercase());
                context.insert("stdout", output);
                Ok(())
            })?;

            progress.step(&format!("{name}_templates"), |_, context| {
                context.insert("cartridge", name.to_lowercase());
                let output = self.node.cartridges.process_templates(next)?;
                if !output.is_empty() {
                    context.insert("stdout", output);
                }
                Ok(())
            })?;
        }

        progress.step(&format!("{name}_create_endpoints"), |_, context| {
            context.insert("cartridge", name.to_lowercase());
            self.node.cartridges.create_private_endpoints(next)
        })?;

        progress.step(&format!("{name}_connect_frontend"), |_, context| {
            context.insert("cartridge", name.to_lowercase());
            self.node.cartridges.connect_frontend(next)
        })
    }

    /// Runs `<cartridge>/bin/upgrade <version> <from> <to>`. A non-zero exit
    /// is recorded on the step but does not fail it.
    pub fn run_upgrade_script(
        &self,
        progress: &mut UpgradeProgress,
        target: &Path,
        current_cartridge_version: &str,
        next: &CartridgeManifest,
    ) -> Result<()> {
        let name = next.short_name.to_lowercase();

        progress.step(&format!("upgrade_script_{name}"), |progress, context| {
            let script = target.join("bin").join("upgrade");
            if !script.is_file() {
                return progress.log(format!("No upgrade script exists for {name}; skipping"));
            }
            if !is_executable(&script)? {
                return progress.log(format!(
                    "Upgrade script for {name} is not executable; skipping"
                ));
            }

            let mut command = ShellCommand::new(&script).args([
                next.version.clone(),
                current_cartridge_version.to_string(),
                next.cartridge_version.to_string(),
            ]);
            command.env = load_gear_env(self.layout)?;
            command.clear_env = true;
            command.cwd = Some(target.to_path_buf());
            if self.run_as_gear_user {
                command.uid = Some(self.node.container.uid()?);
                command.gid = Some(self.node.container.gid()?);
            }

            let output = self.node.shell.run(&command)?;
            progress.log_with(
                format!("Ran upgrade script for {name}"),
                [
                    ("rc", serde_json::Value::from(output.rc)),
                    ("stdout", output.stdout.clone().into()),
                    ("stderr", output.stderr.clone().into()),
                ],
            )?;

            context.insert("cartridge", name.clone());
            context.insert("rc", output.rc);
            context.insert("stdout", output.stdout);
            context.insert("stderr", output.stderr);
            if output.rc != 0 {
                context.error(format!(
                    "Upgrade script for {name} returned a non-zero exit code ({})",
                    output.rc
                ));
            }
            Ok(())
        })
    }

    fn secure(&self, next: &CartridgeManifest, target: &Path) -> Result<()> {
        let uid = self.node.container.uid()?;
        let gid = self.node.container.gid()?;
        self.node
            .cartridges
            .secure_cartridge(&next.short_name, uid, gid, target)
            .with_context(|| format!("failed to secure {}", target.display()))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let metadata =
        fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    Ok(metadata.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> Result<bool> {
    fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    Ok(true)
}
