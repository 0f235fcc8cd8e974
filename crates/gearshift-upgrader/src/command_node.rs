use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use gearshift_core::CartridgeManifest;

use crate::config::NodeCommands;
use crate::env::{load_gear_env, APP_UUID_VAR, PRIMARY_CARTRIDGE_DIR_VAR};
use crate::fault::ShellError;
use crate::node::{
    CartridgeModel, GearContainer, PriorityBoost, QuotaControl, QuotaUsage, ShellCommand,
    ShellOutput, ShellRunner,
};
use crate::GearLayout;

const MANIFEST_PATH: [&str; 2] = ["metadata", "manifest.toml"];

/// Node collaborators backed by operator-configured commands and each
/// cartridge's `bin/` scripts.
pub struct CommandNode<'a> {
    uuid: String,
    layout: GearLayout,
    commands: &'a NodeCommands,
    shell: &'a dyn ShellRunner,
    run_as_gear_user: bool,
}

impl<'a> CommandNode<'a> {
    pub fn new(
        uuid: impl Into<String>,
        layout: GearLayout,
        commands: &'a NodeCommands,
        shell: &'a dyn ShellRunner,
        run_as_gear_user: bool,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            layout,
            commands,
            shell,
            run_as_gear_user,
        }
    }

    fn vars(&self) -> Vec<(&'static str, String)> {
        vec![
            ("uuid", self.uuid.clone()),
            ("gear_home", self.layout.gear_home().display().to_string()),
        ]
    }

    fn cartridge_vars(&self, manifest: &CartridgeManifest) -> Vec<(&'static str, String)> {
        let mut vars = self.vars();
        vars.push(("cartridge", manifest.name.clone()));
        vars.push(("short_name", manifest.short_name.clone()));
        vars.push((
            "path",
            self.layout.cartridge_dir(manifest).display().to_string(),
        ));
        vars
    }

    /// Runs a configured template. `None` means the operation is not
    /// configured on this node.
    fn run_template(
        &self,
        template: &Option<Vec<String>>,
        vars: &[(&str, String)],
    ) -> Result<Option<ShellOutput>> {
        let Some(template) = template else {
            return Ok(None);
        };
        let command = expand_template(template, vars)?;
        self.run_checked(&command).map(Some)
    }

    fn run_checked(&self, command: &ShellCommand) -> Result<ShellOutput> {
        let output = self.shell.run(command)?;
        if !output.success() {
            return Err(ShellError {
                message: format!("'{}' exited with {}", command.display(), output.rc),
                rc: output.rc,
                stdout: output.stdout,
                stderr: output.stderr,
            }
            .into());
        }
        Ok(output)
    }

    /// Runs `<cartridge>/bin/<script>` in the gear's environment.
    fn cartridge_script(
        &self,
        manifest: &CartridgeManifest,
        script: &str,
        args: &[&str],
    ) -> Result<ShellOutput> {
        let dir = self.layout.cartridge_dir(manifest);
        let mut command = ShellCommand::new(dir.join("bin").join(script))
            .args(args.iter().map(|arg| arg.to_string()));
        command.env = load_gear_env(&self.layout)?;
        command.clear_env = true;
        command.cwd = Some(dir);
        if self.run_as_gear_user {
            command.uid = Some(self.uid()?);
            command.gid = Some(self.gid()?);
        }
        self.run_checked(&command)
    }

    fn control_all(&self, action: &str) -> Result<String> {
        let mut output = String::new();
        for manifest in self.installed_cartridges()? {
            let control = self
                .layout
                .cartridge_dir(&manifest)
                .join("bin")
                .join("control");
            if !control.is_file() {
                log::debug!("{} has no control script", manifest.name);
                continue;
            }
            output.push_str(&self.cartridge_script(&manifest, "control", &[action])?.stdout);
        }
        Ok(output)
    }

    fn gear_owner(&self) -> Result<(u32, u32)> {
        owner_of(self.layout.gear_home())
    }
}

impl GearContainer for CommandNode<'_> {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn application_uuid(&self) -> Result<String> {
        load_gear_env(&self.layout)?
            .remove(APP_UUID_VAR)
            .ok_or_else(|| anyhow!("{APP_UUID_VAR} is not set for gear {}", self.uuid))
    }

    fn uid(&self) -> Result<u32> {
        self.gear_owner().map(|(uid, _)| uid)
    }

    fn gid(&self) -> Result<u32> {
        self.gear_owner().map(|(_, gid)| gid)
    }

    fn container_dir(&self) -> &Path {
        self.layout.gear_home()
    }

    fn stop_gear(&self) -> Result<()> {
        if self.run_template(&self.commands.stop_gear, &self.vars())?.is_none() {
            self.control_all("stop")?;
        }
        Ok(())
    }

    fn start_gear(&self) -> Result<String> {
        match self.run_template(&self.commands.start_gear, &self.vars())? {
            Some(output) => Ok(output.stdout),
            None => self.control_all("start"),
        }
    }

    fn kill_procs(&self) -> Result<()> {
        self.run_template(&self.commands.kill_procs, &self.vars())?;
        Ok(())
    }
}

impl CartridgeModel for CommandNode<'_> {
    fn installed_cartridges(&self) -> Result<Vec<CartridgeManifest>> {
        let gear_home = self.layout.gear_home();
        let mut manifests = Vec::new();
        for entry in fs::read_dir(gear_home)
            .with_context(|| format!("failed to read gear home: {}", gear_home.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name == "app-root" || !entry.file_type()?.is_dir() {
                continue;
            }

            let path = MANIFEST_PATH
                .iter()
                .fold(entry.path(), |path, part| path.join(part));
            if !path.is_file() {
                continue;
            }
            // One broken cartridge must not hide the rest of the gear.
            match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|content| CartridgeManifest::from_toml_str(&content))
            {
                Ok(manifest) => manifests.push(manifest),
                Err(err) => log::warn!(
                    "[{}] skipping cartridge with unusable manifest {}: {err:#}",
                    self.uuid,
                    path.display()
                ),
            }
        }

        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(manifests)
    }

    fn primary_cartridge(&self) -> Result<Option<CartridgeManifest>> {
        let env = load_gear_env(&self.layout)?;
        let Some(primary_dir) = env.get(PRIMARY_CARTRIDGE_DIR_VAR) else {
            return Ok(None);
        };
        let primary_dir = PathBuf::from(primary_dir.trim_end_matches('/'));
        Ok(self
            .installed_cartridges()?
            .into_iter()
            .find(|manifest| self.layout.cartridge_dir(manifest) == primary_dir))
    }

    fn unlock_gear(&self, manifest: &CartridgeManifest) -> Result<()> {
        self.run_template(&self.commands.unlock_gear, &self.cartridge_vars(manifest))?;
        Ok(())
    }

    fn lock_gear(&self, manifest: &CartridgeManifest) -> Result<()> {
        self.run_template(&self.commands.lock_gear, &self.cartridge_vars(manifest))?;
        Ok(())
    }

    fn secure_cartridge(&self, short_name: &str, uid: u32, gid: u32, dir: &Path) -> Result<()> {
        let mut vars = self.vars();
        vars.push(("short_name", short_name.to_string()));
        vars.push(("uid", uid.to_string()));
        vars.push(("gid", gid.to_string()));
        vars.push(("path", dir.display().to_string()));
        self.run_template(&self.commands.secure_cartridge, &vars)?;
        Ok(())
    }

    fn setup(&self, manifest: &CartridgeManifest, version: &str) -> Result<String> {
        let setup = self.layout.cartridge_dir(manifest).join("bin").join("setup");
        if !setup.is_file() {
            return Ok(String::new());
        }
        Ok(self
            .cartridge_script(manifest, "setup", &["--version", version])?
            .stdout)
    }

    fn process_templates(&self, manifest: &CartridgeManifest) -> Result<String> {
        Ok(self
            .run_template(&self.commands.process_templates, &self.cartridge_vars(manifest))?
            .map(|output| output.stdout)
            .unwrap_or_default())
    }

    fn create_private_endpoints(&self, manifest: &CartridgeManifest) -> Result<()> {
        self.run_template(
            &self.commands.create_private_endpoints,
            &self.cartridge_vars(manifest),
        )?;
        Ok(())
    }

    fn connect_frontend(&self, manifest: &CartridgeManifest) -> Result<()> {
        self.run_template(&self.commands.connect_frontend, &self.cartridge_vars(manifest))?;
        Ok(())
    }

    fn status(&self, manifest: &CartridgeManifest) -> Result<String> {
        Ok(self.cartridge_script(manifest, "control", &["status"])?.stdout)
    }
}

impl QuotaControl for CommandNode<'_> {
    /// Without a configured command the gear is treated as unlimited.
    fn get_quota(&self) -> Result<QuotaUsage> {
        match self.run_template(&self.commands.get_quota, &self.vars())? {
            Some(output) => parse_quota(&output.stdout),
            None => Ok(QuotaUsage {
                blocks_used: 0,
                blocks_hard: 0,
                inodes_used: 0,
                inodes_hard: 0,
            }),
        }
    }

    fn set_quota(&self, blocks_hard: u64, inodes_hard: u64) -> Result<()> {
        let mut vars = self.vars();
        vars.push(("blocks", blocks_hard.to_string()));
        vars.push(("inodes", inodes_hard.to_string()));
        self.run_template(&self.commands.set_quota, &vars)?;
        Ok(())
    }
}

impl PriorityBoost for CommandNode<'_> {
    fn boost(&self) -> Result<()> {
        self.run_template(&self.commands.boost, &self.vars())?;
        Ok(())
    }

    fn restore(&self) -> Result<()> {
        self.run_template(&self.commands.unboost, &self.vars())?;
        Ok(())
    }
}

pub fn expand_template(template: &[String], vars: &[(&str, String)]) -> Result<ShellCommand> {
    let mut parts = template.iter().map(|part| {
        vars.iter().fold(part.clone(), |expanded, (key, value)| {
            expanded.replace(&format!("{{{key}}}"), value)
        })
    });
    let program = parts
        .next()
        .filter(|program| !program.trim().is_empty())
        .ok_or_else(|| anyhow!("command template must name a program"))?;
    Ok(ShellCommand::new(program).args(parts))
}

/// Parses `<blocks_used> <blocks_hard> <inodes_used> <inodes_hard>`.
pub fn parse_quota(output: &str) -> Result<QuotaUsage> {
    let values = output
        .split_whitespace()
        .map(|value| {
            value
                .parse::<u64>()
                .with_context(|| format!("invalid quota value '{value}'"))
        })
        .collect::<Result<Vec<_>>>()?;
    let &[blocks_used, blocks_hard, inodes_used, inodes_hard] = values.as_slice() else {
        anyhow::bail!(
            "expected 4 quota values (blocks used/hard, inodes used/hard), got {}",
            values.len()
        );
    };
    Ok(QuotaUsage {
        blocks_used,
        blocks_hard,
        inodes_used,
        inodes_hard,
    })
}

#[cfg(unix)]
fn owner_of(path: &Path) -> Result<(u32, u32)> {
    use std::os::unix::fs::MetadataExt;
    let metadata =
        fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    Ok((metadata.uid(), metadata.gid()))
}

#[cfg(not(unix))]
fn owner_of(path: &Path) -> Result<(u32, u32)> {
    anyhow::bail!("gear ownership is unavailable on this platform: {}", path.display())
}
