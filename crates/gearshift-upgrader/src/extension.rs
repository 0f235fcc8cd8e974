use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;

use crate::fault::{Fault, ShellError};
use crate::node::{ShellCommand, ShellRunner};
use crate::progress::UpgradeProgress;

pub trait UpgradeHook {
    fn run(&self, progress: &mut UpgradeProgress) -> Result<()>;
}

impl<F> UpgradeHook for F
where
    F: Fn(&mut UpgradeProgress) -> Result<()>,
{
    fn run(&self, progress: &mut UpgradeProgress) -> Result<()> {
        self(progress)
    }
}

/// Site-specific hooks bracketing the cartridge upgrades.
pub struct ExtensionHooks<'a> {
    pub version: String,
    pub pre_upgrade: Option<Box<dyn UpgradeHook + 'a>>,
    pub post_upgrade: Option<Box<dyn UpgradeHook + 'a>>,
}

pub enum GearExtension<'a> {
    Absent,
    Present(ExtensionHooks<'a>),
}

impl GearExtension<'_> {
    pub fn hook(&self, kind: HookKind) -> Option<&dyn UpgradeHook> {
        let Self::Present(hooks) = self else {
            return None;
        };
        match kind {
            HookKind::PreUpgrade => hooks.pre_upgrade.as_deref(),
            HookKind::PostUpgrade => hooks.post_upgrade.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    PreUpgrade,
    PostUpgrade,
}

impl HookKind {
    pub fn step_name(self) -> &'static str {
        match self {
            Self::PreUpgrade => "pre_upgrade",
            Self::PostUpgrade => "post_upgrade",
        }
    }

    fn command_arg(self) -> &'static str {
        match self {
            Self::PreUpgrade => "pre-upgrade",
            Self::PostUpgrade => "post-upgrade",
        }
    }
}

pub type ExtensionFactory =
    Arc<dyn Fn(&str, &Path) -> Result<ExtensionHooks<'static>> + Send + Sync>;

/// Where the gear extension comes from. Resolved once from node configuration.
#[derive(Clone, Default)]
pub enum ExtensionSource {
    #[default]
    None,
    Command {
        path: PathBuf,
        hooks: Vec<HookKind>,
    },
    Custom(ExtensionFactory),
}

impl std::fmt::Debug for ExtensionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Command { path, hooks } => f
                .debug_struct("Command")
                .field("path", path)
                .field("hooks", hooks)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl ExtensionSource {
    /// Builds the extension for one gear. The extension must report exactly
    /// `target_version`.
    pub fn instantiate<'a>(
        &'a self,
        shell: &'a dyn ShellRunner,
        uuid: &'a str,
        gear_home: &'a Path,
        target_version: &str,
    ) -> Result<GearExtension<'a>, Fault> {
        let hooks = match self {
            Self::None => return Ok(GearExtension::Absent),
            Self::Command { path, hooks } => {
                command_extension(shell, path, hooks, uuid, gear_home)?
            }
            Self::Custom(factory) => (factory.as_ref())(uuid, gear_home).map_err(|err| {
                Fault::Extension(format!("Unable to instantiate gear upgrade extension: {err:#}"))
            })?,
        };

        if hooks.version.trim() != target_version {
            return Err(Fault::Extension(format!(
                "Version mismatch between supplied release version ({target_version}) and extension version ({})",
                hooks.version.trim()
            )));
        }
        Ok(GearExtension::Present(hooks))
    }
}

fn command_extension<'a>(
    shell: &'a dyn ShellRunner,
    path: &'a Path,
    hooks: &[HookKind],
    uuid: &'a str,
    gear_home: &'a Path,
) -> Result<ExtensionHooks<'a>, Fault> {
    let output = shell
        .run(&ShellCommand::new(path).arg("version"))
        .map_err(|err| {
            Fault::Extension(format!("Unable to resolve gear upgrade extension: {err:#}"))
        })?;
    if !output.success() {
        return Err(Fault::Extension(format!(
            "Gear upgrade extension must respond to version (rc={})",
            output.rc
        )));
    }

    let hook_for = move |kind: HookKind| -> Option<Box<dyn UpgradeHook + 'a>> {
        if !hooks.contains(&kind) {
            return None;
        }
        let hook = move |progress: &mut UpgradeProgress| -> Result<()> {
            let command = ShellCommand::new(path).args([
                kind.command_arg().to_string(),
                uuid.to_string(),
                gear_home.display().to_string(),
            ]);
            let output = shell.run(&command)?;
            progress.log_with(
                format!("Ran gear extension {}", kind.step_name()),
                [("stdout", output.stdout.as_str())],
            )?;
            if !output.success() {
                return Err(ShellError {
                    message: format!(
                        "gear extension {} exited with {}",
                        kind.step_name(),
                        output.rc
                    ),
                    rc: output.rc,
                    stdout: output.stdout,
                    stderr: output.stderr,
                }
                .into());
            }
            Ok(())
        };
        Some(Box::new(hook))
    };

    Ok(ExtensionHooks {
        version: output.stdout.trim().to_string(),
        pre_upgrade: hook_for(HookKind::PreUpgrade),
        post_upgrade: hook_for(HookKind::PostUpgrade),
    })
}
