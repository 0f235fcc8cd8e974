use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::executor::UpgradeSettings;
use crate::extension::{ExtensionSource, HookKind};
use crate::validation::ValidationPolicy;
use crate::GearLayout;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/gearshift/node.toml";
pub const CONFIG_ENV_VAR: &str = "GEARSHIFT_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub gear_base_dir: PathBuf,
    pub cartridge_repository: PathBuf,
    pub supported_vendors: Vec<String>,
    pub run_as_gear_user: bool,
    pub validation: ValidationPolicy,
    pub extension: Option<ExtensionConfig>,
    pub commands: NodeCommands,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            gear_base_dir: PathBuf::from("/var/lib/openshift"),
            cartridge_repository: PathBuf::from("/var/lib/gearshift/cartridges"),
            supported_vendors: vec!["redhat".to_string()],
            run_as_gear_user: true,
            validation: ValidationPolicy::default(),
            extension: None,
            commands: NodeCommands::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionConfig {
    pub path: PathBuf,
    #[serde(default = "default_extension_hooks")]
    pub hooks: Vec<HookKind>,
}

fn default_extension_hooks() -> Vec<HookKind> {
    vec![HookKind::PreUpgrade, HookKind::PostUpgrade]
}

/// Argument vectors for node operations. `{uuid}`, `{gear_home}`,
/// `{cartridge}`, `{short_name}`, `{path}`, `{uid}`, `{gid}`, `{blocks}` and
/// `{inodes}` are substituted per call. Unset entries fall back to the
/// cartridge's own `bin/control` where one applies, else do nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeCommands {
    pub stop_gear: Option<Vec<String>>,
    pub start_gear: Option<Vec<String>>,
    pub kill_procs: Option<Vec<String>>,
    pub unlock_gear: Option<Vec<String>>,
    pub lock_gear: Option<Vec<String>>,
    pub secure_cartridge: Option<Vec<String>>,
    pub process_templates: Option<Vec<String>>,
    pub create_private_endpoints: Option<Vec<String>>,
    pub connect_frontend: Option<Vec<String>>,
    pub get_quota: Option<Vec<String>>,
    pub set_quota: Option<Vec<String>>,
    pub boost: Option<Vec<String>>,
    pub unboost: Option<Vec<String>>,
}

impl NodeConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse node config")?;
        if config.supported_vendors.is_empty() {
            anyhow::bail!("node config must list at least one supported vendor");
        }
        if config.validation.max_attempts == 0 {
            anyhow::bail!("validation.max_attempts must be at least 1");
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read node config: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid node config: {}", path.display()))
    }

    /// Loads from `explicit`, else `$GEARSHIFT_CONFIG`, else the default
    /// path. Only a missing default file falls back to built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV_VAR)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Self::resolve_from(explicit, from_env.as_deref())
    }

    pub fn resolve_from(explicit: Option<&Path>, from_env: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit.or(from_env) {
            return Self::load(path);
        }

        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match fs::read_to_string(default_path) {
            Ok(content) => Self::from_toml_str(&content)
                .with_context(|| format!("invalid node config: {}", default_path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::debug!("no node config at {DEFAULT_CONFIG_PATH}; using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err).with_context(|| {
                format!("failed to read node config: {}", default_path.display())
            }),
        }
    }

    pub fn layout_for(&self, uuid: &str) -> GearLayout {
        GearLayout::for_gear(&self.gear_base_dir, uuid)
    }

    pub fn upgrade_settings(&self) -> UpgradeSettings {
        UpgradeSettings {
            supported_vendors: self.supported_vendors.clone(),
            validation: self.validation.clone(),
            run_as_gear_user: self.run_as_gear_user,
        }
    }

    pub fn extension_source(&self) -> ExtensionSource {
        match &self.extension {
            Some(extension) => ExtensionSource::Command {
                path: extension.path.clone(),
                hooks: extension.hooks.clone(),
            },
            None => ExtensionSource::None,
        }
    }
}
