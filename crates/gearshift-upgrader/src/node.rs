use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use gearshift_core::{CartridgeManifest, CartridgeRepository};

/// Process-level view of one gear.
pub trait GearContainer {
    fn uuid(&self) -> &str;
    fn application_uuid(&self) -> Result<String>;
    fn uid(&self) -> Result<u32>;
    fn gid(&self) -> Result<u32>;
    fn container_dir(&self) -> &Path;
    fn stop_gear(&self) -> Result<()>;
    fn start_gear(&self) -> Result<String>;
    fn kill_procs(&self) -> Result<()>;

    fn processed_templates(&self, manifest: &CartridgeManifest) -> Vec<PathBuf> {
        let dir = manifest.instance_dir(self.container_dir());
        manifest
            .processed_templates
            .iter()
            .map(|path| dir.join(path))
            .collect()
    }

    fn setup_rewritten(&self, manifest: &CartridgeManifest) -> Vec<PathBuf> {
        let dir = manifest.instance_dir(self.container_dir());
        manifest
            .setup_rewritten
            .iter()
            .map(|path| dir.join(path.trim_end_matches('/')))
            .collect()
    }
}

/// Cartridge lifecycle actions for the gear's installed cartridges.
pub trait CartridgeModel {
    /// Manifests of the cartridges currently installed in the gear.
    fn installed_cartridges(&self) -> Result<Vec<CartridgeManifest>>;
    fn primary_cartridge(&self) -> Result<Option<CartridgeManifest>>;
    fn unlock_gear(&self, manifest: &CartridgeManifest) -> Result<()>;
    fn lock_gear(&self, manifest: &CartridgeManifest) -> Result<()>;
    fn secure_cartridge(&self, short_name: &str, uid: u32, gid: u32, dir: &Path) -> Result<()>;
    fn setup(&self, manifest: &CartridgeManifest, version: &str) -> Result<String>;
    fn process_templates(&self, manifest: &CartridgeManifest) -> Result<String>;
    fn create_private_endpoints(&self, manifest: &CartridgeManifest) -> Result<()>;
    fn connect_frontend(&self, manifest: &CartridgeManifest) -> Result<()>;
    fn status(&self, manifest: &CartridgeManifest) -> Result<String>;

    fn installed_cartridge(&self, cartridge_key: &str) -> Result<Option<CartridgeManifest>> {
        Ok(self
            .installed_cartridges()?
            .into_iter()
            .find(|manifest| manifest.cartridge_key() == cartridge_key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub blocks_used: u64,
    pub blocks_hard: u64,
    pub inodes_used: u64,
    pub inodes_hard: u64,
}

pub trait QuotaControl {
    fn get_quota(&self) -> Result<QuotaUsage>;
    fn set_quota(&self, blocks_hard: u64, inodes_hard: u64) -> Result<()>;
}

pub trait PriorityBoost {
    fn boost(&self) -> Result<()>;
    fn restore(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub clear_env: bool,
    pub cwd: Option<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl ShellCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn display(&self) -> String {
        let mut rendered = self.program.display().to_string();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.rc == 0
    }
}

pub trait ShellRunner {
    /// Runs to completion. A non-zero exit is reported in `rc`, not as an error.
    fn run(&self, command: &ShellCommand) -> Result<ShellOutput>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Status(u16),
    TimedOut,
    Failed(String),
}

pub trait HttpProbe {
    fn get(&self, url: &str) -> ProbeOutcome;
}

pub trait Pause {
    fn pause(&self, duration: Duration);
}

/// Everything the upgrader needs from the node, borrowed for one run.
#[derive(Clone, Copy)]
pub struct NodeServices<'a> {
    pub container: &'a dyn GearContainer,
    pub cartridges: &'a dyn CartridgeModel,
    pub repository: &'a dyn CartridgeRepository,
    pub quota: &'a dyn QuotaControl,
    pub priority: &'a dyn PriorityBoost,
    pub shell: &'a dyn ShellRunner,
    pub probe: &'a dyn HttpProbe,
    pub pause: &'a dyn Pause,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ShellRunner for ProcessRunner {
    fn run(&self, command: &ShellCommand) -> Result<ShellOutput> {
        let mut process = Command::new(&command.program);
        process.args(&command.args);
        if command.clear_env {
            process.env_clear();
        }
        process.envs(&command.env);
        if let Some(cwd) = &command.cwd {
            process.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            if let Some(gid) = command.gid {
                process.gid(gid);
            }
            if let Some(uid) = command.uid {
                process.uid(uid);
            }
        }

        let output = process
            .output()
            .with_context(|| format!("failed to spawn '{}'", command.display()))?;
        Ok(ShellOutput {
            rc: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

pub struct ReqwestProbe {
    client: reqwest::blocking::Client,
}

impl ReqwestProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

impl HttpProbe for ReqwestProbe {
    fn get(&self, url: &str) -> ProbeOutcome {
        match self.client.get(url).send() {
            Ok(response) => ProbeOutcome::Status(response.status().as_u16()),
            Err(err) if err.is_timeout() => ProbeOutcome::TimedOut,
            Err(err) => ProbeOutcome::Failed(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
