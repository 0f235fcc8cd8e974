use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use gearshift_core::CartridgeManifest;
use serde::Deserialize;

use crate::env::{load_gear_env, GEAR_DNS_VAR};
use crate::node::{CartridgeModel, HttpProbe, NodeServices, Pause, ProbeOutcome};
use crate::progress::{StepContext, UpgradeProgress};
use crate::GearLayout;

pub const VALIDATE_GEAR_STEP: &str = "validate_gear";

pub const DEFAULT_HEALTHY_MARKERS: [&str; 4] = [
    "running",
    "enabled",
    "Tail of JBoss",
    "status output from the mock cartridge",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub backoff_unit: Duration,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    pub healthy_markers: Vec<String>,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_unit: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            healthy_markers: DEFAULT_HEALTHY_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    pub attempts: u32,
    pub outcome: ProbeOutcome,
}

/// Polls `url` until it answers with something other than 503, the request
/// fails outright, or the attempts run out. Waits `backoff_unit * attempt`
/// between tries.
pub fn poll_endpoint(
    probe: &dyn HttpProbe,
    pause: &dyn Pause,
    url: &str,
    policy: &ValidationPolicy,
) -> PollResult {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let outcome = probe.get(url);
        let retryable = matches!(outcome, ProbeOutcome::TimedOut | ProbeOutcome::Status(503));
        if !retryable || attempt >= max_attempts {
            return PollResult {
                attempts: attempt,
                outcome,
            };
        }
        pause.pause(policy.backoff_unit * attempt);
        attempt += 1;
    }
}

/// Runs every cartridge's status action. Returns whether any output looks
/// unhealthy, and the combined output.
pub fn gear_status(
    cartridges: &dyn CartridgeModel,
    healthy_markers: &[String],
) -> Result<(bool, String)> {
    let mut problem = false;
    let mut status = String::new();

    for manifest in cartridges.installed_cartridges()? {
        let output = match cartridges.status(&manifest) {
            Ok(output) => output,
            Err(err) => format!("status query failed for {}: {err:#}", manifest.name),
        };
        if !is_healthy(&output, healthy_markers) {
            problem = true;
        }
        status.push_str(&format_status(&manifest, &output));
    }

    Ok((problem, status))
}

fn is_healthy(output: &str, healthy_markers: &[String]) -> bool {
    let output = output.to_lowercase();
    healthy_markers
        .iter()
        .any(|marker| output.contains(&marker.to_lowercase()))
}

fn format_status(manifest: &CartridgeManifest, output: &str) -> String {
    format!("{}: {}\n", manifest.name, output.trim_end())
}

pub struct GearValidator<'a> {
    pub node: NodeServices<'a>,
    pub layout: &'a GearLayout,
    pub policy: &'a ValidationPolicy,
}

impl GearValidator<'_> {
    /// Health check after an incompatible upgrade. Problems are recorded on
    /// the step; only progress persistence can fail it.
    pub fn validate(&self, progress: &mut UpgradeProgress) -> Result<()> {
        progress.log("Validating gear post-upgrade")?;
        progress.step(VALIDATE_GEAR_STEP, |progress, context| {
            if let Err(err) = self.check(progress, context) {
                progress.log(format!("Validation could not complete: {err:#}"))?;
                context.insert("validation_error", format!("{err:#}"));
            }
            Ok(())
        })
    }

    fn check(&self, progress: &mut UpgradeProgress, context: &mut StepContext) -> Result<()> {
        let state_path = self.layout.preupgrade_state_path();
        let preupgrade_state = fs::read_to_string(&state_path)
            .with_context(|| format!("failed to read {}", state_path.display()))?
            .trim()
            .to_string();
        progress.log(format!("Pre-upgrade state: {preupgrade_state}"))?;
        context.insert("preupgrade_state", preupgrade_state.clone());

        if preupgrade_state == "stopped" || preupgrade_state == "idle" {
            return Ok(());
        }

        if self.is_head_gear()? {
            let env = load_gear_env(self.layout)?;
            match env.get(GEAR_DNS_VAR) {
                Some(dns) => {
                    let url = format!("http://{dns}/");
                    let result =
                        poll_endpoint(self.node.probe, self.node.pause, &url, self.policy);
                    context.insert("postupgrade_attempts", result.attempts);
                    match result.outcome {
                        ProbeOutcome::Status(code) => {
                            progress.log(format!("Post-upgrade response code: {code}"))?;
                            context.insert("postupgrade_response_code", code);
                        }
                        ProbeOutcome::TimedOut => {
                            progress.log("Post-upgrade request timed out")?;
                            context.insert("postupgrade_response_code", "timeout");
                        }
                        ProbeOutcome::Failed(message) => {
                            progress.log(format!("Post-upgrade request failed: {message}"))?;
                            context.insert("postupgrade_probe_error", message);
                        }
                    }
                }
                None => {
                    progress.log(format!("{GEAR_DNS_VAR} not set; skipping http check"))?;
                }
            }
        }

        let (problem, status) = gear_status(self.node.cartridges, &self.policy.healthy_markers)?;
        if problem {
            progress.log_with(
                "Problem detected with gear status.",
                [("status", status.as_str())],
            )?;
            context.insert("postupgrade_status", status);
            context.insert("postupgrade_problem", true);
        }
        Ok(())
    }

    fn is_head_gear(&self) -> Result<bool> {
        if self.node.cartridges.primary_cartridge()?.is_none() {
            return Ok(false);
        }
        Ok(self.node.container.uuid() == self.node.container.application_uuid()?)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|err| {
            serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds: {err}"
            ))
        })
    }
}
