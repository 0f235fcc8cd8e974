use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use gearshift_core::{CartridgeIdent, GearIdentity, Itinerary, ItineraryEntry, UpgradeType};
use serde::Serialize;

use crate::env::{load_gear_env, missing_required_vars};
use crate::extension::{ExtensionSource, GearExtension, HookKind};
use crate::fault::{panic_message, ErrorRecord, Fault};
use crate::fs_utils::{remove_file_if_exists, write_atomic};
use crate::guards::{relax_quota, PriorityBoostGuard, WorkingDirGuard};
use crate::itinerary::{find_ident_path, read_ident, remove_itinerary, ItineraryPlanner};
use crate::node::NodeServices;
use crate::procedures::CartridgeUpgrade;
use crate::progress::{StepRecord, UpgradeProgress};
use crate::validation::{GearValidator, ValidationPolicy, VALIDATE_GEAR_STEP};
use crate::GearLayout;

pub const INSPECT_GEAR_STATE_STEP: &str = "inspect_gear_state";
pub const STOP_GEAR_STEP: &str = "stop_gear";
pub const START_GEAR_STEP: &str = "start_gear";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeSettings {
    pub supported_vendors: Vec<String>,
    pub validation: ValidationPolicy,
    pub run_as_gear_user: bool,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            supported_vendors: vec!["redhat".to_string()],
            validation: ValidationPolicy::default(),
            run_as_gear_user: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpgradeTimes {
    pub total_ms: u64,
    pub restart_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpgradePayload {
    pub gear_uuid: String,
    pub hostname: String,
    pub steps: Vec<StepRecord>,
    pub upgrade_complete: bool,
    pub errors: Vec<ErrorRecord>,
    pub itinerary_entries: Vec<ItineraryEntry>,
    pub times: UpgradeTimes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeOutcome {
    pub output: String,
    pub exit_code: i32,
    pub payload: Option<UpgradePayload>,
}

impl UpgradeOutcome {
    fn short_circuit(output: String, exit_code: i32) -> Self {
        Self {
            output,
            exit_code,
            payload: None,
        }
    }
}

#[derive(Default)]
struct RunState {
    itinerary: Option<Itinerary>,
    restart_ms: u64,
}

/// Upgrades one gear to `gear.target_version`. Safe to run again after any
/// failure; finished steps are not repeated.
pub struct Upgrader<'a> {
    gear: GearIdentity,
    layout: GearLayout,
    node: NodeServices<'a>,
    extension: &'a ExtensionSource,
    settings: &'a UpgradeSettings,
}

impl<'a> Upgrader<'a> {
    pub fn new(
        gear: GearIdentity,
        layout: GearLayout,
        node: NodeServices<'a>,
        extension: &'a ExtensionSource,
        settings: &'a UpgradeSettings,
    ) -> Self {
        Self {
            gear,
            layout,
            node,
            extension,
            settings,
        }
    }

    pub fn execute(&self) -> UpgradeOutcome {
        let started = Instant::now();

        if let Err(fault) = self.check_preconditions() {
            log::info!("[{}] {fault}", self.gear.uuid);
            return match fault {
                Fault::Precondition(_) => {
                    UpgradeOutcome::short_circuit(format!("{fault}\n"), fault.status_code())
                }
                fault => self.unstarted_outcome(fault, &started),
            };
        }

        let mut progress = match self.open_progress() {
            Ok(progress) => progress,
            Err(err) => return self.unstarted_outcome(Fault::from_error(&err), &started),
        };

        let instantiated = panic::catch_unwind(AssertUnwindSafe(|| {
            self.extension.instantiate(
                self.node.shell,
                &self.gear.uuid,
                self.layout.gear_home(),
                &self.gear.target_version,
            )
        }))
        .unwrap_or_else(|payload| {
            Err(Fault::Extension(format!(
                "Unable to instantiate gear upgrade extension: {}",
                panic_message(payload.as_ref())
            )))
        });
        let extension = match instantiated {
            Ok(extension) => extension,
            Err(fault) => {
                if let Err(err) = progress.log(fault.to_string()) {
                    log::warn!("[{}] failed to record extension fault: {err:#}", self.gear.uuid);
                }
                return UpgradeOutcome::short_circuit(
                    format!("{fault}\nProgress report:\n{}", progress.report()),
                    fault.status_code(),
                );
            }
        };

        let mut state = RunState::default();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_sequence(&mut progress, &extension, &mut state)
        }));

        let fault = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(Fault::from_error(&err)),
            Err(payload) => Some(Fault::from_panic(payload)),
        };
        if let Some(fault) = &fault {
            self.record_fault(&mut progress, fault);
        }

        let total_ms = started.elapsed().as_millis() as u64;
        if let Err(err) = progress.log(format!("Total upgrade time on node (ms): {total_ms}")) {
            log::warn!("[{}] failed to record total time: {err:#}", self.gear.uuid);
        }

        let payload = UpgradePayload {
            gear_uuid: self.gear.uuid.clone(),
            hostname: self.gear.hostname.clone(),
            steps: progress.steps().to_vec(),
            upgrade_complete: fault.is_none(),
            errors: fault.iter().map(Fault::to_record).collect(),
            itinerary_entries: state
                .itinerary
                .map(|itinerary| itinerary.entries)
                .unwrap_or_default(),
            times: UpgradeTimes {
                total_ms,
                restart_ms: state.restart_ms,
            },
        };
        let json = serde_json::to_string(&payload).unwrap_or_default();

        UpgradeOutcome {
            output: format!("{}\ngear_upgrade_json={json}\n", progress.report()),
            exit_code: fault.as_ref().map_or(0, Fault::status_code),
            payload: Some(payload),
        }
    }

    /// Result for an execution fault raised before a progress log exists.
    fn unstarted_outcome(&self, fault: Fault, started: &Instant) -> UpgradeOutcome {
        log::error!("[{}] upgrade could not start: {fault}", self.gear.uuid);
        let payload = UpgradePayload {
            gear_uuid: self.gear.uuid.clone(),
            hostname: self.gear.hostname.clone(),
            steps: Vec::new(),
            upgrade_complete: false,
            errors: vec![fault.to_record()],
            itinerary_entries: Vec::new(),
            times: UpgradeTimes {
                total_ms: started.elapsed().as_millis() as u64,
                restart_ms: 0,
            },
        };
        let json = serde_json::to_string(&payload).unwrap_or_default();

        UpgradeOutcome {
            output: format!("Caught an exception during upgrade: {fault}\ngear_upgrade_json={json}\n"),
            exit_code: fault.status_code(),
            payload: Some(payload),
        }
    }

    fn check_preconditions(&self) -> Result<(), Fault> {
        if !self.layout.is_real_gear_dir() {
            return Err(Fault::Precondition(format!(
                "Application not found to upgrade: {}",
                self.layout.gear_home().display()
            )));
        }

        let env = load_gear_env(&self.layout).map_err(|err| Fault::from_error(&err))?;
        if !missing_required_vars(&env).is_empty() {
            let marker = serde_json::json!({ "gear_uuid": self.gear.uuid });
            return Err(Fault::Precondition(format!(
                "***acceptable_error_env_vars_not_found={marker}***"
            )));
        }
        Ok(())
    }

    fn open_progress(&self) -> Result<UpgradeProgress> {
        let created = self.layout.ensure_runtime_dir()?;
        let mut progress =
            UpgradeProgress::open(&self.layout, &self.gear.uuid, &self.gear.target_version)?;
        if created {
            progress.log(format!(
                "Created runtime directory {} for {}",
                self.layout.runtime_dir().display(),
                self.layout.gear_home().display()
            ))?;
        }
        Ok(progress)
    }

    fn record_fault(&self, progress: &mut UpgradeProgress, fault: &Fault) {
        let message = format!("Caught an exception during upgrade: {fault}");
        let logged = match fault {
            Fault::Shell { error, .. } => progress.log_with(
                message,
                [
                    ("rc", serde_json::Value::from(error.rc)),
                    ("stdout", error.stdout.clone().into()),
                    ("stderr", error.stderr.clone().into()),
                ],
            ),
            Fault::Execution { trace, .. } => progress.log(format!("{message}\n{trace}")),
            _ => progress.log(message),
        };
        if let Err(err) = logged {
            log::warn!("[{}] failed to record upgrade fault: {err:#}", self.gear.uuid);
        }
    }

    fn run_sequence(
        &self,
        progress: &mut UpgradeProgress,
        extension: &GearExtension<'_>,
        state: &mut RunState,
    ) -> Result<()> {
        progress.log_with(
            format!(
                "Beginning {} upgrade for {}",
                self.gear.target_version, self.gear.uuid
            ),
            [("namespace", self.gear.namespace.as_str())],
        )?;

        self.run_hook(progress, extension, HookKind::PreUpgrade)?;
        self.inspect_gear_state(progress)?;

        let itinerary = ItineraryPlanner {
            layout: &self.layout,
            cartridges: self.node.cartridges,
            repository: self.node.repository,
            supported_vendors: &self.settings.supported_vendors,
            ignore_cartridge_version: self.gear.ignore_cartridge_version,
        }
        .compute(progress)?;
        state.itinerary = Some(itinerary.clone());

        state.restart_ms = self.upgrade_cartridges(progress, &itinerary)?;
        self.run_hook(progress, extension, HookKind::PostUpgrade)?;

        if itinerary.has_incompatible_upgrade() {
            GearValidator {
                node: self.node,
                layout: &self.layout,
                policy: &self.settings.validation,
            }
            .validate(progress)?;

            if progress.is_complete(VALIDATE_GEAR_STEP) {
                self.cleanup(progress)?;
            }
        } else {
            self.cleanup(progress)?;
        }
        Ok(())
    }

    fn run_hook(
        &self,
        progress: &mut UpgradeProgress,
        extension: &GearExtension<'_>,
        kind: HookKind,
    ) -> Result<()> {
        let Some(hook) = extension.hook(kind) else {
            return Ok(());
        };
        progress.step(kind.step_name(), |progress, _| hook.run(progress))
    }

    fn inspect_gear_state(&self, progress: &mut UpgradeProgress) -> Result<()> {
        progress.log(format!(
            "Inspecting gear at {}",
            self.layout.gear_home().display()
        ))?;

        progress.step(INSPECT_GEAR_STATE_STEP, |progress, context| {
            let app_state = self.layout.state_path();
            let saved_state = self.layout.preupgrade_state_path();
            if app_state.is_file() {
                fs::copy(&app_state, &saved_state).with_context(|| {
                    format!(
                        "failed to copy {} to {}",
                        app_state.display(),
                        saved_state.display()
                    )
                })?;
            } else {
                write_atomic(&saved_state, b"stopped")?;
            }

            let value = fs::read_to_string(&saved_state)
                .with_context(|| format!("failed to read {}", saved_state.display()))?
                .trim()
                .to_string();
            progress.log(format!("Pre-upgrade state: {value}"))?;
            context.insert("preupgrade_state", value);
            Ok(())
        })
    }

    /// Returns the gear restart time in milliseconds, zero when no restart
    /// was needed.
    fn upgrade_cartridges(
        &self,
        progress: &mut UpgradeProgress,
        itinerary: &Itinerary,
    ) -> Result<u64> {
        progress.log(format!(
            "Migrating gear at {}",
            self.layout.gear_home().display()
        ))?;

        let relaxed = relax_quota(self.node.quota, progress)?;
        let upgraded = self.upgrade_with_relaxed_quota(progress, itinerary);
        let restored = relaxed.restore(progress);

        let restart_ms = upgraded?;
        restored?;
        Ok(restart_ms)
    }

    fn upgrade_with_relaxed_quota(
        &self,
        progress: &mut UpgradeProgress,
        itinerary: &Itinerary,
    ) -> Result<u64> {
        let restart_required = itinerary.has_incompatible_upgrade();
        if restart_required {
            self.stop_gear(progress)?;
        }

        {
            let _boost = PriorityBoostGuard::acquire(self.node.priority)?;
            let _cwd = WorkingDirGuard::enter(self.node.container.container_dir())?;
            for entry in &itinerary.entries {
                self.upgrade_entry(progress, entry)?;
            }
        }

        if !restart_required {
            return Ok(0);
        }

        let started = Instant::now();
        self.start_gear(progress)?;
        let restart_ms = started.elapsed().as_millis() as u64;
        progress.log(format!("Gear restart time (ms): {restart_ms}"))?;
        Ok(restart_ms)
    }

    fn upgrade_entry(&self, progress: &mut UpgradeProgress, entry: &ItineraryEntry) -> Result<()> {
        let Some(manifest) = self.node.cartridges.installed_cartridge(&entry.cartridge)? else {
            return progress.log(format!(
                "Skipping upgrade for {}: cartridge is not installed",
                entry.cartridge
            ));
        };

        let cartridge_dir = self.layout.cartridge_dir(&manifest);
        if !cartridge_dir.is_dir() {
            return progress.log(format!(
                "Skipping upgrade for {}: cartridge manifest does not match gear layout: {} is not a directory",
                manifest.name,
                cartridge_dir.display()
            ));
        }

        let ident_path = find_ident_path(&cartridge_dir)?.ok_or_else(|| {
            anyhow!(
                "no ident marker for {} under {}",
                manifest.name,
                cartridge_dir.display()
            )
        })?;
        let ident = read_ident(&ident_path)?;
        let next = self
            .node
            .repository
            .select(&ident.name, &ident.version)?
            .ok_or_else(|| anyhow!("cartridge {ident} is no longer in the repository"))?;

        let name = ident.name.clone();
        let procedure = CartridgeUpgrade {
            node: self.node,
            layout: &self.layout,
            run_as_gear_user: self.settings.run_as_gear_user,
        };

        progress.step(&format!("{name}_upgrade_cart"), |progress, context| {
            context.insert("cartridge", name.to_lowercase());
            match entry.upgrade_type {
                UpgradeType::Compatible => {
                    progress.log(format!("Compatible upgrade of cartridge {ident}"))?;
                    context.insert("compatible", true);
                    procedure.compatible_upgrade(
                        progress,
                        &ident.cartridge_version,
                        &next,
                        &cartridge_dir,
                    )
                }
                UpgradeType::Incompatible => {
                    progress.log(format!("Incompatible upgrade of cartridge {ident}"))?;
                    context.insert("compatible", false);
                    procedure.incompatible_upgrade(
                        progress,
                        &ident.cartridge_version,
                        &next,
                        &ident.version,
                        &cartridge_dir,
                    )
                }
            }
        })?;

        progress.step(&format!("{name}_rebuild_ident"), |_, context| {
            context.insert("cartridge", name.to_lowercase());
            let next_ident = CartridgeIdent::new(
                &ident.vendor,
                &ident.name,
                &ident.version,
                next.cartridge_version.to_string(),
            );
            write_atomic(&ident_path, next_ident.to_marker().as_bytes())
        })
    }

    fn stop_gear(&self, progress: &mut UpgradeProgress) -> Result<()> {
        progress.log(format!("Stopping gear on node '{}'", self.gear.hostname))?;

        progress.step(STOP_GEAR_STEP, |progress, context| {
            let stopped = self.node.container.stop_gear();
            let killed = self.node.container.kill_procs();
            if let Err(err) = stopped {
                let warning =
                    Fault::SoftWarning(format!("Stop gear failed with an exception: {err:#}"));
                progress.log(warning.to_string())?;
                context.insert("warning", warning.to_string());
            }
            killed.context("failed to kill gear processes")
        })
    }

    fn start_gear(&self, progress: &mut UpgradeProgress) -> Result<()> {
        progress.log(format!("Starting gear on node '{}'", self.gear.hostname))?;

        progress.step(START_GEAR_STEP, |progress, context| {
            match self.node.container.start_gear() {
                Ok(output) => {
                    progress.log(format!("Start gear output: {output}"))?;
                    context.insert("output", output);
                }
                Err(err) => {
                    let warning = Fault::SoftWarning(format!(
                        "Start gear failed with an exception: {err:#}"
                    ));
                    progress.log(warning.to_string())?;
                    context.insert("warning", warning.to_string());
                }
            }
            Ok(())
        })
    }

    fn cleanup(&self, progress: &mut UpgradeProgress) -> Result<()> {
        progress.log("Cleaning up after upgrade")?;
        let saved_state = self.layout.preupgrade_state_path();
        remove_file_if_exists(&saved_state)
            .with_context(|| format!("failed to remove {}", saved_state.display()))?;
        progress.done()?;
        remove_itinerary(&self.layout)
    }
}
