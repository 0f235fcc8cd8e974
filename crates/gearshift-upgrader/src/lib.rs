mod command_node;
mod config;
mod env;
mod executor;
mod extension;
mod fault;
mod fs_utils;
mod guards;
mod itinerary;
mod layout;
mod node;
mod procedures;
mod progress;
mod validation;

pub use command_node::{expand_template, parse_quota, CommandNode};
pub use config::{
    ExtensionConfig, NodeCommands, NodeConfig, CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH,
};
pub use env::{
    load_gear_env, missing_required_vars, APP_NAME_VAR, APP_UUID_VAR, GEAR_DNS_VAR,
    GEAR_NAME_VAR, PRIMARY_CARTRIDGE_DIR_VAR, REQUIRED_GEAR_VARS,
};
pub use executor::{
    UpgradeOutcome, UpgradePayload, UpgradeSettings, UpgradeTimes, Upgrader,
    INSPECT_GEAR_STATE_STEP, START_GEAR_STEP, STOP_GEAR_STEP,
};
pub use extension::{
    ExtensionFactory, ExtensionHooks, ExtensionSource, GearExtension, HookKind, UpgradeHook,
};
pub use fault::{ErrorRecord, Fault, ShellError};
pub use guards::{
    relax_quota, GearUnlock, PriorityBoostGuard, QuotaSnapshot, RelaxedQuota, WorkingDirGuard,
};
pub use itinerary::{
    find_ident_path, read_ident, read_itinerary, remove_itinerary, write_itinerary,
    ItineraryPlanner, COMPUTE_ITINERARY_STEP,
};
pub use layout::{GearLayout, PREUPGRADE_STATE};
pub use node::{
    CartridgeModel, GearContainer, HttpProbe, NodeServices, Pause, PriorityBoost, ProbeOutcome,
    ProcessRunner, QuotaControl, QuotaUsage, ReqwestProbe, ShellCommand, ShellOutput,
    ShellRunner, ThreadPause,
};
pub use procedures::CartridgeUpgrade;
pub use progress::{
    read_progress_record, render_report, LogLine, ProgressRecord, StepContext, StepRecord,
    StepStatus, UpgradeProgress,
};
pub use validation::{
    gear_status, poll_endpoint, GearValidator, PollResult, ValidationPolicy,
    DEFAULT_HEALTHY_MARKERS, VALIDATE_GEAR_STEP,
};
