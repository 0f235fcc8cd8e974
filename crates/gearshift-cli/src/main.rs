mod completion;
mod render;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gearshift_core::GearIdentity;
use gearshift_repository::CartridgeIndex;
use gearshift_upgrader::{
    read_itinerary, read_progress_record, render_report, CommandNode, GearLayout, NodeConfig,
    NodeServices, ProcessRunner, ReqwestProbe, StepStatus, ThreadPause, UpgradeOutcome, Upgrader,
};

use crate::completion::{write_completions_script, CliCompletionShell};
use crate::render::{current_output_style, render_status_line, OutputStyle};

#[derive(Parser, Debug)]
#[command(name = "gearshift")]
#[command(about = "In-place cartridge upgrades for application gears", long_about = None)]
struct Cli {
    /// Node config file; defaults to $GEARSHIFT_CONFIG, then /etc/gearshift/node.toml.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upgrade one gear to a platform release.
    Upgrade {
        #[arg(long)]
        uuid: String,
        #[arg(long)]
        namespace: String,
        #[arg(long = "version", value_name = "VERSION")]
        target_version: String,
        #[arg(long)]
        hostname: String,
        #[arg(long)]
        ignore_cartridge_version: bool,
        /// Print only the structured result.
        #[arg(long)]
        json: bool,
    },
    /// Show the persisted itinerary of an unfinished upgrade.
    Itinerary { uuid: String },
    /// Show the progress log of the last upgrade.
    Progress { uuid: String },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let code = run_cli(cli)?;
    if code != 0 {
        io::stdout().flush().context("failed to flush stdout")?;
        std::process::exit(code);
    }
    Ok(())
}

fn run_cli(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Upgrade {
            uuid,
            namespace,
            target_version,
            hostname,
            ignore_cartridge_version,
            json,
        } => {
            let config = NodeConfig::resolve(cli.config.as_deref())?;
            let gear = GearIdentity {
                uuid,
                namespace,
                target_version,
                hostname,
                ignore_cartridge_version,
            };
            let outcome = run_upgrade(&config, gear)?;
            print_outcome(&outcome, json)?;
            eprintln!(
                "{}",
                render_status_line(
                    current_output_style(),
                    if outcome.exit_code == 0 { "ok" } else { "error" },
                    &format!("upgrade finished with exit code {}", outcome.exit_code),
                )
            );
            Ok(outcome.exit_code)
        }
        Commands::Itinerary { uuid } => {
            let config = NodeConfig::resolve(cli.config.as_deref())?;
            let layout = config.layout_for(&uuid);
            print_lines(&itinerary_lines(&layout)?);
            Ok(0)
        }
        Commands::Progress { uuid } => {
            let config = NodeConfig::resolve(cli.config.as_deref())?;
            let layout = config.layout_for(&uuid);
            print_lines(&progress_lines(&layout, current_output_style())?);
            Ok(0)
        }
        Commands::Completions { shell } => {
            let mut stdout = io::stdout();
            write_completions_script(shell, &mut stdout)?;
            Ok(0)
        }
    }
}

fn run_upgrade(config: &NodeConfig, gear: GearIdentity) -> Result<UpgradeOutcome> {
    let layout = config.layout_for(&gear.uuid);
    let settings = config.upgrade_settings();
    let extension = config.extension_source();
    log::debug!(
        "upgrading gear {} from {} with extension {extension:?}",
        gear.uuid,
        layout.gear_home().display()
    );

    let shell = ProcessRunner;
    let probe = ReqwestProbe::new(settings.validation.request_timeout)?;
    let pause = ThreadPause;
    let repository = CartridgeIndex::open(config.cartridge_repository.clone());
    let node = CommandNode::new(
        gear.uuid.clone(),
        layout.clone(),
        &config.commands,
        &shell,
        settings.run_as_gear_user,
    );
    let services = NodeServices {
        container: &node,
        cartridges: &node,
        repository: &repository,
        quota: &node,
        priority: &node,
        shell: &shell,
        probe: &probe,
        pause: &pause,
    };

    Ok(Upgrader::new(gear, layout, services, &extension, &settings).execute())
}

fn print_outcome(outcome: &UpgradeOutcome, json: bool) -> Result<()> {
    match (&outcome.payload, json) {
        (Some(payload), true) => {
            let rendered = serde_json::to_string_pretty(payload)
                .context("failed to serialize upgrade result")?;
            println!("{rendered}");
        }
        _ => print!("{}", outcome.output),
    }
    Ok(())
}

fn itinerary_lines(layout: &GearLayout) -> Result<Vec<String>> {
    let Some(itinerary) = read_itinerary(layout)? else {
        return Ok(vec![format!(
            "no itinerary for gear at {}",
            layout.gear_home().display()
        )]);
    };
    if itinerary.is_empty() {
        return Ok(vec!["itinerary is empty".to_string()]);
    }

    Ok(itinerary
        .entries
        .iter()
        .map(|entry| format!("{} {}", entry.cartridge, entry.upgrade_type.as_str()))
        .collect())
}

fn progress_lines(layout: &GearLayout, style: OutputStyle) -> Result<Vec<String>> {
    let Some(record) = read_progress_record(layout)? else {
        return Ok(vec![format!(
            "no upgrade progress for gear at {}",
            layout.gear_home().display()
        )]);
    };

    let mut lines = vec![format!(
        "upgrade to {} ({})",
        record.target_version,
        if record.done_at_ms.is_some() {
            "done"
        } else {
            "unfinished"
        }
    )];
    for step in &record.steps {
        let status = match step.status {
            StepStatus::Complete => "ok",
            StepStatus::Pending => "warn",
        };
        lines.push(render_status_line(style, status, &step.name));
        for error in &step.errors {
            lines.push(format!("  {error}"));
        }
    }
    lines.extend(render_report(&record).lines().map(str::to_string));
    Ok(lines)
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests;
