use super::*;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use gearshift_core::{Itinerary, UpgradeType};
use gearshift_upgrader::{write_itinerary, UpgradeProgress};

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

#[test]
fn cli_parses_upgrade_with_every_flag() {
    let cli = Cli::try_parse_from([
        "gearshift",
        "--config",
        "/srv/node.toml",
        "upgrade",
        "--uuid",
        "5a1f0c3e",
        "--namespace",
        "acme",
        "--version",
        "2.0.30",
        "--hostname",
        "node1.example.com",
        "--ignore-cartridge-version",
        "--json",
    ])
    .expect("command must parse");

    assert_eq!(cli.config, Some(PathBuf::from("/srv/node.toml")));
    match cli.command {
        Commands::Upgrade {
            uuid,
            namespace,
            target_version,
            hostname,
            ignore_cartridge_version,
            json,
        } => {
            assert_eq!(uuid, "5a1f0c3e");
            assert_eq!(namespace, "acme");
            assert_eq!(target_version, "2.0.30");
            assert_eq!(hostname, "node1.example.com");
            assert!(ignore_cartridge_version);
            assert!(json);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_upgrade_switches_default_off() {
    let cli = Cli::try_parse_from([
        "gearshift",
        "upgrade",
        "--uuid",
        "5a1f0c3e",
        "--namespace",
        "acme",
        "--version",
        "2.0.30",
        "--hostname",
        "node1",
    ])
    .expect("command must parse");

    assert!(cli.config.is_none());
    match cli.command {
        Commands::Upgrade {
            ignore_cartridge_version,
            json,
            ..
        } => {
            assert!(!ignore_cartridge_version);
            assert!(!json);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_rejects_upgrade_without_uuid() {
    let err = Cli::try_parse_from([
        "gearshift",
        "upgrade",
        "--namespace",
        "acme",
        "--version",
        "2.0.30",
        "--hostname",
        "node1",
    ])
    .expect_err("missing uuid must fail");
    assert!(err.to_string().contains("--uuid"), "{err}");
}

#[test]
fn cli_parses_inspection_commands() {
    let cli = Cli::try_parse_from(["gearshift", "itinerary", "5a1f0c3e"]).expect("must parse");
    match cli.command {
        Commands::Itinerary { uuid } => assert_eq!(uuid, "5a1f0c3e"),
        other => panic!("unexpected command: {other:?}"),
    }

    let cli = Cli::try_parse_from(["gearshift", "progress", "5a1f0c3e"]).expect("must parse");
    match cli.command {
        Commands::Progress { uuid } => assert_eq!(uuid, "5a1f0c3e"),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_parses_completions_for_each_supported_shell() {
    let cases = vec![
        ("bash", CliCompletionShell::Bash),
        ("zsh", CliCompletionShell::Zsh),
        ("fish", CliCompletionShell::Fish),
        ("powershell", CliCompletionShell::Powershell),
    ];

    for (shell, expected) in cases {
        let cli =
            Cli::try_parse_from(["gearshift", "completions", shell]).expect("command parses");
        match cli.command {
            Commands::Completions { shell } => assert_eq!(shell, expected),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

#[test]
fn cli_rejects_unsupported_completion_shell() {
    let err = Cli::try_parse_from(["gearshift", "completions", "elvish"])
        .expect_err("unsupported shell must fail");
    let rendered = err.to_string();
    assert!(rendered.contains("elvish"));
    assert!(rendered.contains("possible values"));
}

#[test]
fn completions_script_names_binary_and_subcommands() {
    let mut output = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut output)
        .expect("must generate completions");
    let script = String::from_utf8(output).expect("completion script must be utf-8");
    assert!(script.contains("gearshift"));
    assert!(script.contains("upgrade"));
    assert!(script.contains("itinerary"));
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "upgrade finished with exit code 0"),
        "upgrade finished with exit code 0"
    );
}

#[test]
fn render_status_line_rich_includes_badge() {
    let line = render_status_line(OutputStyle::Rich, "warn", "php_upgrade_cart");
    assert!(line.contains("[WARN]"), "{line}");
    assert!(line.ends_with(" php_upgrade_cart"), "{line}");
}

#[test]
fn resolve_output_style_follows_terminal() {
    assert_eq!(render::resolve_output_style(true), OutputStyle::Rich);
    assert_eq!(render::resolve_output_style(false), OutputStyle::Plain);
}

#[test]
fn itinerary_lines_report_missing_and_planned_entries() {
    let layout = test_layout();
    let lines = itinerary_lines(&layout).expect("must render");
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("no itinerary for gear at"));

    layout.ensure_runtime_dir().expect("must create runtime dir");
    let mut itinerary = Itinerary::default();
    itinerary.create_entry("php-5.4", UpgradeType::Compatible);
    itinerary.create_entry("mock-0.1", UpgradeType::Incompatible);
    write_itinerary(&layout, &itinerary).expect("must write itinerary");

    assert_eq!(
        itinerary_lines(&layout).expect("must render"),
        vec!["php-5.4 compatible", "mock-0.1 incompatible"]
    );

    let _ = fs::remove_dir_all(layout.gear_home());
}

#[test]
fn progress_lines_list_steps_errors_and_log() {
    let layout = test_layout();
    layout.ensure_runtime_dir().expect("must create runtime dir");

    let mut progress =
        UpgradeProgress::open(&layout, "5a1f0c3e", "2.0.30").expect("must open progress");
    progress
        .log("Beginning 2.0.30 upgrade for 5a1f0c3e")
        .expect("must log");
    progress
        .step("inspect_gear_state", |_, _| Ok(()))
        .expect("step must succeed");
    let _ = progress.step("php_upgrade_cart", |_, context| {
        context.error("overlay incomplete");
        Err(anyhow!("setup failed"))
    });

    let lines = progress_lines(&layout, OutputStyle::Plain).expect("must render");
    assert_eq!(lines[0], "upgrade to 2.0.30 (unfinished)");
    assert_eq!(lines[1], "inspect_gear_state");
    assert_eq!(lines[2], "php_upgrade_cart");
    assert_eq!(lines[3], "  overlay incomplete");
    assert!(lines.contains(&"Beginning 2.0.30 upgrade for 5a1f0c3e".to_string()));

    let _ = fs::remove_dir_all(layout.gear_home());
}

#[test]
fn progress_lines_without_record() {
    let layout = test_layout();
    let lines = progress_lines(&layout, OutputStyle::Plain).expect("must render");
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("no upgrade progress for gear at"));
}

fn test_layout() -> GearLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    GearLayout::new(std::env::temp_dir().join(format!(
        "gearshift-cli-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    )))
}
