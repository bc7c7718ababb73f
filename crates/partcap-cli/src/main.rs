//! `partcap-cli` – partition capability tool
//!
//! This binary drives capability negotiation for one machine description
//! (`~/.partcap/machine.toml` or `--config <path>`).  It:
//!
//! 1. Lists the `cap-*` properties (`partcap props`).
//! 2. Builds the machine and runs the apply engine (`partcap check`).
//! 3. Simulates a live migration between two descriptions
//!    (`partcap migrate <src> <dst>`).
//! 4. Prints the JSON schema of the migration record (`partcap schema`).
//! 5. Without a subcommand, drops into an **interactive shell** with
//!    slash-commands (`/props`, `/set`, `/apply`, `/save`, `/load`, `/help`).

mod config;
mod repl;

use clap::{Arg, Command};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use partcap_kernel::accessor::properties;
use partcap_kernel::{Machine, MigrationRecord};

fn main() {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG selects the filter (default "info").  PARTCAP_LOG_FORMAT=json
    // emits newline-delimited JSON instead of the compact format.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("PARTCAP_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    let cli = Command::new("partcap")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Partition capability negotiation")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("Machine description (default ~/.partcap/machine.toml)"),
        )
        .subcommand(Command::new("props").about("List capability properties"))
        .subcommand(Command::new("check").about("Build the machine and apply every capability"))
        .subcommand(
            Command::new("migrate")
                .about("Check a migration between two machine descriptions")
                .arg(
                    Arg::new("source")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("destination")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(Command::new("schema").about("Print the migration record JSON schema"));

    let matches = cli.get_matches();
    let config_arg = matches.get_one::<PathBuf>("config").cloned();

    let code = match matches.subcommand() {
        Some(("props", _)) => cmd_props(),
        Some(("check", _)) => cmd_check(config_arg.as_deref()),
        Some(("migrate", args)) => {
            match (
                args.get_one::<PathBuf>("source"),
                args.get_one::<PathBuf>("destination"),
            ) {
                (Some(src), Some(dst)) => cmd_migrate(src, dst),
                _ => 2,
            }
        }
        Some(("schema", _)) => cmd_schema(),
        _ => run_shell(config_arg.as_deref()),
    };
    std::process::exit(code);
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_props() -> i32 {
    println!("{}", "Capability properties".bold().underline());
    for p in properties() {
        println!("  {:<24} {:<6} {}", p.name.bold().cyan(), p.type_name, p.description);
        if let Some(help) = p.help {
            println!("  {:<24} {:<6} {}", "", "", help.dimmed());
        }
    }
    0
}

fn cmd_check(path: Option<&Path>) -> i32 {
    let mut machine = match load_machine(path) {
        Ok(m) => m,
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return 1;
        }
    };

    print_levels(&machine);
    match machine.start() {
        Ok(()) => {
            println!(
                "  {} all capabilities applied ({} unit(s))",
                "✓".green().bold(),
                machine.units().len()
            );
            0
        }
        Err(e) => {
            println!("  {} {}", "✗ fatal:".red().bold(), e);
            1
        }
    }
}

fn cmd_migrate(src_path: &Path, dst_path: &Path) -> i32 {
    let (mut src, mut dst) = match (load_machine(Some(src_path)), load_machine(Some(dst_path))) {
        (Ok(s), Ok(d)) => (s, d),
        (Err(e), _) | (_, Err(e)) => {
            println!("{}: {}", "Config error".red(), e);
            return 1;
        }
    };

    for (label, machine) in [("source", &mut src), ("destination", &mut dst)] {
        if let Err(e) = machine.start() {
            println!("  {} {} cannot start: {}", "✗".red().bold(), label, e);
            return 1;
        }
    }

    let record = src.pre_save();
    match serde_json::to_string(&record) {
        Ok(json) => println!("  record: {}", json.dimmed()),
        Err(e) => warn!(error = %e, "could not render migration record"),
    }

    dst.pre_load();
    if let Err(e) = dst.load_record(&record) {
        println!("  {} {}", "✗ rejected:".red().bold(), e);
        return 1;
    }
    match dst.post_load() {
        Ok(report) => {
            for w in &report.warnings {
                println!("  {} {}", "warning:".yellow(), w);
            }
            println!("  {} migration accepted", "✓".green().bold());
            0
        }
        Err(e) => {
            println!("  {} {}", "✗ rejected:".red().bold(), e);
            1
        }
    }
}

fn cmd_schema() -> i32 {
    let schema = schemars::schema_for!(MigrationRecord);
    match serde_json::to_string_pretty(&schema) {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(e) => {
            println!("{}: {}", "Schema error".red(), e);
            1
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interactive shell
// ─────────────────────────────────────────────────────────────────────────────

fn run_shell(path: Option<&Path>) -> i32 {
    print_banner();

    let cfg = match config::load_or_default(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return 1;
        }
    };
    let shell = match repl::Shell::new(&cfg) {
        Ok(s) => s,
        Err(e) => {
            println!("{}: {}", "Machine error".red(), e);
            return 1;
        }
    };
    println!(
        "  Machine {} with CPU {} ({})",
        cfg.machine.bold(),
        cfg.cpu_type.bold(),
        cfg.host.mode.to_string().yellow()
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – leaving the shell …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());
    repl::run(shell, shutdown);
    0
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn load_machine(path: Option<&Path>) -> Result<Machine, String> {
    config::load_or_default(path)?.build()
}

fn print_levels(machine: &Machine) {
    println!(
        "{} {} / {}",
        "Machine".bold().underline(),
        machine.profile().name.bold(),
        machine.cpu_type().bold()
    );
    for p in properties() {
        let value = machine
            .get_property(&p.name)
            .map(|v| v.to_string())
            .unwrap_or_else(|e| e.to_string());
        println!("  {:<24} {}", p.name, value.yellow());
    }
}

fn print_banner() {
    println!();
    println!(
        "  {} {}",
        "partcap".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Partition capability negotiation shell");
    println!();
}
