use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use keyremap::injector::{self, SourceNode};
use keyremap::{keycodes, mapping};

/// Remaps evdev input events into synthetic uinput events per a mapping file.
#[derive(Parser, Debug)]
#[command(name = "keyremap", version, about)]
struct Cli {
    /// Enable verbose (debug) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available input devices and their event nodes.
    ListDevices,
    /// List resolvable key/button symbol names.
    ListKeys,
    /// Load a mapping file and run it against a named hardware device until
    /// interrupted.
    Run {
        /// Path to the mapping file (TOML).
        mapping_file: String,
        /// Hardware device name, as reported by `list-devices`.
        device_name: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run(cli) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::ListDevices => {
            list_devices();
            Ok(())
        }
        Command::ListKeys => {
            list_keys();
            Ok(())
        }
        Command::Run {
            mapping_file,
            device_name,
        } => run_injector(&mapping_file, &device_name),
    }
}

/// Enumerate hardware and their event nodes. A thin, point-in-time
/// convenience wrapper around `evdev::enumerate()`, not a hotplug-tracking
/// device service.
fn list_devices() {
    let devices: Vec<_> = evdev::enumerate().collect();

    if devices.is_empty() {
        println!("No input devices found.");
        println!("You may need to run as root or add your user to the 'input' group.");
        return;
    }

    println!("{:<30} {}", "PATH", "NAME");
    println!("{}", "-".repeat(70));
    for (path, device) in &devices {
        let name = device.name().unwrap_or("(unnamed)");
        println!("{:<30} {}", path.display(), name);
    }
}

fn list_keys() {
    for name in keycodes::list_key_symbols() {
        println!("{name}");
    }
}

/// Collect every event node whose `evdev::Device::name()` matches
/// `device_name` exactly — a hardware device that exposes several nodes
/// (e.g. a gamepad's keyboard node and joystick node) reports the same name
/// on each, so this is how the CLI groups them into one Injector's sources.
fn find_source_nodes(device_name: &str) -> Vec<SourceNode> {
    evdev::enumerate()
        .filter(|(_, device)| device.name() == Some(device_name))
        .map(|(path, device)| SourceNode { path, device })
        .collect()
}

fn run_injector(mapping_path: &str, device_name: &str) -> Result<()> {
    let compiled = mapping::load(std::path::Path::new(mapping_path))
        .with_context(|| format!("failed to load mapping file: {mapping_path}"))?;
    let mapping = Arc::new(compiled);

    let sources = find_source_nodes(device_name);
    if sources.is_empty() {
        anyhow::bail!("no event nodes found for device '{device_name}' (see `list-devices`)");
    }
    log::info!("{device_name}: found {} event node(s)", sources.len());

    let handle = injector::spawn(device_name.to_string(), sources, mapping);

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("failed to register SIGTERM handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("failed to register SIGINT handler")?;
    log::info!("signal handlers registered (SIGTERM, SIGINT)");

    log::info!("{device_name}: running, press Ctrl-C to stop");
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    log::info!("shutdown signal received, stopping {device_name}");
    handle.stop()?;
    log::info!("{device_name}: stopped");

    Ok(())
}
