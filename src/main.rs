//! fanout - main entry point

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use fanout::cli::{split_copy_paths, Cli, Commands, GlobalArgs};
use fanout::{
    exit_status, process_guard, Action, CommandRunner, Dispatcher, FileCopier, FilePermits,
    GroupsFile, Settings, SettingsLayer, SshTransport,
};

/// Log to stderr so the per-host report on stdout stays clean
fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.global.log_level());
    debug!("CLI arguments parsed");

    // Terminates local bash children if we are interrupted mid-resolution
    if let Err(e) = process_guard::install_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    match run(cli) {
        Ok(host_errors) => std::process::exit(exit_status(host_errors)),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn load_settings(global: &GlobalArgs, needs_hosts: bool) -> Result<Settings> {
    let file_layer = SettingsLayer::discover(&SettingsLayer::search_paths())?.unwrap_or_default();
    let settings = Settings::from_layer(global.to_layer().or(file_layer))
        .context("Failed to resolve settings")?;
    settings.validate(needs_hosts)?;
    debug!("settings: {:?}", settings);
    Ok(settings)
}

/// Run the requested command and return the number of failed hosts
fn run(cli: Cli) -> Result<usize> {
    let settings = load_settings(&cli.global, cli.command.needs_hosts())?;

    match cli.command {
        Commands::HostGroups => {
            let groups = GroupsFile::new(&settings.groups_file).valid_groups()?;
            for group in groups {
                println!("{}", group);
            }
            Ok(0)
        }
        Commands::Run { command } => {
            info!("user command: {}", command);
            dispatch(&settings, &CommandRunner::new(command))
        }
        Commands::Copy { recursive, paths } => {
            let (sources, remote_dir) = split_copy_paths(&paths)
                .context("copy needs at least one local source and a remote directory")?;
            let permits = Arc::new(FilePermits::from_rlimit());
            debug!("open local file ceiling: {}", permits.capacity());
            let copier = FileCopier::new(sources.to_vec(), remote_dir, recursive, permits);
            dispatch(&settings, &copier)
        }
    }
}

fn dispatch<A: Action>(settings: &Settings, action: &A) -> Result<usize> {
    let transport = Arc::new(SshTransport::new(settings.ssh_config()));
    let dispatcher = Dispatcher::new(transport).with_max_hosts(settings.max_hosts);

    let host_errors = dispatcher.run(
        &settings.host_groups,
        &settings.groups_file,
        action,
        |result| {
            if let Err(e) = result.print() {
                warn!("failed to print result for {}: {}", result.address, e);
            }
        },
    )?;
    Ok(host_errors)
}
