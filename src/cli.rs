use clap::{ArgAction, Args, Parser, Subcommand};

use crate::settings::SettingsLayer;

/// fanout - run a command, or copy files, on every host of some host groups
#[derive(Parser, Debug)]
#[command(name = "fanout")]
#[command(about = "Run a command, or copy local files, on every host of one or more host groups in parallel")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags accepted before or after any subcommand
#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// File defining host groups as shell variables [default: _node-list]
    #[arg(short = 'f', long, global = true)]
    pub groups_file: Option<String>,

    /// Host groups to act on (comma-separated, repeatable)
    #[arg(short = 'g', long, global = true, value_delimiter = ',')]
    pub host_groups: Vec<String>,

    /// Private key to authenticate with (repeatable) [default: ~/.ssh/id_rsa]
    #[arg(short = 'i', long, global = true)]
    pub identity_file: Vec<String>,

    /// SSH port [default: 22]
    #[arg(short = 'p', long, global = true)]
    pub port: Option<u16>,

    /// Remote user [default: root]
    #[arg(short = 'u', long, global = true)]
    pub user: Option<String>,

    /// Most hosts to work on at once [default: 256]
    #[arg(long, global = true)]
    pub max_hosts: Option<usize>,

    /// Seconds to wait for a connection and login [default: 10]
    #[arg(long, global = true)]
    pub connect_timeout: Option<u64>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command on every host
    Run {
        /// Command line, passed to the remote shell as-is
        command: String,
    },
    /// Copy local files and directories into a directory on every host
    Copy {
        /// Copy directories and their contents
        #[arg(short, long)]
        recursive: bool,

        /// One or more local sources followed by the remote directory
        #[arg(required = true, num_args = 2.., value_name = "PATH")]
        paths: Vec<String>,
    },
    /// List the host groups defined in the groups file
    HostGroups,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

impl GlobalArgs {
    /// The command-line settings layer; unset flags stay `None`.
    pub fn to_layer(&self) -> SettingsLayer {
        let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());
        SettingsLayer {
            groups_file: self.groups_file.clone(),
            host_groups: non_empty(&self.host_groups),
            identity_file: non_empty(&self.identity_file),
            port: self.port,
            user: self.user.clone(),
            max_hosts: self.max_hosts,
            connect_timeout: self.connect_timeout,
        }
    }

    /// Log filter for `--verbose`
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

impl Commands {
    /// Whether the command contacts hosts
    pub fn needs_hosts(&self) -> bool {
        !matches!(self, Commands::HostGroups)
    }
}

/// Split copy arguments into sources and the remote directory.
pub fn split_copy_paths(paths: &[String]) -> Option<(&[String], &str)> {
    match paths.split_last() {
        Some((remote, sources)) if !sources.is_empty() => Some((sources, remote.as_str())),
        _ => None,
    }
}
