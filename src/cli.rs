use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "ipa-dumper",
    about = "Dump a decrypted IPA from a jailbroken iOS device over USB",
    version
)]
pub struct Cli {
    /// List installed applications and exit.
    #[arg(short = 'l', long = "list", action = ArgAction::SetTrue)]
    pub list_applications: bool,

    /// Name of the decrypted IPA.
    #[arg(short = 'o', long = "output", value_name = "NAME")]
    pub output_ipa: Option<String>,

    /// SSH hostname.
    #[arg(short = 'H', long = "host")]
    pub ssh_host: Option<String>,

    /// SSH port.
    #[arg(short = 'p', long = "port")]
    pub ssh_port: Option<u16>,

    /// SSH username.
    #[arg(short = 'u', long = "user")]
    pub ssh_user: Option<String>,

    /// SSH password.
    #[arg(short = 'P', long = "password")]
    pub ssh_password: Option<String>,

    /// SSH private key file.
    #[arg(short = 'K', long = "key-filename", value_name = "PATH")]
    pub ssh_key_filename: Option<PathBuf>,

    /// Agent script injected into the target (defaults to dump.js next to the binary).
    #[arg(short = 's', long = "script", value_name = "PATH")]
    pub agent_script: Option<PathBuf>,

    /// Write an archive even when some artifacts failed to transfer.
    #[arg(long = "allow-partial", action = ArgAction::SetTrue)]
    pub allow_partial: bool,

    /// Socket timeout for remote copies (seconds).
    #[arg(long = "socket-timeout", value_name = "SECONDS")]
    pub socket_timeout: Option<u64>,

    /// Directory for the per-run staging area.
    #[arg(long = "staging-dir", value_name = "DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Hide transfer progress bars.
    #[arg(long = "no-progress", action = ArgAction::SetTrue)]
    pub no_progress: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Bundle identifier, display name, or PID of the target.
    pub target: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    List,
    Dump { target: String },
}

impl Cli {
    /// `None` when neither a target nor `--list` was given.
    pub fn action(&self) -> Option<Action> {
        if self.list_applications {
            Some(Action::List)
        } else {
            self.target
                .clone()
                .map(|target| Action::Dump { target })
        }
    }

    pub fn to_config(&self) -> Config {
        let mut cfg = Config::default();

        if let Some(host) = &self.ssh_host {
            cfg.ssh.host = host.clone();
        }
        if let Some(port) = self.ssh_port {
            cfg.ssh.port = port;
        }
        if let Some(user) = &self.ssh_user {
            cfg.ssh.user = user.clone();
        }
        if let Some(password) = &self.ssh_password {
            cfg.ssh.password = Some(password.clone());
        }
        cfg.ssh.key_filename = self.ssh_key_filename.clone();

        cfg.output_name = self.output_ipa.clone();
        if let Some(script) = &self.agent_script {
            cfg.agent_script = script.clone();
        }
        cfg.allow_partial = self.allow_partial;
        if let Some(secs) = self.socket_timeout {
            cfg.socket_timeout = Duration::from_secs(secs.max(1));
        }
        cfg.staging_dir = self.staging_dir.clone();
        cfg.show_progress = !self.no_progress;
        cfg
    }
}
