use std::path::PathBuf;
use std::time::Duration;

pub const PAYLOAD_DIR: &str = "Payload";
pub const ARCHIVE_EXTENSION: &str = "ipa";
pub const BUNDLE_MARKER: &str = ".app/";
pub const APP_MANIFEST_KEY: &str = "app";
pub const AGENT_START_COMMAND: &str = "dump";
pub const DEFAULT_AGENT_SCRIPT: &str = "dump.js";
pub const MODULE_MODE: u32 = 0o655;
pub const BUNDLE_MODE: u32 = 0o755;
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DEVICE_POLL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Private key used instead of (or in addition to) the password.
    pub key_filename: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 2222,
            user: "root".to_string(),
            password: Some("alpine".to_string()),
            key_filename: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub ssh: SshConfig,
    /// Explicit archive name from `-o`; a trailing `.ipa` is tolerated.
    pub output_name: Option<String>,
    /// Agent script loaded into the target session.
    pub agent_script: PathBuf,
    /// Package whatever was retrieved even when a transfer failed.
    pub allow_partial: bool,
    /// Socket-level bound on a single remote copy.
    pub socket_timeout: Duration,
    /// Re-check interval for device backends without change notifications.
    pub device_poll: Duration,
    /// Directory the archive is written to.
    pub output_dir: PathBuf,
    /// Parent of the per-run staging directory; system temp dir when unset.
    pub staging_dir: Option<PathBuf>,
    pub show_progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ssh: SshConfig::default(),
            output_name: None,
            agent_script: default_agent_script(),
            allow_partial: false,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            device_poll: DEFAULT_DEVICE_POLL,
            output_dir: PathBuf::from("."),
            staging_dir: None,
            show_progress: true,
        }
    }
}

impl Config {
    /// File name of the final archive: the `-o` override, else the resolved
    /// display name, else the raw target string.
    pub fn archive_name(&self, display_name: &str, target: &str) -> String {
        let base = self
            .output_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or_else(|| Some(display_name).filter(|name| !name.is_empty()))
            .unwrap_or(target);
        let suffix = format!(".{ARCHIVE_EXTENSION}");
        let stem = base.strip_suffix(suffix.as_str()).unwrap_or(base);
        format!("{stem}{suffix}")
    }
}

fn default_agent_script() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_AGENT_SCRIPT)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_AGENT_SCRIPT))
}
