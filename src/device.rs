//! Device-side seams: what the orchestrator needs from a device, a session,
//! and an injected agent script, plus blocking device acquisition and the
//! application listing.

use std::fmt::Write as _;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;

use crate::completion::CancelToken;
use crate::error::{DumperError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationRecord {
    /// `None` or `Some(0)` when the application is not running.
    pub pid: Option<u32>,
    pub name: String,
    pub identifier: String,
}

impl ApplicationRecord {
    pub fn running_pid(&self) -> Option<u32> {
        self.pid.filter(|pid| *pid != 0)
    }

    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    pub fn matches(&self, target: &str) -> bool {
        self.identifier == target || self.name == target
    }
}

/// Message delivered by an injected agent, already stripped of transport
/// framing.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentMessage {
    /// The `payload` of a `send()` from the agent.
    Payload(Value),
    Log { level: String, message: String },
    Error(String),
}

impl AgentMessage {
    /// Decodes a raw agent message (`{"type": "send", "payload": ...}` and
    /// friends). Messages without anything to forward yield `None`.
    pub fn from_raw(value: &Value) -> Option<Self> {
        fn text<'v>(value: &'v Value, key: &str) -> Option<&'v str> {
            value.get(key).and_then(Value::as_str)
        }
        let field = |key| text(value, key);
        match field("type") {
            Some("send") => value.get("payload").cloned().map(AgentMessage::Payload),
            Some("error") => Some(AgentMessage::Error(
                field("description")
                    .unwrap_or("unspecified agent error")
                    .to_string(),
            )),
            Some("log") => Some(AgentMessage::Log {
                level: field("level").unwrap_or("info").to_string(),
                message: field("payload").unwrap_or_default().to_string(),
            }),
            _ => value.get("payload").cloned().map(AgentMessage::Payload),
        }
    }
}

/// Callback invoked on the agent's delivery thread.
pub type MessageHandler = Box<dyn FnMut(AgentMessage) + Send>;

pub trait AgentScript {
    fn post(&self, command: &str) -> anyhow::Result<()>;
    fn unload(&mut self) -> anyhow::Result<()>;
}

pub trait AgentSession {
    type Script<'s>: AgentScript
    where
        Self: 's;

    fn pid(&self) -> u32;

    /// Creates and loads `source` in the session, routing every message the
    /// agent emits to `handler`.
    fn load_agent<'s>(&'s self, source: &str, handler: MessageHandler)
        -> anyhow::Result<Self::Script<'s>>;

    fn detach(&self) -> anyhow::Result<()>;
}

pub trait TargetDevice {
    type Session: AgentSession;

    fn name(&self) -> String;
    fn enumerate_applications(&self) -> anyhow::Result<Vec<ApplicationRecord>>;
    /// Starts `identifier` suspended and returns its pid.
    fn spawn(&self, identifier: &str) -> anyhow::Result<u32>;
    fn attach(&self, pid: u32) -> anyhow::Result<Self::Session>;
    fn resume(&self, pid: u32) -> anyhow::Result<()>;
}

/// Source of USB-class devices for [`wait_for_device`].
pub trait DeviceSource {
    type Device;

    fn usb_devices(&self) -> anyhow::Result<Vec<Self::Device>>;
}

#[derive(Default)]
struct MonitorState {
    generation: u64,
    cancelled: bool,
}

/// Change notification for the device set. Backends call
/// [`DeviceMonitor::notify_changed`] whenever devices come or go.
#[derive(Clone, Default)]
pub struct DeviceMonitor {
    inner: Arc<(Mutex<MonitorState>, Condvar)>,
}

impl DeviceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monitor that is cancelled together with `token`.
    pub fn with_cancel(token: &CancelToken) -> Self {
        let monitor = Self::new();
        let handle = monitor.clone();
        token.on_cancel(move || handle.cancel());
        monitor
    }

    pub fn notify_changed(&self) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock_monitor(lock);
        state.generation = state.generation.wrapping_add(1);
        cvar.notify_all();
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        lock_monitor(lock).cancelled = true;
        cvar.notify_all();
    }

    fn generation(&self) -> (u64, bool) {
        let state = lock_monitor(&self.inner.0);
        (state.generation, state.cancelled)
    }

    /// Sleeps until the generation moves past `seen`, the monitor is
    /// cancelled, or `recheck` elapses. Returns `false` on cancellation.
    fn wait_for_change(&self, seen: u64, recheck: Option<Duration>) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut state = lock_monitor(lock);
        while state.generation == seen && !state.cancelled {
            match recheck {
                Some(interval) => {
                    let (next, timeout) = cvar
                        .wait_timeout(state, interval)
                        .unwrap_or_else(|poison| poison.into_inner());
                    state = next;
                    if timeout.timed_out() {
                        break;
                    }
                }
                None => {
                    state = cvar.wait(state).unwrap_or_else(|poison| poison.into_inner());
                }
            }
        }
        !state.cancelled
    }
}

fn lock_monitor(lock: &Mutex<MonitorState>) -> MutexGuard<'_, MonitorState> {
    lock.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Blocks until `source` reports at least one device and returns the first.
///
/// The device set is re-read after every change notification. `recheck`
/// adds a periodic re-read for sources that cannot notify; `None` waits on
/// notifications alone. There is no overall deadline: the only way out
/// without a device is cancellation.
pub fn wait_for_device<S: DeviceSource>(
    source: &S,
    monitor: &DeviceMonitor,
    recheck: Option<Duration>,
) -> Result<S::Device> {
    let mut announced = false;
    loop {
        let (seen, cancelled) = monitor.generation();
        if cancelled {
            return Err(DumperError::Cancelled);
        }

        let devices = source
            .usb_devices()
            .map_err(|err| DumperError::DeviceUnavailable(format!("{err:#}")))?;
        if let Some(device) = devices.into_iter().next() {
            return Ok(device);
        }

        if !announced {
            println!("[*]  Waiting for USB device...");
            announced = true;
        }
        tracing::debug!(generation = seen, "no usb device yet");
        if !monitor.wait_for_change(seen, recheck) {
            return Err(DumperError::Cancelled);
        }
    }
}

/// Running applications first, then by name.
pub fn sort_applications(apps: &mut [ApplicationRecord]) {
    apps.sort_by(|a, b| {
        b.is_running()
            .cmp(&a.is_running())
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Renders the `-l` table. Input order is not significant.
pub fn format_application_table(apps: &[ApplicationRecord]) -> String {
    let mut sorted = apps.to_vec();
    sort_applications(&mut sorted);

    let pid_text: Vec<String> = sorted
        .iter()
        .map(|app| {
            app.running_pid()
                .map_or_else(|| "-".to_string(), |pid| pid.to_string())
        })
        .collect();
    let pid_w = pid_text.iter().map(String::len).max().unwrap_or(0).max(3);
    let name_w = sorted.iter().map(|a| a.name.chars().count()).max().unwrap_or(0).max(4);
    let id_w = sorted
        .iter()
        .map(|a| a.identifier.chars().count())
        .max()
        .unwrap_or(0)
        .max(10);

    let mut out = String::new();
    let _ = writeln!(out, "{:>pid_w$}  {:<name_w$}  {:<id_w$}", "PID", "Name", "Identifier");
    let _ = writeln!(
        out,
        "{}  {}  {}",
        "-".repeat(pid_w),
        "-".repeat(name_w),
        "-".repeat(id_w)
    );
    for (app, pid) in sorted.iter().zip(pid_text) {
        let _ = writeln!(
            out,
            "{:>pid_w$}  {:<name_w$}  {:<id_w$}",
            pid, app.name, app.identifier
        );
    }
    out
}

/// Prints the application table for `device`.
pub fn list_applications<D: TargetDevice>(device: &D) -> Result<()> {
    let apps = device
        .enumerate_applications()
        .map_err(|err| DumperError::DeviceUnavailable(format!("enumerate applications: {err:#}")))?;
    print!("{}", format_application_table(&apps));
    Ok(())
}
