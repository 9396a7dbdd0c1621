//! Turns a target descriptor (PID, bundle identifier, or display name) into
//! a live session.

use crate::device::{AgentSession, TargetDevice};
use crate::error::{DumperError, Result};

pub struct Resolution<S> {
    pub session: Option<S>,
    pub pid: Option<u32>,
    /// Best effort; empty when the target did not match any application.
    pub display_name: String,
    pub bundle_identifier: String,
}

impl<S> Resolution<S> {
    /// Takes the session out, failing when resolution produced none.
    pub fn require_session(&mut self, target: &str) -> Result<S> {
        self.session
            .take()
            .ok_or_else(|| DumperError::NoSession(target.to_string()))
    }
}

/// A target made only of ASCII digits is a PID.
pub fn parse_pid(target: &str) -> Option<u32> {
    if target.is_empty() || !target.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    target.parse().ok()
}

pub fn resolve_target<D: TargetDevice>(device: &D, target: &str) -> Result<Resolution<D::Session>> {
    println!("[*]  Start or attach to target '{target}'");

    // An explicit PID never falls back to search or spawn.
    if let Some(pid) = parse_pid(target) {
        let session = device
            .attach(pid)
            .map_err(|source| DumperError::AttachFailed { pid, source })?;
        println!("[+]  Attached by PID = {pid}");
        return Ok(Resolution {
            session: Some(session),
            pid: Some(pid),
            display_name: target.to_string(),
            bundle_identifier: String::new(),
        });
    }

    let apps = device
        .enumerate_applications()
        .map_err(|err| DumperError::DeviceUnavailable(format!("enumerate applications: {err:#}")))?;

    let mut resolution = Resolution {
        session: None,
        pid: None,
        display_name: String::new(),
        bundle_identifier: String::new(),
    };

    match apps.iter().find(|app| app.matches(target)) {
        Some(app) => {
            resolution.pid = app.running_pid();
            resolution.display_name = app.name.clone();
            resolution.bundle_identifier = app.identifier.clone();
            if resolution.pid.is_none() {
                spawn_and_attach(device, app.identifier.as_str(), &mut resolution);
            }
        }
        // Backends that only list processes never report installed bundle
        // identifiers, so an unmatched target is tried as one.
        None => {
            tracing::warn!(target, "no listed application matches target, trying to spawn it");
            spawn_and_attach(device, target, &mut resolution);
            if resolution.pid.is_some() {
                resolution.bundle_identifier = target.to_string();
            }
        }
    }

    if resolution.session.is_none() {
        if let Some(pid) = resolution.pid {
            println!("[*]  Attaching to existing process {pid}...");
            match device.attach(pid) {
                Ok(session) => {
                    println!("[+]  Attached, pid = {}", session.pid());
                    resolution.session = Some(session);
                }
                Err(err) => eprintln!("[!]  Attach failed: {err:#}"),
            }
        }
    }

    Ok(resolution)
}

/// Spawned processes start suspended, so once a pid exists it is resumed
/// whether or not the attach succeeded.
fn spawn_and_attach<D: TargetDevice>(
    device: &D,
    identifier: &str,
    resolution: &mut Resolution<D::Session>,
) {
    let pid = match device.spawn(identifier) {
        Ok(pid) => pid,
        Err(source) => {
            let err = DumperError::SpawnFailed {
                identifier: identifier.to_string(),
                source,
            };
            eprintln!("[!]  {err:#}");
            return;
        }
    };
    println!("[+]  Spawned {identifier}, pid = {pid}");
    resolution.pid = Some(pid);

    match device.attach(pid) {
        Ok(session) => resolution.session = Some(session),
        Err(err) => eprintln!("[!]  Attach to spawned pid {pid} failed: {err:#}"),
    }

    if let Err(err) = device.resume(pid) {
        tracing::warn!(pid, "resume after spawn failed: {err:#}");
        eprintln!("[!]  Failed to resume pid {pid}: {err:#}");
    }
}
