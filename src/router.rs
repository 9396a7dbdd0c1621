//! Bridges the agent's message stream into the retrieval pipeline and
//! builds the manifest that the assembler consumes.

use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use serde::Deserialize;
use serde_json::Value;

use crate::completion::{CancelToken, CompletionGate, RunOutcome};
use crate::config::{APP_MANIFEST_KEY, BUNDLE_MARKER};
use crate::device::{AgentMessage, MessageHandler};
use crate::error::DumperError;
use crate::retrieval::{remote_basename, ArtifactFetcher, RemoteCopy};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArtifactEvent {
    ModuleDump {
        origin_path: String,
        staged_source_path: String,
    },
    AppBundle {
        staged_source_path: String,
    },
    Done,
}

#[derive(Debug, Deserialize)]
struct AgentPayload {
    dump: Option<String>,
    path: Option<String>,
    app: Option<String>,
    done: Option<Value>,
}

impl ArtifactEvent {
    /// Decodes one agent payload. A payload normally carries exactly one of
    /// `dump`, `app`, `done`; when several are present they are returned in
    /// that order.
    pub fn from_payload(payload: &Value) -> Result<Vec<ArtifactEvent>, String> {
        let parsed = AgentPayload::deserialize(payload)
            .map_err(|err| format!("malformed agent payload: {err}"))?;

        let mut events = Vec::new();
        if let Some(staged) = parsed.dump {
            let origin = parsed
                .path
                .ok_or_else(|| format!("dump event for {staged} has no origin path"))?;
            events.push(ArtifactEvent::ModuleDump {
                origin_path: origin,
                staged_source_path: staged,
            });
        }
        if let Some(staged) = parsed.app {
            events.push(ArtifactEvent::AppBundle {
                staged_source_path: staged,
            });
        }
        if parsed.done.is_some_and(|flag| flag != Value::Bool(false)) {
            events.push(ArtifactEvent::Done);
        }
        Ok(events)
    }
}

/// Path of `origin` below the first bundle boundary marker.
pub fn relative_to_bundle<'a>(origin: &'a str, marker: &str) -> Option<&'a str> {
    origin
        .find(marker)
        .map(|index| &origin[index + marker.len()..])
}

/// Staged base name to bundle-relative destination, plus the reserved
/// `app` entry naming the bundle directory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a module. Rejects entries that would replace the bundle entry
    /// or land outside the bundle.
    pub fn record_module(
        &mut self,
        staged_name: impl Into<String>,
        relative: impl Into<String>,
    ) -> Result<(), String> {
        let (staged_name, relative) = (staged_name.into(), relative.into());
        check_module(&staged_name, &relative)?;
        self.entries.insert(staged_name, relative);
        Ok(())
    }

    pub fn record_bundle(&mut self, dir_name: impl Into<String>) {
        self.entries
            .insert(APP_MANIFEST_KEY.to_string(), dir_name.into());
    }

    pub fn app_dir(&self) -> Option<&str> {
        self.entries.get(APP_MANIFEST_KEY).map(String::as_str)
    }

    /// Module entries, excluding the bundle entry.
    pub fn modules(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter(|(key, _)| key.as_str() != APP_MANIFEST_KEY)
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Validates a module entry before anything is copied for it.
pub fn check_module(staged_name: &str, relative: &str) -> Result<(), String> {
    if staged_name == APP_MANIFEST_KEY {
        return Err(format!(
            "module name {staged_name:?} collides with the bundle entry"
        ));
    }
    let inside_bundle = !relative.is_empty()
        && Path::new(relative)
            .components()
            .all(|part| matches!(part, Component::Normal(_) | Component::CurDir));
    if !inside_bundle {
        return Err(format!("module destination {relative:?} escapes the bundle"));
    }
    Ok(())
}

/// State shared between the orchestrator and the agent's delivery thread.
///
/// The router is the only writer of the manifest; the orchestrator reads it
/// after the gate fired and the router went idle.
pub struct DumpContext {
    manifest: Mutex<Manifest>,
    gate: CompletionGate,
    cancel: CancelToken,
    deliveries: Mutex<usize>,
    idle: Condvar,
}

/// Marks one message as being handled until dropped.
pub struct Delivery<'a> {
    ctx: &'a DumpContext,
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        let mut active = self.ctx.lock_deliveries();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.ctx.idle.notify_all();
        }
    }
}

impl DumpContext {
    pub fn new(cancel: CancelToken) -> Arc<Self> {
        let ctx = Arc::new(Self {
            manifest: Mutex::new(Manifest::new()),
            gate: CompletionGate::new(),
            cancel,
            deliveries: Mutex::new(0),
            idle: Condvar::new(),
        });
        let gate = ctx.gate.clone();
        ctx.cancel.on_cancel(move || {
            gate.fire(RunOutcome::Cancelled);
        });
        ctx
    }

    pub fn gate(&self) -> &CompletionGate {
        &self.gate
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn manifest(&self) -> MutexGuard<'_, Manifest> {
        self.manifest
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn snapshot(&self) -> Manifest {
        self.manifest().clone()
    }

    /// Must be taken before the gate is consulted, so a delivery either
    /// sees the fired gate or is waited for by [`DumpContext::wait_idle`].
    pub fn begin_delivery(&self) -> Delivery<'_> {
        *self.lock_deliveries() += 1;
        Delivery { ctx: self }
    }

    /// Blocks until no message is being handled. Called after the gate
    /// fired; nothing touches the staging area once this returns.
    pub fn wait_idle(&self) {
        let mut active = self.lock_deliveries();
        while *active > 0 {
            active = self
                .idle
                .wait(active)
                .unwrap_or_else(|poison| poison.into_inner());
        }
    }

    fn lock_deliveries(&self) -> MutexGuard<'_, usize> {
        self.deliveries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

pub struct MessageRouter<R> {
    ctx: Arc<DumpContext>,
    fetcher: ArtifactFetcher<R>,
    failures: Vec<String>,
    finished: bool,
}

impl<R: RemoteCopy + 'static> MessageRouter<R> {
    /// Copies are aborted once the context's cancel token trips.
    pub fn new(ctx: Arc<DumpContext>, fetcher: ArtifactFetcher<R>) -> Self {
        let fetcher = fetcher.with_cancel(ctx.cancel_token().clone());
        Self {
            ctx,
            fetcher,
            failures: Vec::new(),
            finished: false,
        }
    }

    pub fn into_handler(mut self) -> MessageHandler {
        Box::new(move |message| self.handle(message))
    }

    pub fn handle(&mut self, message: AgentMessage) {
        let ctx = Arc::clone(&self.ctx);
        let _delivery = ctx.begin_delivery();
        match message {
            AgentMessage::Payload(payload) => {
                if self.finished || self.ctx.gate().is_fired() {
                    tracing::debug!(%payload, "ignoring agent message after completion");
                    return;
                }
                match ArtifactEvent::from_payload(&payload) {
                    Ok(events) => {
                        for event in events {
                            self.dispatch(event);
                            if self.finished {
                                break;
                            }
                        }
                    }
                    Err(err) => tracing::warn!("{err}"),
                }
            }
            AgentMessage::Log { level, message } => {
                tracing::info!(target: "agent", level = %level, "{message}");
            }
            AgentMessage::Error(description) => {
                eprintln!("[!]  Agent error: {description}");
                self.fail(format!("agent error: {description}"));
            }
        }
    }

    fn dispatch(&mut self, event: ArtifactEvent) {
        match event {
            ArtifactEvent::ModuleDump {
                origin_path,
                staged_source_path,
            } => {
                let relative = bundle_relative_path(&origin_path);
                let staged_name = remote_basename(&staged_source_path).unwrap_or_default();
                if let Err(reason) = check_module(&staged_name, &relative) {
                    tracing::warn!(origin = %origin_path, "rejecting module: {reason}");
                    eprintln!("[!]  Rejected {staged_source_path}: {reason}");
                    self.fail(reason);
                    return;
                }
                match self.fetcher.fetch_module(&staged_source_path) {
                    Ok(name) => {
                        tracing::debug!(%name, %relative, "module staged");
                        let recorded = self.ctx.manifest().record_module(name, relative);
                        if let Err(reason) = recorded {
                            self.fail(reason);
                        }
                    }
                    Err(err) => self.fail_transfer(err),
                }
            }
            ArtifactEvent::AppBundle { staged_source_path } => {
                match self.fetcher.fetch_bundle(&staged_source_path) {
                    Ok(name) => {
                        tracing::debug!(%name, "bundle staged");
                        self.ctx.manifest().record_bundle(name);
                    }
                    Err(err) => self.fail_transfer(err),
                }
            }
            ArtifactEvent::Done => {
                self.finished = true;
                self.ctx.gate().fire(RunOutcome::Completed);
            }
        }
    }

    fn fail_transfer(&mut self, err: DumperError) {
        eprintln!("[!]  {err:#}");
        self.fail(err.to_string());
    }

    /// Ends the run early so the orchestrator is not left waiting on a stream
    /// that will never reach `done`.
    fn fail(&mut self, reason: String) {
        self.failures.push(reason);
        self.finished = true;
        self.ctx
            .gate()
            .fire(RunOutcome::CompletedWithErrors(self.failures.clone()));
    }
}

/// Destination of a module inside the bundle. Modules whose origin lies
/// outside any bundle are placed at the bundle root.
fn bundle_relative_path(origin: &str) -> String {
    match relative_to_bundle(origin, BUNDLE_MARKER) {
        Some(relative) => relative.to_string(),
        None => {
            let fallback = Path::new(origin)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| origin.to_string());
            tracing::warn!(origin, "origin path has no bundle marker; using {fallback}");
            fallback
        }
    }
}
