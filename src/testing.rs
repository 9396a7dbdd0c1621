//! In-memory device, session, and remote copy used by unit tests.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, bail};
use serde_json::json;

use crate::device::{
    AgentMessage, AgentScript, AgentSession, ApplicationRecord, MessageHandler, TargetDevice,
};
use crate::retrieval::{create_dir_level, report_progress, ProgressFn, RemoteCopy};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Enumerate,
    Spawn(String),
    Attach(u32),
    Resume(u32),
    LoadAgent(u32),
    Post(String),
    Unload,
    Detach(u32),
}

type CallLog = Arc<Mutex<Vec<Call>>>;

fn record(log: &CallLog, call: Call) {
    log.lock().unwrap().push(call);
}

#[derive(Clone, Default)]
pub struct FakeDevice {
    apps: Vec<ApplicationRecord>,
    spawn_pid: Option<u32>,
    attach_fails: bool,
    messages: Vec<AgentMessage>,
    log: CallLog,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            spawn_pid: Some(1000),
            ..Self::default()
        }
    }

    pub fn with_app(mut self, pid: Option<u32>, name: &str, identifier: &str) -> Self {
        self.apps.push(ApplicationRecord {
            pid,
            name: name.to_string(),
            identifier: identifier.to_string(),
        });
        self
    }

    pub fn spawning_pid(mut self, pid: u32) -> Self {
        self.spawn_pid = Some(pid);
        self
    }

    pub fn failing_spawn(mut self) -> Self {
        self.spawn_pid = None;
        self
    }

    pub fn failing_attach(mut self) -> Self {
        self.attach_fails = true;
        self
    }

    /// Messages the agent emits after it receives its start command.
    pub fn emitting(mut self, messages: Vec<AgentMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }
}

impl TargetDevice for FakeDevice {
    type Session = FakeSession;

    fn name(&self) -> String {
        "Fake iPhone".to_string()
    }

    fn enumerate_applications(&self) -> anyhow::Result<Vec<ApplicationRecord>> {
        record(&self.log, Call::Enumerate);
        Ok(self.apps.clone())
    }

    fn spawn(&self, identifier: &str) -> anyhow::Result<u32> {
        record(&self.log, Call::Spawn(identifier.to_string()));
        self.spawn_pid
            .ok_or_else(|| anyhow!("unable to launch {identifier}"))
    }

    fn attach(&self, pid: u32) -> anyhow::Result<FakeSession> {
        record(&self.log, Call::Attach(pid));
        if self.attach_fails {
            bail!("unable to access process with pid {pid}");
        }
        Ok(FakeSession {
            pid,
            messages: self.messages.clone(),
            log: Arc::clone(&self.log),
        })
    }

    fn resume(&self, pid: u32) -> anyhow::Result<()> {
        record(&self.log, Call::Resume(pid));
        Ok(())
    }
}

pub struct FakeSession {
    pub pid: u32,
    messages: Vec<AgentMessage>,
    log: CallLog,
}

impl AgentSession for FakeSession {
    type Script<'s> = FakeScript where Self: 's;

    fn pid(&self) -> u32 {
        self.pid
    }

    fn load_agent<'s>(&'s self, _source: &str, handler: MessageHandler) -> anyhow::Result<FakeScript> {
        record(&self.log, Call::LoadAgent(self.pid));
        Ok(FakeScript {
            handler: Mutex::new(Some(handler)),
            messages: self.messages.clone(),
            log: Arc::clone(&self.log),
        })
    }

    fn detach(&self) -> anyhow::Result<()> {
        record(&self.log, Call::Detach(self.pid));
        Ok(())
    }
}

pub struct FakeScript {
    handler: Mutex<Option<MessageHandler>>,
    messages: Vec<AgentMessage>,
    log: CallLog,
}

impl AgentScript for FakeScript {
    /// Delivers the scripted messages from a separate thread, the way a real
    /// agent's delivery thread would.
    fn post(&self, command: &str) -> anyhow::Result<()> {
        record(&self.log, Call::Post(command.to_string()));
        if let Some(mut handler) = self.handler.lock().unwrap().take() {
            let messages = self.messages.clone();
            thread::spawn(move || {
                for message in messages {
                    handler(message);
                }
            });
        }
        Ok(())
    }

    fn unload(&mut self) -> anyhow::Result<()> {
        record(&self.log, Call::Unload);
        Ok(())
    }
}

pub fn dump_message(origin: &str, staged: &str) -> AgentMessage {
    AgentMessage::Payload(json!({ "dump": staged, "path": origin }))
}

pub fn app_message(staged: &str) -> AgentMessage {
    AgentMessage::Payload(json!({ "app": staged }))
}

pub fn done_message() -> AgentMessage {
    AgentMessage::Payload(json!({ "done": true }))
}

#[derive(Clone)]
enum RemoteEntry {
    File(Vec<u8>),
    Dir(Vec<(String, Vec<u8>)>),
}

/// Remote filesystem keyed by absolute remote path.
#[derive(Clone, Default)]
pub struct FakeRemote {
    entries: HashMap<String, RemoteEntry>,
    fetched: Arc<Mutex<Vec<String>>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, remote: &str, data: &[u8]) -> Self {
        self.entries
            .insert(remote.to_string(), RemoteEntry::File(data.to_vec()));
        self
    }

    pub fn with_dir(mut self, remote: &str, files: &[(&str, &[u8])]) -> Self {
        let files = files
            .iter()
            .map(|(rel, data)| (rel.to_string(), data.to_vec()))
            .collect();
        self.entries.insert(remote.to_string(), RemoteEntry::Dir(files));
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

impl RemoteCopy for FakeRemote {
    fn fetch(
        &self,
        remote: &str,
        local_dir: &Path,
        recursive: bool,
        progress: &mut ProgressFn<'_>,
    ) -> anyhow::Result<()> {
        self.fetched.lock().unwrap().push(remote.to_string());
        let base = Path::new(remote)
            .file_name()
            .ok_or_else(|| anyhow!("remote path {remote} has no file name"))?;
        match self.entries.get(remote) {
            Some(RemoteEntry::File(data)) => {
                let size = data.len() as u64;
                report_progress(progress, remote, size, 0)?;
                fs::write(local_dir.join(base), data)?;
                report_progress(progress, remote, size, size)
            }
            Some(RemoteEntry::Dir(files)) => {
                if !recursive {
                    bail!("{remote}: not a regular file");
                }
                let root = local_dir.join(base);
                create_dir_level(&root)?;
                for (rel, data) in files {
                    let size = data.len() as u64;
                    report_progress(progress, rel, size, 0)?;
                    let dest = root.join(rel);
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&dest, data)?;
                    report_progress(progress, rel, size, size)?;
                }
                Ok(())
            }
            None => bail!("scp: {remote}: No such file or directory"),
        }
    }
}
