use std::path::PathBuf;

use crate::cli::Action;
use crate::completion::CancelToken;
use crate::config::Config;
use crate::error::Result;

/// Acquires a USB device through FRIDA and performs `action` against it.
/// Returns the archive path for dumps.
pub fn run_with_frida(action: &Action, cfg: &Config, cancel: &CancelToken) -> Result<Option<PathBuf>> {
    #[cfg(feature = "frida")]
    {
        inner::run_with_frida(action, cfg, cancel)
    }

    #[cfg(not(feature = "frida"))]
    {
        let _ = (action, cfg, cancel);
        Err(crate::error::DumperError::FeatureNotEnabled(
            "frida".to_string(),
        ))
    }
}

#[cfg(feature = "frida")]
mod inner {
    use super::*;
    use std::cell::RefCell;

    use anyhow::Context;
    use frida::{
        Device, DeviceManager, DeviceType, Frida, Message, MessageSend, Script, ScriptHandler,
        ScriptOption, Session, SpawnOptions,
    };

    use crate::assembler::ZipArchiver;
    use crate::device::{
        list_applications, wait_for_device, AgentMessage, AgentScript, AgentSession,
        ApplicationRecord, DeviceMonitor, DeviceSource, MessageHandler, TargetDevice,
    };
    use crate::ssh::SshRemote;
    use crate::workflow::run_dump_workflow;

    pub(super) fn run_with_frida(
        action: &Action,
        cfg: &Config,
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>> {
        let frida_ctx = unsafe { Frida::obtain() };
        let manager = DeviceManager::obtain(&frida_ctx);

        // frida-rust exposes no device-change signal, so the monitor is
        // driven by periodic re-checks.
        let monitor = DeviceMonitor::with_cancel(cancel);
        let device = wait_for_device(
            &UsbDevices { manager: &manager },
            &monitor,
            Some(cfg.device_poll),
        )?;
        println!("[*]  Using device {}", device.name());

        match action {
            Action::List => {
                list_applications(&device)?;
                Ok(None)
            }
            Action::Dump { target } => {
                let remote = SshRemote::connect(&cfg.ssh, cfg.socket_timeout)?;
                let result =
                    run_dump_workflow(&device, remote.clone(), target, cfg, &ZipArchiver, cancel);
                remote.close();
                result.map(Some)
            }
        }
    }

    struct UsbDevices<'a> {
        manager: &'a DeviceManager<'a>,
    }

    impl<'a> DeviceSource for UsbDevices<'a> {
        type Device = FridaDevice<'a>;

        fn usb_devices(&self) -> anyhow::Result<Vec<FridaDevice<'a>>> {
            Ok(self
                .manager
                .enumerate_all_devices()
                .into_iter()
                .filter(|device| matches!(device.get_type(), DeviceType::USB))
                .map(|device| FridaDevice {
                    device: RefCell::new(device),
                })
                .collect())
        }
    }

    pub(super) struct FridaDevice<'a> {
        // `Device::spawn` needs `&mut`, the trait hands out `&self`.
        device: RefCell<Device<'a>>,
    }

    impl<'a> TargetDevice for FridaDevice<'a> {
        type Session = FridaSession<'a>;

        fn name(&self) -> String {
            self.device.borrow().get_name().to_string()
        }

        /// frida-rust enumerates processes, not installed applications, so
        /// only running applications are reported here and the identifier
        /// mirrors the process name.
        fn enumerate_applications(&self) -> anyhow::Result<Vec<ApplicationRecord>> {
            Ok(self
                .device
                .borrow()
                .enumerate_processes()
                .into_iter()
                .map(|process| ApplicationRecord {
                    pid: Some(process.get_pid()),
                    name: process.get_name().to_string(),
                    identifier: process.get_name().to_string(),
                })
                .collect())
        }

        fn spawn(&self, identifier: &str) -> anyhow::Result<u32> {
            self.device
                .borrow_mut()
                .spawn(identifier, &SpawnOptions::default())
                .with_context(|| format!("spawn {identifier} via FRIDA"))
        }

        fn attach(&self, pid: u32) -> anyhow::Result<FridaSession<'a>> {
            let session = self
                .device
                .borrow()
                .attach(pid)
                .with_context(|| format!("attach to pid {pid}"))?;
            Ok(FridaSession { session, pid })
        }

        fn resume(&self, pid: u32) -> anyhow::Result<()> {
            self.device
                .borrow()
                .resume(pid)
                .with_context(|| format!("resume pid {pid}"))
        }
    }

    pub(super) struct FridaSession<'a> {
        session: Session<'a>,
        pid: u32,
    }

    impl<'a> AgentSession for FridaSession<'a> {
        type Script<'s> = FridaScript<'s> where Self: 's;

        fn pid(&self) -> u32 {
            self.pid
        }

        fn load_agent<'s>(
            &'s self,
            source: &str,
            handler: MessageHandler,
        ) -> anyhow::Result<FridaScript<'s>> {
            let mut options = ScriptOption::default();
            let mut script = self
                .session
                .create_script(source, &mut options)
                .context("create FRIDA script")?;
            script
                .handle_message(ChannelHandler { handler })
                .context("register script message handler")?;
            script.load().context("load FRIDA script")?;
            Ok(FridaScript { script })
        }

        fn detach(&self) -> anyhow::Result<()> {
            self.session
                .detach()
                .context("detach FRIDA session")
        }
    }

    pub(super) struct FridaScript<'s> {
        script: Script<'s>,
    }

    impl AgentScript for FridaScript<'_> {
        fn post(&self, command: &str) -> anyhow::Result<()> {
            let message = serde_json::to_string(command)?;
            self.script
                .post(&message, None)
                .context("post command to agent")
        }

        fn unload(&mut self) -> anyhow::Result<()> {
            self.script
                .unload()
                .context("unload FRIDA script")
        }
    }

    struct ChannelHandler {
        handler: MessageHandler,
    }

    impl ScriptHandler for ChannelHandler {
        fn on_message(&mut self, message: &Message, _data: Option<Vec<u8>>) {
            let forwarded = match message {
                Message::Send(send) => send_payload(send),
                Message::Log(log) => Some(AgentMessage::Log {
                    level: format!("{:?}", log.level),
                    message: log.payload.clone(),
                }),
                Message::Error(err) => Some(AgentMessage::Error(err.description.clone())),
                // Plain `send({...})` payloads do not fit frida-rust's
                // RPC-shaped `MessageSend` and arrive raw.
                Message::Other(value) => AgentMessage::from_raw(value),
            };
            match forwarded {
                Some(message) => (self.handler)(message),
                None => tracing::debug!("dropping agent message without payload"),
            }
        }
    }

    fn send_payload(send: &MessageSend) -> Option<AgentMessage> {
        Some(AgentMessage::Payload(send.payload.returns.clone()))
    }
}
