use std::fs;
use std::path::{Path, PathBuf};

use crate::assembler::{build_package, Archiver};
use crate::completion::{CancelToken, RunOutcome};
use crate::config::{Config, AGENT_START_COMMAND};
use crate::device::{AgentScript, AgentSession, TargetDevice};
use crate::error::{DumperError, Result};
use crate::resolver::resolve_target;
use crate::retrieval::{ArtifactFetcher, RemoteCopy};
use crate::router::{DumpContext, Manifest, MessageRouter};
use crate::staging::StagingArea;

/// Detaches the session when the run leaves scope, whatever the exit path.
struct SessionGuard<S: AgentSession> {
    session: S,
    released: bool,
}

impl<S: AgentSession> SessionGuard<S> {
    fn new(session: S) -> Self {
        Self {
            session,
            released: false,
        }
    }

    fn session(&self) -> &S {
        &self.session
    }

    fn release(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let pid = self.session.pid();
        match self.session.detach() {
            Ok(()) => tracing::debug!(pid, "session detached"),
            Err(err) => tracing::warn!(pid, "detach failed: {err:#}"),
        }
    }
}

impl<S: AgentSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Resolves `target`, runs the agent against it, and packages what it
/// produced. Returns the path of the written archive.
///
/// The staging area is created only after a session exists and is removed
/// on every exit path; a failure to remove it never hides an earlier error.
pub fn run_dump_workflow<D, R>(
    device: &D,
    remote: R,
    target: &str,
    cfg: &Config,
    archiver: &dyn Archiver,
    cancel: &CancelToken,
) -> Result<PathBuf>
where
    D: TargetDevice,
    R: RemoteCopy + 'static,
{
    let mut resolution = resolve_target(device, target)?;
    let guard = SessionGuard::new(resolution.require_session(target)?);

    let source = fs::read_to_string(&cfg.agent_script).map_err(|err| {
        DumperError::AgentLoad(format!("read {}: {err}", cfg.agent_script.display()))
    })?;
    let archive_name = cfg.archive_name(&resolution.display_name, target);
    let output = cfg.output_dir.join(&archive_name);

    let staging = match cfg.staging_dir.as_ref() {
        Some(base) => StagingArea::create_in(base)?,
        None => StagingArea::create()?,
    };

    let collected = collect_artifacts(
        guard.session(),
        remote,
        &source,
        &staging,
        &archive_name,
        cfg,
        cancel,
    );
    guard.release();
    let result = collected.and_then(|(outcome, manifest)| {
        package(outcome, &manifest, &staging, &output, cfg, archiver)
    });

    match staging.close() {
        Ok(()) => result,
        Err(close_err) => match result {
            Ok(_) => Err(close_err),
            Err(err) => {
                tracing::warn!("staging cleanup failed: {close_err}");
                Err(err)
            }
        },
    }
}

fn collect_artifacts<S, R>(
    session: &S,
    remote: R,
    source: &str,
    staging: &StagingArea,
    archive_name: &str,
    cfg: &Config,
    cancel: &CancelToken,
) -> Result<(RunOutcome, Manifest)>
where
    S: AgentSession,
    R: RemoteCopy + 'static,
{
    let ctx = DumpContext::new(cancel.clone());
    let fetcher = ArtifactFetcher::new(remote, staging.payload_dir(), cfg.show_progress);
    let router = MessageRouter::new(ctx.clone(), fetcher);

    let mut script = session
        .load_agent(source, router.into_handler())
        .map_err(|err| DumperError::AgentLoad(format!("{err:#}")))?;

    println!(
        "[*]  Dumping {archive_name} to {}",
        staging.payload_dir().display()
    );
    let outcome = match script.post(AGENT_START_COMMAND) {
        Ok(()) => ctx.gate().wait(),
        Err(err) => {
            let reason = format!("start agent: {err:#}");
            ctx.gate().fire(RunOutcome::CompletedWithErrors(vec![reason]));
            ctx.gate().wait()
        }
    };
    tracing::debug!(?outcome, "agent stream finished");

    if let Err(err) = script.unload() {
        tracing::warn!("unload agent failed: {err:#}");
    }
    // A copy still running on the delivery thread must finish or abort
    // before the staging area can be packaged or removed.
    ctx.wait_idle();
    Ok((outcome, ctx.snapshot()))
}

fn package(
    outcome: RunOutcome,
    manifest: &Manifest,
    staging: &StagingArea,
    output: &Path,
    cfg: &Config,
    archiver: &dyn Archiver,
) -> Result<PathBuf> {
    match outcome {
        RunOutcome::Completed => build_package(manifest, staging.payload_dir(), output, archiver),
        RunOutcome::CompletedWithErrors(failures) => {
            if cfg.allow_partial && manifest.app_dir().is_some() {
                eprintln!("[!]  Packaging partial dump, the archive may be incomplete");
                let path = build_package(manifest, staging.payload_dir(), output, archiver)?;
                println!("[*]  Partial archive written to {}", path.display());
            }
            Err(DumperError::TransferIncomplete(failures))
        }
        RunOutcome::Cancelled => Err(DumperError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::ZipArchiver;
    use crate::retrieval::{create_dir_level, report_progress, ProgressFn};
    use crate::testing::{app_message, done_message, dump_message, Call, FakeDevice, FakeRemote};
    use std::fs::File;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use zip::ZipArchive;

    const BUNDLE: &str = "/private/var/containers/Bundle/Application/0000/Example.app";

    struct Sandbox {
        _tmp: TempDir,
        cfg: Config,
    }

    impl Sandbox {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let script = tmp.path().join("dump.js");
            fs::write(&script, "recv(function () {});").unwrap();
            let out = tmp.path().join("out");
            let staging = tmp.path().join("staging");
            fs::create_dir_all(&out).unwrap();
            fs::create_dir_all(&staging).unwrap();
            let cfg = Config {
                agent_script: script,
                output_dir: out,
                staging_dir: Some(staging),
                show_progress: false,
                ..Config::default()
            };
            Self { _tmp: tmp, cfg }
        }

        fn staging_is_empty(&self) -> bool {
            let base = self.cfg.staging_dir.as_ref().unwrap();
            fs::read_dir(base).unwrap().next().is_none()
        }
    }

    fn example_remote() -> FakeRemote {
        FakeRemote::new()
            .with_file("/var/mobile/Documents/libFoo.dylib", b"decrypted foo")
            .with_dir(
                BUNDLE,
                &[
                    ("Info.plist", &b"plist"[..]),
                    ("libFoo.dylib", &b"encrypted foo"[..]),
                ],
            )
    }

    #[test]
    fn spawned_app_is_dumped_into_ipa() {
        let sandbox = Sandbox::new();
        let device = FakeDevice::new()
            .with_app(None, "Example", "com.example.app")
            .spawning_pid(4321)
            .emitting(vec![
                dump_message(
                    &format!("{BUNDLE}/libFoo.dylib"),
                    "/var/mobile/Documents/libFoo.dylib",
                ),
                app_message(BUNDLE),
                done_message(),
            ]);

        let output = run_dump_workflow(
            &device,
            example_remote(),
            "com.example.app",
            &sandbox.cfg,
            &ZipArchiver,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(output, sandbox.cfg.output_dir.join("Example.ipa"));
        let mut archive = ZipArchive::new(File::open(&output).unwrap()).unwrap();
        {
            let module = archive.by_name("Payload/Example.app/libFoo.dylib").unwrap();
            assert_eq!(module.unix_mode().unwrap() & 0o777, 0o655);
        }
        {
            let bundle = archive.by_name("Payload/Example.app/").unwrap();
            assert!(bundle.is_dir());
            assert_eq!(bundle.unix_mode().unwrap() & 0o777, 0o755);
        }
        let mut contents = String::new();
        std::io::Read::read_to_string(
            &mut archive.by_name("Payload/Example.app/libFoo.dylib").unwrap(),
            &mut contents,
        )
        .unwrap();
        assert_eq!(contents, "decrypted foo");

        let calls = device.calls();
        assert_eq!(
            &calls[..4],
            &[
                Call::Enumerate,
                Call::Spawn("com.example.app".to_string()),
                Call::Attach(4321),
                Call::Resume(4321),
            ]
        );
        assert!(calls.contains(&Call::Post(AGENT_START_COMMAND.to_string())));
        assert_eq!(calls.last(), Some(&Call::Detach(4321)));
        assert!(sandbox.staging_is_empty());
    }

    #[test]
    fn transfer_failure_ends_early_and_cleans_up() {
        let sandbox = Sandbox::new();
        let device = FakeDevice::new()
            .with_app(Some(77), "Example", "com.example.app")
            .emitting(vec![
                dump_message(&format!("{BUNDLE}/libGone.dylib"), "/var/mobile/libGone.dylib"),
                app_message(BUNDLE),
                done_message(),
            ]);

        let err = run_dump_workflow(
            &device,
            example_remote(),
            "Example",
            &sandbox.cfg,
            &ZipArchiver,
            &CancelToken::new(),
        )
        .unwrap_err();

        assert!(matches!(err, DumperError::TransferIncomplete(ref failures) if failures.len() == 1));
        assert!(!sandbox.cfg.output_dir.join("Example.ipa").exists());
        assert!(device.calls().contains(&Call::Detach(77)));
        assert!(sandbox.staging_is_empty());
    }

    #[test]
    fn partial_dump_is_packaged_on_request_but_still_fails() {
        let mut sandbox = Sandbox::new();
        sandbox.cfg.allow_partial = true;
        let device = FakeDevice::new()
            .with_app(Some(77), "Example", "com.example.app")
            .emitting(vec![
                app_message(BUNDLE),
                dump_message(&format!("{BUNDLE}/libGone.dylib"), "/var/mobile/libGone.dylib"),
            ]);

        let err = run_dump_workflow(
            &device,
            example_remote(),
            "com.example.app",
            &sandbox.cfg,
            &ZipArchiver,
            &CancelToken::new(),
        )
        .unwrap_err();

        assert!(matches!(err, DumperError::TransferIncomplete(_)));
        assert!(sandbox.cfg.output_dir.join("Example.ipa").is_file());
        assert!(sandbox.staging_is_empty());
    }

    #[test]
    fn numeric_attach_failure_never_stages() {
        let sandbox = Sandbox::new();
        let device = FakeDevice::new().failing_attach();

        let err = run_dump_workflow(
            &device,
            FakeRemote::new(),
            "31337",
            &sandbox.cfg,
            &ZipArchiver,
            &CancelToken::new(),
        )
        .unwrap_err();

        assert!(matches!(err, DumperError::AttachFailed { pid: 31337, .. }));
        assert!(err.is_fatal_before_start());
        assert_eq!(device.calls(), vec![Call::Attach(31337)]);
        assert!(sandbox.staging_is_empty());
    }

    #[test]
    fn unresolved_target_is_reported_as_missing_session() {
        let sandbox = Sandbox::new();
        let device = FakeDevice::new().failing_spawn();

        let err = run_dump_workflow(
            &device,
            FakeRemote::new(),
            "Nothing",
            &sandbox.cfg,
            &ZipArchiver,
            &CancelToken::new(),
        )
        .unwrap_err();

        assert!(matches!(err, DumperError::NoSession(ref target) if target == "Nothing"));
        assert!(!device.calls().iter().any(|c| matches!(c, Call::LoadAgent(_))));
    }

    #[test]
    fn cancellation_unblocks_the_wait() {
        let sandbox = Sandbox::new();
        // Agent never reports completion.
        let device = FakeDevice::new()
            .with_app(Some(5), "Example", "com.example.app")
            .emitting(Vec::new());
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            canceller.cancel();
        });

        let err = run_dump_workflow(
            &device,
            FakeRemote::new(),
            "Example",
            &sandbox.cfg,
            &ZipArchiver,
            &cancel,
        )
        .unwrap_err();
        handle.join().unwrap();

        assert!(matches!(err, DumperError::Cancelled));
        assert!(device.calls().contains(&Call::Unload));
        assert!(device.calls().contains(&Call::Detach(5)));
        assert!(sandbox.staging_is_empty());
    }

    /// Remote whose bundle copy takes a while. A cooperative copy checks for
    /// stop requests every step; otherwise it ignores them and finishes.
    struct SlowRemote {
        steps: u32,
        cooperative: bool,
    }

    impl RemoteCopy for SlowRemote {
        fn fetch(
            &self,
            remote: &str,
            local_dir: &Path,
            _recursive: bool,
            progress: &mut ProgressFn<'_>,
        ) -> anyhow::Result<()> {
            let total = u64::from(self.steps);
            for step in 0..total {
                thread::sleep(Duration::from_millis(10));
                if self.cooperative {
                    report_progress(progress, remote, total, step)?;
                }
            }
            let bundle = local_dir.join("Example.app");
            create_dir_level(&bundle)?;
            fs::write(bundle.join("Info.plist"), b"plist")?;
            Ok(())
        }
    }

    fn cancel_during_bundle_copy(remote: SlowRemote) -> (DumperError, Duration, Sandbox) {
        let sandbox = Sandbox::new();
        let device = FakeDevice::new()
            .with_app(Some(9), "Example", "com.example.app")
            .emitting(vec![app_message(BUNDLE), done_message()]);
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let started = Instant::now();
        let err = run_dump_workflow(&device, remote, "Example", &sandbox.cfg, &ZipArchiver, &cancel)
            .unwrap_err();
        let elapsed = started.elapsed();
        handle.join().unwrap();
        assert!(device.calls().contains(&Call::Detach(9)));
        (err, elapsed, sandbox)
    }

    #[test]
    fn cancelled_copy_never_outlives_staging_cleanup() {
        let (err, _, sandbox) = cancel_during_bundle_copy(SlowRemote {
            steps: 30,
            cooperative: false,
        });
        assert!(matches!(err, DumperError::Cancelled));
        assert!(sandbox.staging_is_empty());
        thread::sleep(Duration::from_millis(600));
        assert!(sandbox.staging_is_empty());
    }

    #[test]
    fn cancellation_aborts_copy_in_progress() {
        let (err, elapsed, sandbox) = cancel_during_bundle_copy(SlowRemote {
            steps: 500,
            cooperative: true,
        });
        assert!(matches!(err, DumperError::Cancelled));
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
        assert!(sandbox.staging_is_empty());
    }

    #[test]
    fn missing_agent_script_fails_before_staging() {
        let mut sandbox = Sandbox::new();
        sandbox.cfg.agent_script = Path::new("/nonexistent/dump.js").to_path_buf();
        let device = FakeDevice::new().with_app(Some(5), "Example", "com.example.app");

        let err = run_dump_workflow(
            &device,
            FakeRemote::new(),
            "Example",
            &sandbox.cfg,
            &ZipArchiver,
            &CancelToken::new(),
        )
        .unwrap_err();

        assert!(matches!(err, DumperError::AgentLoad(_)));
        assert!(device.calls().contains(&Call::Detach(5)));
        assert!(sandbox.staging_is_empty());
    }
}
