use std::thread;

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, Signal};

use crate::completion::CancelToken;
use crate::staging::remove_live_staging;

/// Routes SIGINT/SIGTERM to `token` from a dedicated thread. Must run before
/// any other thread is spawned so they all inherit the blocked mask.
///
/// A second signal while the run is already cancelling removes the live
/// staging areas and exits immediately.
pub fn forward_termination_signals(token: CancelToken) -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block().context("block termination signals")?;

    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || loop {
            match set.wait() {
                Ok(signal) => {
                    if token.is_cancelled() {
                        eprintln!("[!]  {} received again, exiting", signal.as_str());
                        remove_live_staging();
                        std::process::exit(130);
                    }
                    eprintln!("[!]  {} received, cancelling dump...", signal.as_str());
                    token.cancel();
                }
                Err(err) => {
                    tracing::warn!("signal wait failed: {err}");
                    break;
                }
            }
        })
        .context("spawn signal watcher")?;
    Ok(())
}
