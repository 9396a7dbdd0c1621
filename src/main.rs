use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use ipa_dumper::cli::Cli;
use ipa_dumper::completion::CancelToken;
use ipa_dumper::run_with_frida;
use ipa_dumper::signals::forward_termination_signals;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let Some(action) = cli.action() else {
        let _ = Cli::command().print_help();
        println!();
        return ExitCode::SUCCESS;
    };

    let cancel = CancelToken::new();
    if let Err(err) = forward_termination_signals(cancel.clone()) {
        tracing::warn!("Ctrl-C will not cancel cleanly: {err:#}");
    }

    let cfg = cli.to_config();
    match run_with_frida(&action, &cfg, &cancel) {
        Ok(Some(path)) => {
            println!("[+]  Wrote {}", path.display());
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[!]  {err}");
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                eprintln!("     caused by: {cause}");
                source = cause.source();
            }
            if let Some(hint) = err.hint() {
                eprintln!("[*]  {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
