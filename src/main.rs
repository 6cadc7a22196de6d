use camino::Utf8PathBuf;
use clap::Parser;
use std::process::ExitCode;
use std::sync::mpsc;
use veranda::Config;

/// A configurable, non-blocking HTTP/1.1 server.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file. The built-in default configuration
    /// is used when omitted.
    config: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("{error}");
                return ExitCode::from(1);
            }
        },
        None => Config::builtin(),
    };

    let handle = match veranda::start(config) {
        Ok(handle) => handle,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::from(2);
        }
    };

    // SIGINT flips the rendezvous; the loop winds down after its current
    // tick and the process exits cleanly.
    let (interrupt, interrupted) = mpsc::channel();
    if let Err(error) = ctrlc::set_handler(move || {
        let _ = interrupt.send(());
    }) {
        log::error!(error:err = error; "could not install the SIGINT handler");
        return ExitCode::from(2);
    }

    let _ = interrupted.recv();
    log::info!("interrupt received, shutting down");
    handle.stop();
    ExitCode::SUCCESS
}
