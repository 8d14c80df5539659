//! # geotrackd
//!
//! Headless location tracker. See the library crate for the startup
//! sequence.

use std::process::ExitCode;

use clap::Parser;

use geotrack_daemon::{run, Options};

#[tokio::main]
async fn main() -> ExitCode {
    // usage errors exit with status 2
    let options = Options::parse();

    match run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "geotrackd failed");
            eprintln!("geotrackd: {err}");
            ExitCode::FAILURE
        }
    }
}
