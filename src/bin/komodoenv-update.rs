// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use komodoenv::{
    platform::Platform,
    update::{UpdateStatus, Updater},
};

use anyhow::{anyhow, Result};
use clap::Parser;
use std::{env, fs, process::exit};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(about, version)]
struct Cli {
    /// Check if this komodoenv can be updated.
    #[arg(long)]
    pub check: bool,
}

impl Cli {
    fn run(self) -> Result<i32> {
        // INVARIANT: Installed at <komodoenv>/root/bin/komodoenv-update.
        let exe = fs::canonicalize(env::current_exe()?)?;
        let dest = exe
            .ancestors()
            .nth(3)
            .ok_or_else(|| anyhow!("{:?} is not installed in a komodoenv", exe.display()))?;

        let platform = Platform::detect()?;
        let status = Updater::new(dest, platform).update(self.check)?;

        Ok(report(&status))
    }
}

/// Tell user about update status, yielding exit code.
///
/// Only a pending update that cannot be applied safely fails.
fn report(status: &UpdateStatus) -> i32 {
    match status {
        UpdateStatus::UpToDate => {}
        UpdateStatus::PlatformMismatch { expected, actual } => warn!(
            "current distribution {actual:?} does not match the one that was used \
             to generate this environment {expected:?}, you might need to recreate \
             this komodoenv"
        ),
        UpdateStatus::TrackMissing { tracked } => warn!(
            "not able to find the tracked komodo release {tracked}, will not update"
        ),
        UpdateStatus::Pending { release, safe: true } => warn!(
            "your komodoenv is out of date, to update to the latest komodo release \
             ({release}) run the following command:\n\n\tkomodoenv-update\n"
        ),
        UpdateStatus::Pending { safe: false, .. } => {
            error!("your komodoenv is out of date, you will need to recreate komodoenv");
            return 1;
        }
        UpdateStatus::Updated { release } => info!("komodoenv updated to {release}"),
    }

    0
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    match Cli::parse().run() {
        Ok(code) => exit(code),
        Err(error) => {
            error!("{error:?}");
            exit(1);
        }
    }
}
