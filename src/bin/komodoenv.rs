// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use komodoenv::{
    config::Settings,
    environment::{toolchain::SystemPython, EnvironmentPlan, Materializer},
    path::{default_settings_path, UPDATE_EXE},
    platform::{is_nfs, Platform},
    release::{resolve::Resolver, Maturity},
};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::{
    env, fs,
    path::{absolute, Path, PathBuf},
    process::exit,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(about, version, override_usage = "komodoenv [options] <destination>")]
struct Cli {
    /// Overwrite existing komodoenv.
    #[arg(short, long)]
    pub force: bool,

    /// Komodo release to base komodoenv on [default: $KOMODO_RELEASE, or bleeding].
    #[arg(short, long, value_name = "name|path")]
    pub release: Option<String>,

    /// Komodo release on which to base updates.
    #[arg(short, long, value_name = "name|path")]
    pub track: Option<String>,

    /// Disable update mechanism, required for komodoenvs of singular releases.
    #[arg(long)]
    pub no_update: bool,

    /// Absolute path to komodo root [default: /prog/komodo, or /prog/res/komodo].
    #[arg(long, value_name = "path")]
    pub root: Option<PathBuf>,

    /// Where to create komodoenv.
    #[arg(value_name = "destination")]
    pub destination: PathBuf,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let settings = Settings::load(default_settings_path()?)?;
        let root = self.root.clone().unwrap_or_else(|| settings.komodo_root());
        if !root.is_dir() {
            return Err(anyhow!("the given root {:?} is not a directory", root.display()));
        }

        let platform = Platform::detect()?;
        let (release, track) = match self.requested(&root)? {
            (release, Some(track)) => (release, track),
            (release, None) => {
                let name = release.strip_prefix(&root).unwrap_or(&release);
                let resolution = Resolver::new(&root, platform.clone())
                    .with_timeout(settings.probe_timeout())
                    .resolve(&name.to_string_lossy(), self.no_update)
                    .await?;
                (resolution.release, resolution.track)
            }
        };
        if !release.is_dir() {
            return Err(anyhow!(
                "could not detect active komodo release, either enable a komodo release \
                 that supports komodoenv or specify one with --release"
            ));
        }

        let destination = absolute(&self.destination)?;
        if destination.is_dir() && self.force {
            fs::remove_dir_all(&destination)
                .with_context(|| format!("failed to remove {:?}", destination.display()))?;
        } else if destination.is_dir() {
            return Err(anyhow!(
                "destination directory already exists: {:?}",
                destination.display()
            ));
        }

        info!(
            "if you encounter issues with the jupyter environment or the rips package, \
             try running komodoenv-update or sourcing the komodoenv again"
        );
        let maturity = Maturity::of_track(&track);
        if maturity.is_concerning() {
            warn!("{maturity}");
        } else {
            info!("{maturity}");
        }

        let parent = destination.parent().unwrap_or(&destination);
        if is_nfs(parent) == Some(false) {
            warn!(
                "komodoenv target directory is not located on an NFS filesystem, \
                 be aware that multi-machine workloads via e.g. LSF might not work correctly"
            );
        }

        let exe = env::current_exe()?;
        let exe_dir = exe
            .parent()
            .ok_or_else(|| anyhow!("cannot locate directory of {:?}", exe.display()))?;
        let bundle_dir = settings
            .bundle_dir
            .clone()
            .unwrap_or_else(|| exe_dir.join("..").join("share").join("komodoenv").join("bundle"));

        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
        bar.enable_steady_tick(Duration::from_millis(100));

        let plan = EnvironmentPlan {
            komodo_root: root,
            release,
            track,
            destination,
        };
        let enable = Materializer::new(
            SystemPython::new(settings.probe_timeout()),
            platform,
            exe_dir.join(UPDATE_EXE),
            bundle_dir,
        )
        .with_progress(bar)
        .materialize(&plan)
        .await?;

        info!("komodoenv has been created, to use it run:\n\n\tsource {}\n", enable.display());

        Ok(())
    }

    /// Release and track named on the command line.
    ///
    /// An explicit track is taken as is and skips resolution, with release
    /// falling back to `$KOMODO_RELEASE`, or bleeding.
    fn requested(&self, root: &Path) -> Result<(PathBuf, Option<PathBuf>)> {
        let release = self
            .release
            .clone()
            .or_else(|| env::var("KOMODO_RELEASE").ok())
            .unwrap_or_else(|| "bleeding".into());
        let release = release_path(root, &release)?;
        let track = self
            .track
            .as_deref()
            .map(|track| release_path(root, track))
            .transpose()?;

        Ok((release, track))
    }
}

/// Names with a slash in them are paths, anything else lives under root.
fn release_path(root: &Path, name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        Ok(absolute(name)?)
    } else {
        Ok(root.join(name))
    }
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    use sealed_test::prelude::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("komodoenv").chain(args.iter().copied()))
    }

    #[sealed_test(env = [("KOMODO_RELEASE", "2030.01.00-py311")])]
    fn explicit_track_skips_resolution() -> anyhow::Result<()> {
        let root = Path::new("/prog/res/komodo");
        let cli = parse(&["-t", "2030.01.01-py311", "kenv"]);

        let (release, track) = cli.requested(root)?;
        pretty_assertions::assert_eq!(release, root.join("2030.01.00-py311"));
        pretty_assertions::assert_eq!(track, Some(root.join("2030.01.01-py311")));

        Ok(())
    }

    #[sealed_test]
    fn explicit_track_defaults_release_to_bleeding() -> anyhow::Result<()> {
        env::remove_var("KOMODO_RELEASE");
        let root = Path::new("/prog/res/komodo");
        let cli = parse(&["--track", "/opt/komodo/stable-py311", "kenv"]);

        let (release, track) = cli.requested(root)?;
        pretty_assertions::assert_eq!(release, root.join("bleeding"));
        pretty_assertions::assert_eq!(track, Some(PathBuf::from("/opt/komodo/stable-py311")));

        Ok(())
    }

    #[test]
    fn release_alone_is_resolved() -> anyhow::Result<()> {
        let root = Path::new("/prog/res/komodo");
        let cli = parse(&["-r", "stable", "kenv"]);

        let (release, track) = cli.requested(root)?;
        pretty_assertions::assert_eq!(release, root.join("stable"));
        pretty_assertions::assert_eq!(track, None);

        Ok(())
    }
}
