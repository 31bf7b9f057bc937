// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Komodoenv materialization.
//!
//! A __komodoenv__ is a lightweight, writable Python environment layered on
//! top of a read-only komodo release. The user installs whatever they need
//! into the komodoenv, while everything else is borrowed from the release
//! through shims, activation scripts, and a fallback import finder.
//!
//! # Materialization Steps
//!
//! 1. Create the destination directory.
//! 2. Build an isolated interpreter environment at `<destination>/root`.
//! 3. Write the environment descriptor.
//! 4. Register the release's module search path as fallback import path.
//! 5. Install the update entry point, and run it once to generate shims and
//!    activation scripts.
//! 6. Install pip from bundled wheels, never from the network.
//! 7. Drop the shim of komodoenv itself, so the komodoenv never shadows it.
//!
//! Materialization cannot be resumed. If any step fails the destination is
//! left behind half-built, and must be removed before trying again.
//!
//! # See Also
//!
//! 1. [`Descriptor`]
//! 2. [`update`](crate::update)

pub mod toolchain;

pub use toolchain::PythonInfo;

use crate::{
    config::{ConfigError, Descriptor},
    environment::toolchain::{SystemPython, Toolchain, ToolchainError},
    file::{write_atomic, FileError, EXEC_MODE},
    path::Prefix,
    platform::Platform,
    scripts::{write_fallback_finder, ScriptError},
};

use indicatif::ProgressBar;
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// What to build, from what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentPlan {
    /// Komodo root the release was resolved against.
    pub komodo_root: PathBuf,

    /// Concrete release to build from.
    pub release: PathBuf,

    /// Track to follow for updates.
    pub track: PathBuf,

    /// Where to put the komodoenv.
    pub destination: PathBuf,
}

/// Komodoenv builder.
#[derive(Debug)]
pub struct Materializer<T = SystemPython>
where
    T: Toolchain,
{
    toolchain: T,
    platform: Platform,
    update_exe: PathBuf,
    bundle_dir: PathBuf,
    bar: ProgressBar,
}

impl<T> Materializer<T>
where
    T: Toolchain,
{
    /// Construct new komodoenv builder.
    ///
    /// The `update_exe` is the update entry point copied into every
    /// komodoenv, and `bundle_dir` holds the offline wheels to install.
    pub fn new(
        toolchain: T,
        platform: Platform,
        update_exe: impl Into<PathBuf>,
        bundle_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            toolchain,
            platform,
            update_exe: update_exe.into(),
            bundle_dir: bundle_dir.into(),
            bar: ProgressBar::hidden(),
        }
    }

    /// Report progress of each step through progress bar.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.bar = bar;
        self
    }

    /// Build komodoenv according to plan.
    ///
    /// Returns path to activation script fitting the user's shell.
    ///
    /// # Errors
    ///
    /// - Return [`MaterializeError::DestinationExists`] if destination is
    ///   already there.
    /// - Return [`MaterializeError::Toolchain`] if Python refuses to
    ///   cooperate.
    /// - Return [`MaterializeError::NoBundledWheel`] if pip is not bundled.
    /// - Return other [`MaterializeError`] variants on filesystem failures.
    #[instrument(skip(self), level = "debug")]
    pub async fn materialize(&self, plan: &EnvironmentPlan) -> Result<PathBuf> {
        let source = Prefix::new(&plan.release);
        let dest = Prefix::new(&plan.destination);

        self.step("create", dest.as_path());
        fs::create_dir(dest.as_path()).map_err(|err| match err.kind() {
            std::io::ErrorKind::AlreadyExists => MaterializeError::DestinationExists {
                path: plan.destination.clone(),
            },
            _ => io_error(err, dest.as_path()),
        })?;

        self.step("probe", &source.python());
        let info = self.toolchain.probe(&source).await?;
        let version = info.version();

        self.step("venv", &source.python());
        self.toolchain
            .create_venv(&source, &info, &dest.root())
            .await?;

        self.step("create", &dest.descriptor());
        let descriptor = Descriptor {
            tracked_release: file_name(&plan.track),
            current_release: source.name(),
            mtime_release: "0".into(),
            python_version: version.clone(),
            komodoenv_version: Some(env!("CARGO_PKG_VERSION").into()),
            komodo_root: plan.komodo_root.clone(),
            linux_dist: self.platform.fingerprint(),
            extra: Default::default(),
        };
        descriptor.store(dest.descriptor())?;

        let site_packages = dest.site_packages(&version);
        self.step("create", &site_packages.join("zzz_komodo.pth"));
        fs::create_dir_all(&site_packages).map_err(|err| io_error(err, &site_packages))?;
        write_fallback_finder(&site_packages, &release_site_paths(&info, &source))?;

        let update_exe = dest.update_exe();
        self.step("create", &update_exe);
        let binary = fs::read(&self.update_exe).map_err(|err| io_error(err, &self.update_exe))?;
        write_atomic(&update_exe, binary, EXEC_MODE)?;
        self.step("run", &update_exe);
        self.toolchain.run(&update_exe).await?;

        let pip = self.bundled_wheel("pip")?;
        self.step("install", &pip);
        self.toolchain
            .install_wheel(&dest.python(), &pip, &pip)
            .await?;

        let self_shim = dest.shims().join("komodoenv");
        if self_shim.is_file() {
            self.step("remove", &self_shim);
            fs::remove_file(&self_shim).map_err(|err| io_error(err, &self_shim))?;
        }

        self.bar.finish_and_clear();
        info!("komodoenv created at {:?}", dest.as_path().display());

        Ok(activation_script(&dest))
    }

    /// Locate newest bundled wheel of package.
    ///
    /// # Errors
    ///
    /// - Return [`MaterializeError::NoBundledWheel`] if no wheel is found.
    pub fn bundled_wheel(&self, package: &str) -> Result<PathBuf> {
        let pattern = format!(
            "{}/{package}-*.whl",
            glob::Pattern::escape(&self.bundle_dir.to_string_lossy())
        );
        let mut wheels = glob::glob(&pattern)
            .map_err(|err| MaterializeError::Pattern {
                source: err,
                pattern: pattern.clone(),
            })?
            .filter_map(std::result::Result::ok)
            .collect::<Vec<_>>();
        wheels.sort();

        wheels.pop().ok_or_else(|| MaterializeError::NoBundledWheel {
            package: package.into(),
            dir: self.bundle_dir.clone(),
        })
    }

    fn step(&self, action: &str, path: &Path) {
        debug!("{action:>10}    {}", path.display());
        self.bar.set_message(format!("{action} {}", path.display()));
    }
}

/// Entries of interpreter module search path that belong to the release.
///
/// Drops the komodoenv's own standard library location and unrelated
/// system paths, keeping only what lives under the release prefix.
pub fn release_site_paths(info: &PythonInfo, release: &Prefix) -> Vec<PathBuf> {
    let mut prefixes = vec![release.as_path().to_path_buf()];
    if let Ok(canonical) = fs::canonicalize(release.as_path()) {
        prefixes.push(canonical);
    }

    info.sys_path
        .iter()
        .filter(|path| prefixes.iter().any(|prefix| path.starts_with(prefix)))
        .cloned()
        .collect()
}

/// Activation script matching the user's login shell.
pub fn activation_script(dest: &Prefix) -> PathBuf {
    let shell = env::var("SHELL").unwrap_or_default();
    if shell.ends_with("csh") {
        dest.enable_csh()
    } else {
        dest.enable()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn io_error(source: std::io::Error, path: &Path) -> MaterializeError {
    MaterializeError::Io {
        source,
        path: path.to_path_buf(),
    }
}

/// Materialization error types.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    /// Destination already exists.
    #[error("destination directory already exists: {:?}", path.display())]
    DestinationExists { path: PathBuf },

    /// Filesystem operation fails.
    #[error("failed to access {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// No wheel of package was bundled.
    #[error("no bundled wheel of {package:?} in {:?}", dir.display())]
    NoBundledWheel { package: String, dir: PathBuf },

    /// Bundle directory makes for an invalid glob pattern.
    #[error("invalid wheel pattern {pattern:?}")]
    Pattern {
        #[source]
        source: glob::PatternError,
        pattern: String,
    },

    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Write(#[from] FileError),
}

/// Friendly result alias :3
pub type Result<T, E = MaterializeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn keep_only_release_paths() {
        let release = Prefix::new("/nonexistent/komodo/2030.01.00-py311");
        let info = PythonInfo {
            major: 3,
            minor: 11,
            sys_path: vec![
                PathBuf::from("/usr/lib/python311.zip"),
                PathBuf::from(
                    "/nonexistent/komodo/2030.01.00-py311/root/lib/python3.11/site-packages",
                ),
                PathBuf::from("/nonexistent/komodo/2030.01.00-py311-rhel8/root/lib"),
                PathBuf::from("/home/user/.local/lib/python3.11/site-packages"),
            ],
        };

        assert_eq!(
            release_site_paths(&info, &release),
            vec![PathBuf::from(
                "/nonexistent/komodo/2030.01.00-py311/root/lib/python3.11/site-packages"
            )]
        );
    }

    #[test]
    fn newest_bundled_wheel_wins() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for wheel in [
            "pip-23.3-py3-none-any.whl",
            "pip-24.0-py3-none-any.whl",
            "setuptools-69.0-py3-none-any.whl",
        ] {
            fs::write(dir.path().join(wheel), "")?;
        }

        let materializer = Materializer::new(
            SystemPython::default(),
            Platform::new("rhel", "8"),
            "/nonexistent/komodoenv-update",
            dir.path(),
        );
        assert_eq!(
            materializer.bundled_wheel("pip")?,
            dir.path().join("pip-24.0-py3-none-any.whl")
        );
        assert!(matches!(
            materializer.bundled_wheel("wheel"),
            Err(MaterializeError::NoBundledWheel { .. })
        ));

        Ok(())
    }
}
