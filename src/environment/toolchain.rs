// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Python toolchain used to build komodoenvs.
//!
//! Komodoenv does not know how to build a Python environment itself. It asks
//! the release's own interpreter to do so through the [`Toolchain`] layer of
//! indirection, which keeps the materialization logic testable without a
//! real interpreter around.

use crate::{
    path::Prefix,
    process::{syscall_capture, syscall_quiet, ProcessError},
};

use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::process::Command;
use tracing::{debug, instrument};

const PROBE_SCRIPT: &str =
    "import sys; print('%d.%d' % sys.version_info[:2]); print('\\n'.join(sys.path))";

/// What a Python interpreter reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonInfo {
    pub major: u32,
    pub minor: u32,

    /// Module search path, i.e., `sys.path`.
    pub sys_path: Vec<PathBuf>,
}

impl PythonInfo {
    /// Version as `major.minor`.
    pub fn version(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }

    /// Parse output of the probe script.
    pub fn parse(output: &str) -> Option<Self> {
        let mut lines = output.lines();
        let (major, minor) = lines.next()?.trim().split_once('.')?;
        let sys_path = lines
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect();

        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
            sys_path,
        })
    }
}

/// Layer of indirection for Python interpreter interaction.
#[allow(async_fn_in_trait)]
pub trait Toolchain {
    /// Ask interpreter of release for its version and module search path.
    async fn probe(&self, release: &Prefix) -> Result<PythonInfo>;

    /// Build isolated environment at `target` based on release interpreter.
    ///
    /// The environment must come without pip.
    async fn create_venv(&self, release: &Prefix, info: &PythonInfo, target: &Path) -> Result<()>;

    /// Install wheel into environment of `python` without network access.
    async fn install_wheel(&self, python: &Path, pip_wheel: &Path, wheel: &Path) -> Result<()>;

    /// Run executable once.
    async fn run(&self, executable: &Path) -> Result<()>;
}

/// Toolchain backed by the system's processes.
#[derive(Debug, Clone)]
pub struct SystemPython {
    timeout: Duration,
}

impl SystemPython {
    /// Construct new system toolchain.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemPython {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl Toolchain for SystemPython {
    #[instrument(skip(self), level = "debug")]
    async fn probe(&self, release: &Prefix) -> Result<PythonInfo> {
        let [lib, lib64] = release.lib_dirs();
        let output = syscall_capture(
            Command::new(release.python())
                .args(["-c", PROBE_SCRIPT])
                .env("PATH", prepend_path(release.bin(), env::var_os("PATH")))
                .env("LD_LIBRARY_PATH", join_paths([lib64, lib])),
            self.timeout,
        )
        .await?;

        PythonInfo::parse(&output).ok_or_else(|| ToolchainError::Probe {
            python: release.python(),
            output,
        })
    }

    #[instrument(skip(self, info), level = "debug")]
    async fn create_venv(&self, release: &Prefix, info: &PythonInfo, target: &Path) -> Result<()> {
        let python = release.bin().join(format!("python{}", info.version()));
        debug!("create venv at {:?} using {:?}", target.display(), python.display());

        let [lib, lib64] = release.lib_dirs();
        let mut libs = vec![lib, lib64];
        if let Some(existing) = env::var_os("LD_LIBRARY_PATH") {
            libs.extend(env::split_paths(&existing));
        }

        Ok(syscall_quiet(
            Command::new(python)
                .args(["-m", "venv", "--copies", "--without-pip"])
                .arg(target)
                .env("LD_LIBRARY_PATH", join_paths(libs)),
            self.timeout,
        )
        .await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn install_wheel(&self, python: &Path, pip_wheel: &Path, wheel: &Path) -> Result<()> {
        Ok(syscall_quiet(
            Command::new(python)
                .args([
                    "-m",
                    "pip",
                    "install",
                    "--no-cache-dir",
                    "--no-deps",
                    "--no-index",
                    "--disable-pip-version-check",
                ])
                .arg(wheel)
                .env("PYTHONPATH", pip_wheel),
            self.timeout,
        )
        .await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn run(&self, executable: &Path) -> Result<()> {
        Ok(syscall_quiet(&mut Command::new(executable), self.timeout).await?)
    }
}

fn prepend_path(dir: PathBuf, existing: Option<OsString>) -> OsString {
    let mut dirs = vec![dir];
    if let Some(existing) = existing {
        dirs.extend(env::split_paths(&existing));
    }
    join_paths(dirs)
}

fn join_paths(paths: impl IntoIterator<Item = PathBuf>) -> OsString {
    // INVARIANT: Paths with ':' in them cannot be joined, so skip them.
    let paths: Vec<PathBuf> = paths
        .into_iter()
        .filter(|path| !path.to_string_lossy().contains(':'))
        .collect();
    env::join_paths(paths).unwrap_or_default()
}

/// Python toolchain error types.
#[derive(Debug, thiserror::Error)]
pub enum ToolchainError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("cannot make sense of {:?} reporting {output:?}", python.display())]
    Probe { python: PathBuf, output: String },
}

/// Friendly result alias :3
pub type Result<T, E = ToolchainError> = std::result::Result<T, E>;
