// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Release resolution.
//!
//! Figure out which concrete release a user asked for, and which track a
//! komodoenv built from it should follow for future updates.
//!
//! # Confirmation Search
//!
//! Release names cannot be trusted on their own. A release's enable script
//! may activate an interpreter living anywhere, and track symlinks may point
//! at releases with similar, but unrelated names. Thus, resolution first asks
//! the release's own enable script which interpreter it activates, and then
//! only accepts a track if following its symlinks leads back to the very same
//! release directory.

use crate::{
    platform::Platform,
    process::{syscall_capture, ProcessError},
    release::{
        naming::{candidate_paths, decompose, find_custom_coordinate},
        TRACKS,
    },
};

use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};
use tokio::process::Command;
use tracing::{debug, info, instrument};

static PYTHON_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Python (\d+)\.(\d+)").expect("valid python version regex"));

static QUALIFIERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?)(?:-py[0-9]+)?(?:-rhel[0-9]+)?$").expect("valid qualifier regex")
});

/// Outcome of release resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Concrete release directory to build the komodoenv from.
    pub release: PathBuf,

    /// Track to follow for future updates.
    pub track: PathBuf,
}

/// Interpreter that a release's enable script activates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivatedPython {
    /// Path reported by the shell for `python`.
    pub executable: PathBuf,

    /// Output of `python --version`.
    pub version: String,
}

impl ActivatedPython {
    /// Release directory owning the interpreter (`<release>/root/bin/python`).
    pub fn release_dir(&self) -> Option<PathBuf> {
        self.executable.ancestors().nth(3).map(Path::to_path_buf)
    }

    /// Interpreter qualifier for release names, e.g., `-py311`.
    pub fn python_suffix(&self) -> Option<String> {
        let captures = PYTHON_VERSION.captures(&self.version)?;
        Some(format!("-py{}{}", &captures[1], &captures[2]))
    }
}

/// Release resolver over a komodo root.
#[derive(Debug, Clone)]
pub struct Resolver {
    root: PathBuf,
    platform: Platform,
    timeout: Duration,
}

impl Resolver {
    /// Construct new release resolver.
    pub fn new(root: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            root: root.into(),
            platform,
            timeout: Duration::from_secs(60),
        }
    }

    /// Bound the time the enable script probe may take.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve release name into concrete release and track.
    ///
    /// With `no_update` the komodoenv follows exactly what the release
    /// activates right now, forever, so release and track are the same.
    ///
    /// # Errors
    ///
    /// - Return [`ResolveError::InvalidRoot`] if root is not a directory.
    /// - Return [`ResolveError::InvalidRelease`] if release lacks an enable
    ///   script.
    /// - Return [`ResolveError::Probe`], [`ResolveError::MalformedRelease`],
    ///   or [`ResolveError::PythonVersion`] if the enable script does not
    ///   activate a usable interpreter.
    /// - Return [`ResolveError::NoTrack`] if no track leads back to the
    ///   activated release.
    #[instrument(skip(self), level = "debug")]
    pub async fn resolve(&self, name: &str, no_update: bool) -> Result<Resolution> {
        if !self.root.is_dir() {
            return Err(ResolveError::InvalidRoot {
                path: self.root.clone(),
            });
        }

        let release = self.root.join(name);
        if !release.join("enable").is_file() {
            return Err(ResolveError::InvalidRelease { path: release });
        }

        let python = self.probe(&release).await?;
        let actual = python
            .release_dir()
            .ok_or_else(|| ResolveError::MalformedRelease {
                path: release.clone(),
                reason: format!("interpreter {:?} is not inside root/bin", python.executable),
            })?;
        debug!("{:?} activates {:?}", release.display(), actual.display());

        if no_update {
            return Ok(Resolution {
                release: actual.clone(),
                track: actual,
            });
        }

        let pyver = python
            .python_suffix()
            .ok_or_else(|| ResolveError::PythonVersion {
                path: release.clone(),
                output: python.version.clone(),
            })?;
        let base = QUALIFIERS
            .captures(name)
            .and_then(|captures| captures.get(1))
            .map(|base| base.as_str())
            .unwrap_or(name);
        info!("looking for {base}{pyver}");

        let suffix = self.platform.suffix();
        let mut tried = Vec::new();
        for mode in TRACKS {
            let track = self.root.join(format!("{mode}{pyver}"));
            tried.push(format!("{mode}{pyver}"));

            for rhver in ["", suffix.as_str()] {
                let Some(dir) = self.candidate(&track, &format!("{mode}{pyver}{rhver}")) else {
                    continue;
                };

                let Ok(target) = fs::canonicalize(&dir) else {
                    continue;
                };
                if target.file_name() == actual.file_name() {
                    debug!("{:?} confirms {:?}", track.display(), target.display());
                    return Ok(Resolution {
                        release: target,
                        track,
                    });
                }
            }
        }

        Err(ResolveError::NoTrack {
            tried: tried.join(", "),
        })
    }

    fn candidate(&self, track: &Path, name: &str) -> Option<PathBuf> {
        let dir = self.root.join(name);
        if dir.join("root").is_dir() {
            return Some(dir);
        }

        // INVARIANT: Platform specific releases sit next to the track's
        // target, since tracks like `stable-py311-rhel8` need not exist.
        let target = fs::canonicalize(track).ok()?;
        let mut name = target.file_name()?.to_os_string();
        name.push(self.platform.suffix());
        let dir = target.with_file_name(name);

        dir.join("root").is_dir().then_some(dir)
    }

    /// Ask release's enable script which interpreter it activates.
    ///
    /// # Errors
    ///
    /// - Return [`ResolveError::Probe`] if the shell fails or hangs.
    /// - Return [`ResolveError::MalformedRelease`] if output is not exactly
    ///   the interpreter path followed by its version.
    #[instrument(skip(self), level = "debug")]
    pub async fn probe(&self, release: &Path) -> Result<ActivatedPython> {
        let enable = release.join("enable");
        let script = format!(
            "source {};command -v python;python --version",
            shell_quote(&enable)
        );

        let output = syscall_capture(
            Command::new("/bin/bash")
                .args(["-c", script.as_str()])
                .env_remove("BASH_ENV"),
            self.timeout,
        )
        .await?;

        let lines: Vec<&str> = output.lines().collect();
        match lines.as_slice() {
            [executable, version] => Ok(ActivatedPython {
                executable: PathBuf::from(executable.trim()),
                version: version.trim().to_string(),
            }),
            _ => Err(ResolveError::MalformedRelease {
                path: release.to_path_buf(),
                reason: format!("expected exactly 2 lines, but got {}", lines.len()),
            }),
        }
    }
}

/// Find concrete release a track currently leads to.
///
/// Restricted form of resolution used once a komodoenv exists: the python
/// qualifier is already fixed, so only platform and custom coordinate need
/// to be matched. `track` must already be resolved through its symlinks.
pub fn find_tracked_release(track: impl AsRef<Path>, platform_suffix: &str) -> Option<PathBuf> {
    let track = track.as_ref();
    let parent = track.parent()?;
    let name = track.file_name()?.to_string_lossy().into_owned();
    let parts = decompose(&name);
    let custom = find_custom_coordinate(track);

    candidate_paths(
        parent.join(parts.base_release()),
        &parts.python,
        platform_suffix,
        &custom,
    )
    .into_iter()
    .filter_map(|candidate| fs::canonicalize(candidate).ok())
    .find(|candidate| candidate.join("root").is_dir())
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

/// Release resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// Komodo root is not a directory.
    #[error("{:?} is not a directory", path.display())]
    InvalidRoot { path: PathBuf },

    /// Release lacks an enable script.
    #[error("{:?} is not a valid komodo release", path.display())]
    InvalidRelease { path: PathBuf },

    /// Enable script could not be run.
    #[error("failed to probe enable script of komodo release")]
    Probe(#[from] ProcessError),

    /// Enable script did not activate a sensible interpreter.
    #[error("komodo release {:?} is malformed: {reason}", path.display())]
    MalformedRelease { path: PathBuf, reason: String },

    /// Activated interpreter reported a version we cannot parse.
    #[error("cannot detect python version of {:?} from {output:?}", path.display())]
    PythonVersion { path: PathBuf, output: String },

    /// No track leads back to the activated release.
    #[error(
        "could not automatically detect an appropriate komodo release to track (tried: {tried})\n\
         use --no-update to make a komodoenv of a singular release"
    )]
    NoTrack { tried: String },
}

/// Friendly result alias :3
pub type Result<T, E = ResolveError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;
    use std::os::unix::fs::symlink;

    #[test_case("Python 3.11.4", Some("-py311"); "three eleven")]
    #[test_case("Python 2.7.18", Some("-py27"); "two seven")]
    #[test_case("Python 3.8", Some("-py38"); "no patch")]
    #[test_case("nonsense", None; "garbage")]
    #[test]
    fn python_suffix(version: &str, expect: Option<&str>) {
        let python = ActivatedPython {
            executable: PathBuf::from("/k/2030.01.00-py311/root/bin/python"),
            version: version.into(),
        };
        pretty_assertions::assert_eq!(python.python_suffix().as_deref(), expect);
    }

    #[test]
    fn release_dir_of_interpreter() {
        let python = ActivatedPython {
            executable: PathBuf::from("/k/2030.01.00-py311/root/bin/python"),
            version: "Python 3.11.4".into(),
        };
        pretty_assertions::assert_eq!(
            python.release_dir(),
            Some(PathBuf::from("/k/2030.01.00-py311"))
        );
    }

    #[test]
    fn quote_paths_for_bash() {
        pretty_assertions::assert_eq!(shell_quote(Path::new("/k/it's")), r"'/k/it'\''s'");
    }

    #[test]
    fn tracked_release_prefers_platform_and_coordinate() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = fs::canonicalize(dir.path())?;
        for name in [
            "2025.04.01-py311",
            "2025.04.01-py311-rhel8",
            "2025.04.01-py311-rhel8-numpy1",
        ] {
            fs::create_dir_all(root.join(name).join("root"))?;
        }
        symlink("2025.04.01-py311-rhel8-numpy1", root.join("testing-py311"))?;

        let track = fs::canonicalize(root.join("testing-py311"))?;
        let result = find_tracked_release(&track, "-rhel8");
        pretty_assertions::assert_eq!(result, Some(root.join("2025.04.01-py311-rhel8-numpy1")));

        Ok(())
    }

    #[test]
    fn tracked_release_falls_back_to_platform() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = fs::canonicalize(dir.path())?;
        fs::create_dir_all(root.join("2030.01.00-py311-rhel9").join("root"))?;

        // Redirect release without root, declaring an empty coordinate.
        fs::create_dir(root.join("2030.01.00-py311"))?;
        fs::write(
            root.join("2030.01.00-py311").join("enable"),
            "CUSTOM_COORDINATE=\"\"\n",
        )?;

        let result = find_tracked_release(root.join("2030.01.00-py311"), "-rhel9");
        pretty_assertions::assert_eq!(result, Some(root.join("2030.01.00-py311-rhel9")));
        pretty_assertions::assert_eq!(
            find_tracked_release(root.join("2030.01.00-py311"), "-rhel8"),
            None
        );

        Ok(())
    }
}
