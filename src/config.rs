// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the two configuration files komodoenv deals with:
//! the user's tool [`Settings`], and the [`Descriptor`] every komodoenv
//! carries around to remember what it tracks.

use crate::{
    file::{write_atomic, FileError, FILE_MODE},
    path::default_komodo_root,
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::{debug, instrument};

/// Tool settings layout.
///
/// Optional TOML file that changes komodoenv's defaults. Every field can be
/// left out. Path fields go through shell expansion, so `$HOME` and `~` work
/// as expected.
///
/// ```toml
/// root = "/prog/res/komodo"
/// probe_timeout = 60
/// bundle_dir = "~/.local/share/komodoenv/bundle"
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Komodo root to resolve releases against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Seconds to wait on any external process before giving up.
    pub probe_timeout: u64,

    /// Directory containing offline wheels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_dir: Option<PathBuf>,
}

impl Settings {
    /// Load settings from target path.
    ///
    /// Missing settings file simply means default settings.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if settings file exists, but cannot be
    ///   read.
    /// - Return [`ConfigError::Deserialize`] if settings are malformed.
    #[instrument(skip(path), level = "debug")]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            debug!("no settings at {:?}, using defaults", path.display());
            return Ok(Self::default());
        }

        read_to_string(path)
            .map_err(|err| ConfigError::Read {
                source: err,
                path: path.to_path_buf(),
            })?
            .parse()
    }

    /// Komodo root to use when none is given on the command line.
    pub fn komodo_root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(default_komodo_root)
    }

    /// Timeout for external processes.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: None,
            probe_timeout: 60,
            bundle_dir: None,
        }
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on path fields.
        settings.root = settings.root.map(expand_path).transpose()?;
        settings.bundle_dir = settings.bundle_dir.map(expand_path).transpose()?;

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Environment descriptor layout.
///
/// Every komodoenv carries a `komodoenv.conf` file at its top-level. This
/// file records which komodo release the komodoenv follows, which concrete
/// release it was last synchronized with, and the platform it was built for.
///
/// # General Layout
///
/// The descriptor is a flat listing of `key = value` lines. Lines without an
/// `=` are skipped, and unknown keys are carried along untouched so that
/// descriptors written by other komodoenv versions survive a round trip.
///
/// ```text
/// current-release = 2030.01.00-py311
/// tracked-release = stable-py311
/// mtime-release = 1893456000.0
/// python-version = 3.11
/// komodoenv-version = 1.0.0
/// komodo-root = /prog/res/komodo
/// linux-dist = rhel8
/// ```
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Descriptor {
    /// Track being followed, e.g., `stable-py311`.
    pub tracked_release: String,

    /// Concrete release the track pointed at during last synchronization.
    pub current_release: String,

    /// Modification time of the track at last synchronization.
    pub mtime_release: String,

    /// Python version as `major.minor`.
    pub python_version: String,

    /// Version of komodoenv that built the komodoenv.
    pub komodoenv_version: Option<String>,

    /// Komodo root used at creation time.
    pub komodo_root: PathBuf,

    /// Distribution identifier plus major version, e.g., `rhel8`.
    pub linux_dist: String,

    /// Keys this version of komodoenv does not know about.
    pub extra: BTreeMap<String, String>,
}

impl Descriptor {
    /// Read descriptor from target path.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if descriptor cannot be read.
    /// - Return [`ConfigError::MissingKey`] if required key is absent.
    #[instrument(skip(path), level = "debug")]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        read_to_string(path)
            .map_err(|err| ConfigError::Read {
                source: err,
                path: path.to_path_buf(),
            })?
            .parse()
    }

    /// Atomically write descriptor to target path.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Write`] if descriptor cannot be written.
    #[instrument(skip(self, path), level = "debug")]
    pub fn store(&self, path: impl AsRef<Path>) -> Result<()> {
        Ok(write_atomic(path, self.to_string(), FILE_MODE)?)
    }

    /// Track state recorded at last synchronization.
    pub fn track_state(&self) -> TrackState {
        TrackState {
            tracked_release: self.tracked_release.clone(),
            current_release: self.current_release.clone(),
            mtime_release: self.mtime_release.clone(),
        }
    }

    /// Replace recorded track state.
    pub fn with_track_state(mut self, state: TrackState) -> Self {
        self.tracked_release = state.tracked_release;
        self.current_release = state.current_release;
        self.mtime_release = state.mtime_release;
        self
    }
}

impl FromStr for Descriptor {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut entries = BTreeMap::new();
        for line in data.lines() {
            // INVARIANT: Skip lines we cannot make sense of.
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }

        let mut take = |key: &'static str| entries.remove(key);
        let require = |value: Option<String>, key: &'static str| {
            value.ok_or(ConfigError::MissingKey { key })
        };

        let tracked_release = require(take("tracked-release"), "tracked-release")?;
        let current_release = require(take("current-release"), "current-release")?;
        let python_version = require(take("python-version"), "python-version")?;
        let mtime_release = take("mtime-release").unwrap_or_else(|| "0".into());
        let komodoenv_version = take("komodoenv-version");
        let komodo_root = take("komodo-root")
            .map(PathBuf::from)
            .unwrap_or_else(default_komodo_root);
        let linux_dist = take("linux-dist").unwrap_or_default();

        Ok(Self {
            tracked_release,
            current_release,
            mtime_release,
            python_version,
            komodoenv_version,
            komodo_root,
            linux_dist,
            extra: entries,
        })
    }
}

impl Display for Descriptor {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        writeln!(fmt, "current-release = {}", self.current_release)?;
        writeln!(fmt, "tracked-release = {}", self.tracked_release)?;
        writeln!(fmt, "mtime-release = {}", self.mtime_release)?;
        writeln!(fmt, "python-version = {}", self.python_version)?;
        if let Some(version) = &self.komodoenv_version {
            writeln!(fmt, "komodoenv-version = {version}")?;
        }
        writeln!(fmt, "komodo-root = {}", self.komodo_root.display())?;
        writeln!(fmt, "linux-dist = {}", self.linux_dist)?;
        for (key, value) in &self.extra {
            writeln!(fmt, "{key} = {value}")?;
        }

        Ok(())
    }
}

/// The three descriptor fields that change when the upstream track moves.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct TrackState {
    pub tracked_release: String,
    pub current_release: String,
    pub mtime_release: String,
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to write configuration file.
    #[error(transparent)]
    Write(#[from] FileError),

    /// Required descriptor key is absent.
    #[error("environment descriptor is missing required key {key:?}")]
    MissingKey { key: &'static str },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    fn descriptor() -> Descriptor {
        Descriptor {
            tracked_release: "stable-py311".into(),
            current_release: "2030.01.00-py311".into(),
            mtime_release: "1893456000.25".into(),
            python_version: "3.11".into(),
            komodoenv_version: Some("1.0.0".into()),
            komodo_root: PathBuf::from("/prog/res/komodo"),
            linux_dist: "rhel8".into(),
            extra: BTreeMap::new(),
        }
    }

    #[sealed_test(env = [("KOMODO_TOP", "/prog/res")])]
    fn deserialize_settings() -> anyhow::Result<()> {
        let result: Settings = r#"
            root = "$KOMODO_TOP/komodo"
            probe_timeout = 5
        "#
        .parse()?;

        let expect = Settings {
            root: Some(PathBuf::from("/prog/res/komodo")),
            probe_timeout: 5,
            bundle_dir: None,
        };
        assert_eq!(result, expect);
        assert_eq!(result.probe_timeout(), Duration::from_secs(5));

        Ok(())
    }

    #[test]
    fn serialize_settings() {
        let result = Settings {
            root: Some(PathBuf::from("/prog/komodo")),
            ..Settings::default()
        }
        .to_string();

        let expect = indoc! {r#"
            root = "/prog/komodo"
            probe_timeout = 60
        "#};
        assert_eq!(result, expect);
    }

    #[test]
    fn missing_settings_file_means_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let result = Settings::load(dir.path().join("config.toml"))?;
        assert_eq!(result, Settings::default());
        Ok(())
    }

    #[test]
    fn deserialize_descriptor() -> anyhow::Result<()> {
        let result: Descriptor = indoc! {"
            current-release = 2030.01.00-py311
            tracked-release=stable-py311
            this line is garbage
            mtime-release = 1893456000.25
            python-version = 3.11
            komodoenv-version = 1.0.0
            komodo-root = /prog/res/komodo
            linux-dist = rhel8
        "}
        .parse()?;

        assert_eq!(result, descriptor());

        Ok(())
    }

    #[test]
    fn serialize_descriptor_keeps_unknown_keys() -> anyhow::Result<()> {
        let mut expect = descriptor();
        expect.extra.insert("future-key".into(), "a = b".into());

        let result = expect.to_string();
        assert_eq!(
            result,
            indoc! {"
                current-release = 2030.01.00-py311
                tracked-release = stable-py311
                mtime-release = 1893456000.25
                python-version = 3.11
                komodoenv-version = 1.0.0
                komodo-root = /prog/res/komodo
                linux-dist = rhel8
                future-key = a = b
            "}
        );
        assert_eq!(result.parse::<Descriptor>()?, expect);

        Ok(())
    }

    #[test]
    fn descriptor_optional_keys_use_defaults() -> anyhow::Result<()> {
        let result: Descriptor = indoc! {"
            current-release = 2030.01.00-py311
            tracked-release = stable-py311
            python-version = 3.11
        "}
        .parse()?;

        assert_eq!(result.mtime_release, "0");
        assert_eq!(result.komodoenv_version, None);
        assert_eq!(result.komodo_root, default_komodo_root());
        assert_eq!(result.linux_dist, "");

        Ok(())
    }

    #[test]
    fn descriptor_requires_tracked_release() {
        let result = "current-release = a\npython-version = 3.11\n".parse::<Descriptor>();
        assert!(matches!(
            result,
            Err(ConfigError::MissingKey {
                key: "tracked-release"
            })
        ));
    }

    #[test]
    fn descriptor_store_and_load() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("komodoenv.conf");
        descriptor().store(&path)?;
        assert_eq!(Descriptor::load(&path)?, descriptor());
        Ok(())
    }
}
