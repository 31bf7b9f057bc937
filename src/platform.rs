// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Platform identity and filesystem probes.
//!
//! Komodo releases are built per operating system major version, and name
//! themselves accordingly, e.g., `2030.01.00-py311-rhel8`. A komodoenv
//! remembers the platform it was built on, because binaries built for one
//! distribution cannot be trusted to run on another.

use std::{
    env,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Environment variable overriding platform detection, e.g., `rhel8`.
pub const PLATFORM_OVERRIDE: &str = "KOMODOENV_LINUX_DIST";

/// Operating system distribution identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    id: String,
    major: String,
}

impl Platform {
    /// Construct new platform identity.
    pub fn new(id: impl Into<String>, major: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            major: major.into(),
        }
    }

    /// Detect platform of running host.
    ///
    /// Honors [`PLATFORM_OVERRIDE`] first, then falls back to reading
    /// `/etc/os-release`.
    ///
    /// # Errors
    ///
    /// - Return [`PlatformError`] if no identity can be determined.
    pub fn detect() -> Result<Self> {
        if let Ok(fingerprint) = env::var(PLATFORM_OVERRIDE) {
            debug!("platform overridden through {PLATFORM_OVERRIDE}={fingerprint}");
            return Self::from_fingerprint(&fingerprint)
                .ok_or(PlatformError::Override { fingerprint });
        }

        Self::from_os_release("/etc/os-release")
    }

    /// Read platform from an os-release(5) file.
    ///
    /// # Errors
    ///
    /// - Return [`PlatformError::Read`] if file cannot be read.
    /// - Return [`PlatformError::Incomplete`] if `ID` or `VERSION_ID` is absent.
    pub fn from_os_release(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = read_to_string(path).map_err(|err| PlatformError::Read {
            source: err,
            path: path.to_path_buf(),
        })?;

        let mut id = None;
        let mut version = None;
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            match key.trim() {
                "ID" => id = Some(value.to_string()),
                "VERSION_ID" => version = Some(value.to_string()),
                _ => continue,
            }
        }

        match (id, version) {
            (Some(id), Some(version)) => {
                let major = version.split('.').next().unwrap_or_default().to_string();
                Ok(Self::new(id, major))
            }
            _ => Err(PlatformError::Incomplete {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Parse fingerprint like `rhel8` into identity and major version.
    pub fn from_fingerprint(fingerprint: &str) -> Option<Self> {
        let split = fingerprint.find(|c: char| c.is_ascii_digit())?;
        let (id, major) = fingerprint.split_at(split);
        if id.is_empty() || !major.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        Some(Self::new(id, major))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn major(&self) -> &str {
        &self.major
    }

    /// Identity and major version glued together, e.g., `rhel8`.
    pub fn fingerprint(&self) -> String {
        format!("{}{}", self.id, self.major)
    }

    /// Release name suffix for this platform, e.g., `-rhel8`.
    pub fn suffix(&self) -> String {
        format!("-{}", self.fingerprint())
    }
}

impl Display for Platform {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.fingerprint())
    }
}

/// Check if path lives on an NFS mount.
///
/// Walks up to the closest existing ancestor first, since the path itself
/// usually does not exist yet. Returns `None` when the filesystem type
/// cannot be determined.
#[cfg(target_os = "linux")]
pub fn is_nfs(path: impl AsRef<Path>) -> Option<bool> {
    use nix::sys::statfs::{statfs, NFS_SUPER_MAGIC};

    let mut path = path.as_ref();
    while !path.is_dir() {
        path = path.parent()?;
    }

    statfs(path)
        .ok()
        .map(|stat| stat.filesystem_type() == NFS_SUPER_MAGIC)
}

#[cfg(not(target_os = "linux"))]
pub fn is_nfs(_path: impl AsRef<Path>) -> Option<bool> {
    None
}

/// Platform detection error types.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("failed to read platform identity from {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("platform identity in {:?} lacks ID or VERSION_ID", path.display())]
    Incomplete { path: PathBuf },

    #[error("{PLATFORM_OVERRIDE}={fingerprint:?} is not of the form <id><major>, e.g., rhel8")]
    Override { fingerprint: String },
}

/// Friendly result alias :3
pub type Result<T, E = PlatformError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;

    #[test]
    fn read_os_release() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("os-release");
        std::fs::write(
            &path,
            indoc! {r#"
                NAME="Red Hat Enterprise Linux"
                VERSION="8.10 (Ootpa)"
                ID="rhel"
                ID_LIKE="fedora"
                VERSION_ID="8.10"
            "#},
        )?;

        let result = Platform::from_os_release(&path)?;
        pretty_assertions::assert_eq!(result, Platform::new("rhel", "8"));
        pretty_assertions::assert_eq!(result.suffix(), "-rhel8");

        Ok(())
    }

    #[test_case("rhel8", Some(Platform::new("rhel", "8")); "rhel eight")]
    #[test_case("ubuntu22", Some(Platform::new("ubuntu", "22")); "ubuntu")]
    #[test_case("rhel", None; "no version")]
    #[test_case("8", None; "no id")]
    #[test_case("rhel8.1", None; "minor version")]
    #[test]
    fn parse_fingerprint(fingerprint: &str, expect: Option<Platform>) {
        pretty_assertions::assert_eq!(Platform::from_fingerprint(fingerprint), expect);
    }

    #[sealed_test(env = [("KOMODOENV_LINUX_DIST", "rhel9")])]
    fn detect_honors_override() -> anyhow::Result<()> {
        pretty_assertions::assert_eq!(Platform::detect()?, Platform::new("rhel", "9"));
        Ok(())
    }
}
