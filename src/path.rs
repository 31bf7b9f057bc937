// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for the files that komodoenv reads
//! from a komodo release, and the files it generates inside a komodoenv.
//!
//! # Prefix Layout
//!
//! Both komodo releases and komodoenvs share the same basic layout, which we
//! call a __prefix__:
//!
//! ```text
//! <prefix>/
//!     enable              # POSIX shell activation script
//!     enable.csh          # C shell activation script
//!     komodoenv.conf      # Environment descriptor (komodoenvs only)
//!     root/
//!         bin/python
//!         libexec/        # Hidden implementations of bin/ (optional)
//!         lib/python<major>.<minor>/site-packages/
//!         lib64/
//!         shims/          # Redirects into the tracked release (komodoenvs only)
//! ```

use std::path::{Path, PathBuf};

/// Name of the environment descriptor file of a komodoenv.
pub const DESCRIPTOR_FILE: &str = "komodoenv.conf";

/// Name of the update entry point installed into a komodoenv.
pub const UPDATE_EXE: &str = "komodoenv-update";

/// Determine default absolute path to the settings file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/komodoenv/config.toml`.
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if configuration directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_settings_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("komodoenv").join("config.toml"))
        .ok_or(NoWayHome)
}

/// Determine default komodo root.
///
/// Azure hosts keep komodo at `/prog/komodo`, everything else at
/// `/prog/res/komodo`.
pub fn default_komodo_root() -> PathBuf {
    let azure = Path::new("/prog/komodo");
    if azure.is_dir() {
        azure.to_path_buf()
    } else {
        PathBuf::from("/prog/res/komodo")
    }
}

/// Layout of a komodo release or komodoenv directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix(PathBuf);

impl Prefix {
    /// Construct new prefix.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Treat prefix as [`Path`] slice.
    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }

    /// Final component of the prefix, e.g., the release name.
    pub fn name(&self) -> String {
        self.0
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn root(&self) -> PathBuf {
        self.0.join("root")
    }

    pub fn bin(&self) -> PathBuf {
        self.root().join("bin")
    }

    pub fn libexec(&self) -> PathBuf {
        self.root().join("libexec")
    }

    pub fn shims(&self) -> PathBuf {
        self.root().join("shims")
    }

    pub fn python(&self) -> PathBuf {
        self.bin().join("python")
    }

    /// Dynamic library directories, in `LD_LIBRARY_PATH` order.
    pub fn lib_dirs(&self) -> [PathBuf; 2] {
        [self.root().join("lib"), self.root().join("lib64")]
    }

    /// Site-packages directory for given `major.minor` Python version.
    pub fn site_packages(&self, python_version: &str) -> PathBuf {
        site_packages(self.root(), "lib", python_version)
    }

    pub fn enable(&self) -> PathBuf {
        self.0.join("enable")
    }

    pub fn enable_csh(&self) -> PathBuf {
        self.0.join("enable.csh")
    }

    pub fn descriptor(&self) -> PathBuf {
        self.0.join(DESCRIPTOR_FILE)
    }

    pub fn lock(&self) -> PathBuf {
        self.0.join("komodoenv.lock")
    }

    pub fn update_exe(&self) -> PathBuf {
        self.bin().join(UPDATE_EXE)
    }
}

/// Site-packages directory under `<root>/<libdir>/python<version>`.
pub fn site_packages(root: impl AsRef<Path>, libdir: &str, python_version: &str) -> PathBuf {
    root.as_ref()
        .join(libdir)
        .join(format!("python{python_version}"))
        .join("site-packages")
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
