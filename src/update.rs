// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Komodoenv update protocol.
//!
//! A komodoenv follows a track. Whenever the track moves upstream, the
//! komodoenv's generated files still redirect into the old release. The
//! update protocol notices the divergence, and relinks the komodoenv onto
//! whatever the track currently leads to.
//!
//! # Divergence
//!
//! The descriptor records a [`TrackState`] at every synchronization. The
//! protocol recomputes the same triple from the komodo root, and only acts
//! when the two differ. Thus, running the protocol twice in a row without an
//! upstream change is a no-op the second time.
//!
//! # Write Order
//!
//! Shims, activation scripts, and fallback finder get rewritten first, and
//! the descriptor last. An update that fails midway keeps the old triple on
//! disk, so the next check still reports it as pending. The write phase is
//! serialized through an exclusive lock on `komodoenv.lock`.

use crate::{
    config::{ConfigError, Descriptor, TrackState},
    path::{site_packages, Prefix},
    platform::Platform,
    release::resolve::find_tracked_release,
    scripts::{rebuild_shims, write_enable_scripts, write_fallback_finder, ScriptError},
};

use fs2::FileExt;
use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Outcome of update protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Komodoenv already matches its track.
    UpToDate,

    /// Komodoenv was built on another platform, and was left alone.
    PlatformMismatch { expected: String, actual: String },

    /// Track cannot be found upstream, and was left alone.
    TrackMissing { tracked: String },

    /// Track moved, but only a check was requested.
    ///
    /// Update is `safe` if the komodoenv's layout is compatible with the
    /// komodoenv version shipped by the new release.
    Pending { release: String, safe: bool },

    /// Komodoenv was relinked onto new release.
    Updated { release: String },
}

/// Update protocol over a single komodoenv.
#[derive(Debug, Clone)]
pub struct Updater {
    dest: Prefix,
    platform: Platform,
}

impl Updater {
    /// Construct new updater for komodoenv at `dest`.
    pub fn new(dest: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            dest: Prefix::new(dest),
            platform,
        }
    }

    /// Run update protocol.
    ///
    /// With `check_only` nothing but auxiliary directories is touched, and a
    /// pending update is merely reported.
    ///
    /// # Errors
    ///
    /// - Return [`UpdateError::Config`] if descriptor cannot be read or
    ///   written.
    /// - Return [`UpdateError::Lock`] if komodoenv cannot be locked.
    /// - Return [`UpdateError::Script`] if generated files cannot be
    ///   rewritten.
    #[instrument(skip(self), level = "debug")]
    pub fn update(&self, check_only: bool) -> Result<UpdateStatus> {
        let descriptor = Descriptor::load(self.dest.descriptor())?;

        let actual = self.platform.fingerprint();
        if descriptor.linux_dist != actual {
            return Ok(UpdateStatus::PlatformMismatch {
                expected: descriptor.linux_dist,
                actual,
            });
        }

        sync_aux_dirs(&descriptor, &self.dest, &self.platform);

        let Some(current) = current_track(&descriptor, &self.platform) else {
            return Ok(UpdateStatus::TrackMissing {
                tracked: descriptor.tracked_release,
            });
        };
        if descriptor.track_state() == current {
            debug!("{:?} is up to date", self.dest.as_path().display());
            return Ok(UpdateStatus::UpToDate);
        }

        if check_only {
            return Ok(UpdateStatus::Pending {
                safe: can_update(&descriptor, &current, &self.platform),
                release: current.current_release,
            });
        }

        self.relink(current)
    }

    fn relink(&self, current: TrackState) -> Result<UpdateStatus> {
        let lock_path = self.dest.lock();
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|err| UpdateError::Lock {
                source: err,
                path: lock_path.clone(),
            })?;
        FileExt::lock_exclusive(&lock).map_err(|err| UpdateError::Lock {
            source: err,
            path: lock_path.clone(),
        })?;

        // INVARIANT: Another process may have finished the update while we
        // waited on the lock.
        let descriptor = Descriptor::load(self.dest.descriptor())?;
        if descriptor.track_state() == current {
            return Ok(UpdateStatus::UpToDate);
        }

        let source = Prefix::new(descriptor.komodo_root.join(&current.current_release));
        info!("updating komodoenv to {}", current.current_release);

        rebuild_shims(&source, &self.dest)?;
        write_enable_scripts(&source, &self.dest)?;

        let version = descriptor.python_version.clone();
        let dest_site_packages = self.dest.site_packages(&version);
        fs::create_dir_all(&dest_site_packages).map_err(|err| UpdateError::Io {
            source: err,
            path: dest_site_packages.clone(),
        })?;
        write_fallback_finder(
            &dest_site_packages,
            &[
                site_packages(source.root(), "lib64", &version),
                site_packages(source.root(), "lib", &version),
            ],
        )?;

        let release = current.current_release.clone();
        let descriptor = descriptor.with_track_state(current);
        descriptor.store(self.dest.descriptor())?;

        // INVARIANT: Some tools read their configuration mid update, so
        // auxiliary directories get synchronized both before and after.
        sync_aux_dirs(&descriptor, &self.dest, &self.platform);

        FileExt::unlock(&lock).map_err(|err| UpdateError::Lock {
            source: err,
            path: lock_path,
        })?;

        Ok(UpdateStatus::Updated { release })
    }
}

/// Recompute track state from the komodo root.
///
/// Returns `None` if the track no longer leads to any release.
#[instrument(skip(descriptor), level = "debug")]
pub fn current_track(descriptor: &Descriptor, platform: &Platform) -> Option<TrackState> {
    let track = descriptor.komodo_root.join(&descriptor.tracked_release);
    let resolved = fs::canonicalize(&track).ok()?;
    let release = find_tracked_release(&resolved, &platform.suffix())?;
    let mtime = fs::metadata(&track)
        .and_then(|meta| meta.modified())
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_secs_f64();

    Some(TrackState {
        tracked_release: descriptor.tracked_release.clone(),
        current_release: release.file_name()?.to_string_lossy().into_owned(),
        mtime_release: format!("{mtime:?}"),
    })
}

/// Whether the komodoenv layout survives an update to the current release.
///
/// Layout is compatible when the major version of the komodoenv that built
/// it matches the major version of komodoenv shipped by the new release.
pub fn can_update(descriptor: &Descriptor, current: &TrackState, platform: &Platform) -> bool {
    let Some(built_with) = &descriptor.komodoenv_version else {
        return false;
    };

    let track = descriptor.komodo_root.join(&current.tracked_release);
    let Some(release) = fs::canonicalize(track)
        .ok()
        .and_then(|track| find_tracked_release(track, &platform.suffix()))
    else {
        return false;
    };

    let Some(shipped) = package_version(
        release.join("root"),
        &descriptor.python_version,
        "komodoenv",
    ) else {
        return false;
    };

    match (major_of(built_with), major_of(&shipped)) {
        (Some(built), Some(shipped)) => built == shipped,
        _ => false,
    }
}

/// Version of package installed in release, if any.
///
/// Looks for PEP 376 `<package>-<version>.dist-info` directories, and picks
/// the greatest version string among them.
pub fn package_version(
    release_root: impl AsRef<Path>,
    python_version: &str,
    package: &str,
) -> Option<String> {
    let dir = site_packages(release_root, "lib", python_version);
    let pattern = format!(
        "{}/{package}-*.dist-info",
        glob::Pattern::escape(&dir.to_string_lossy())
    );
    let prefix = format!("{package}-");

    glob::glob(&pattern)
        .ok()?
        .filter_map(std::result::Result::ok)
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            let version = name.strip_prefix(&prefix)?.strip_suffix(".dist-info")?;
            Some(version.to_string())
        })
        .max()
}

/// Copy auxiliary directories some tools insist on finding in-tree.
///
/// Jupyter notebook 7 and later wants its data and configuration directories
/// inside the komodoenv, and so does rips. Existing files are never
/// overwritten. Failures only produce warnings.
#[instrument(skip(descriptor, dest, platform), level = "debug")]
pub fn sync_aux_dirs(descriptor: &Descriptor, dest: &Prefix, platform: &Platform) {
    let mut source = Prefix::new(descriptor.komodo_root.join(&descriptor.current_release));
    if !source.root().is_dir() {
        source = Prefix::new(
            descriptor
                .komodo_root
                .join(format!("{}{}", descriptor.current_release, platform.suffix())),
        );
    }
    let src_root = source.root();
    let dst_root = dest.root();

    let share_jupyter = src_root.join("share").join("jupyter");
    let etc_jupyter = src_root.join("etc").join("jupyter");
    let notebook = package_version(&src_root, &descriptor.python_version, "notebook");
    if share_jupyter.is_dir()
        && etc_jupyter.is_dir()
        && notebook.as_deref().and_then(major_of).is_some_and(|major| major >= 7)
    {
        let result = copy_ignore_existing(&share_jupyter, &dst_root.join("share"))
            .and_then(|_| copy_ignore_existing(&etc_jupyter, &dst_root.join("etc")));
        if let Err(error) = result {
            warn!("failed to fix up jupyter environment: {error}");
            warn!("jupyter may not work as intended in the komodoenv");
        }
    }

    let share_rips = src_root.join("share").join("rips");
    if share_rips.is_dir() {
        if let Err(error) = copy_ignore_existing(&share_rips, &dst_root.join("share")) {
            warn!("failed to fix up rips configuration: {error}");
            warn!("rips may not work as intended in the komodoenv");
        }
    }
}

/// Copy directory `src` into directory `dst_parent`, keeping existing files.
///
/// Symlinks are recreated as symlinks rather than followed.
pub fn copy_ignore_existing(src: &Path, dst_parent: &Path) -> std::io::Result<()> {
    let Some(name) = src.file_name() else {
        return Ok(());
    };
    let dst = dst_parent.join(name);
    mkdirp::mkdirp(dst_parent)?;

    for entry in WalkDir::new(src) {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if target.symlink_metadata().is_ok() {
            continue;
        } else if entry.file_type().is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

fn major_of(version: &str) -> Option<u64> {
    version.split('.').next()?.trim().parse().ok()
}

/// Update protocol error types.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Komodoenv lock cannot be acquired.
    #[error("failed to lock {:?}", path.display())]
    Lock {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Filesystem operation fails.
    #[error("failed to access {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Friendly result alias :3
pub type Result<T, E = UpdateError> = std::result::Result<T, E>;
