// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Komodo release representation.
//!
//! A __release__ is a read-only installation of the shared komodo
//! distribution living directly under the komodo root, e.g.,
//! `/prog/res/komodo/2030.01.00-py311-rhel8`. Every release contains a
//! `root/` prefix holding its interpreter, and an `enable` script that
//! activates it.
//!
//! # Tracks
//!
//! A __track__ is a symlink naming a moving target, e.g., `stable-py311`
//! pointing at whatever release is currently considered stable. Tracks may
//! chain through several symlinks before reaching a concrete release.
//! Komodoenvs follow a track, and get updated whenever the track moves.
//!
//! # See Also
//!
//! 1. [`naming`]
//! 2. [`resolve`]

pub mod naming;
pub mod resolve;

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::Path,
};

/// Track keywords in order of preference.
pub const TRACKS: [&str; 3] = ["stable", "testing", "bleeding"];

/// How often the release a komodoenv follows is expected to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maturity {
    Stable,
    Testing,
    Bleeding,

    /// Not a track at all, thus never updated.
    Singular,
}

impl Maturity {
    /// Determine maturity from track path.
    pub fn of_track(track: impl AsRef<Path>) -> Self {
        let name = track
            .as_ref()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        if name.starts_with("bleeding") {
            Self::Bleeding
        } else if name.starts_with("testing") {
            Self::Testing
        } else if name.starts_with("stable") {
            Self::Stable
        } else {
            Self::Singular
        }
    }

    /// Whether the user should be warned about this maturity.
    pub fn is_concerning(&self) -> bool {
        !matches!(self, Self::Stable)
    }
}

impl Display for Maturity {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Stable => "tracking a stable release of komodo",
            Self::Testing => "tracking a testing release of komodo",
            Self::Bleeding => {
                "tracking a bleeding release of komodo, it changes every day, \
                 you will need to recreate komodoenv in order to use new executables in komodo"
            }
            Self::Singular => {
                "tracking a singular release, it will not receive updates, \
                 recreate komodoenv to get updated software"
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    #[test_case("/k/stable-py311", Maturity::Stable; "stable")]
    #[test_case("/k/testing-py311", Maturity::Testing; "testing")]
    #[test_case("/k/bleeding-py311", Maturity::Bleeding; "bleeding")]
    #[test_case("/k/2030.01.00-py311", Maturity::Singular; "singular")]
    #[test]
    fn maturity_of_track(track: &str, expect: Maturity) {
        pretty_assertions::assert_eq!(Maturity::of_track(track), expect);
    }
}
