// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Release name handling.
//!
//! Komodo release names are dash separated lists of qualifiers:
//!
//! ```text
//! <base>(-<date>)*(-py<major><minor>)?(-rhel<N>)?(-<custom coordinate>)?
//! ```
//!
//! The base is either a track keyword (`stable`, `testing`, `bleeding`) or a
//! plain version (`2030.01.00`). Dated releases carry one or more 8 or 4 digit
//! stamps after their base, e.g., `bleeding-20250225-1209-py311-rhel8`.
//!
//! # Custom Coordinates
//!
//! A custom coordinate is an opaque suffix telling apart otherwise identical
//! releases, e.g., `-numpy1`. Newer releases declare their coordinate inside
//! their own enable script through a `CUSTOM_COORDINATE="..."` assignment.
//! Older releases do not, so the coordinate is inferred from the last
//! segment of the release name instead.

use regex::Regex;
use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
    sync::LazyLock,
};
use tracing::debug;

static DATE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d{8}|\d{4})$").expect("valid date token regex"));

const COORDINATE_ASSIGNMENT: &str = "CUSTOM_COORDINATE=";

/// Release name split into its qualifiers.
///
/// Suffix fields hold their leading dash, or are empty when absent.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReleaseName {
    /// First segment of the name.
    pub base: String,

    /// Date or version stamps following the base.
    pub dates: Vec<String>,

    /// Interpreter qualifier, e.g., `-py311`.
    pub python: String,

    /// Platform qualifier, e.g., `-rhel8`.
    pub platform: String,

    /// Custom coordinate inferred from the name, e.g., `-numpy1`.
    pub custom: String,
}

impl ReleaseName {
    /// Base joined with every date stamp, e.g., `bleeding-20250225-1209`.
    pub fn base_release(&self) -> String {
        let mut base = self.base.clone();
        for date in &self.dates {
            base.push('-');
            base.push_str(date);
        }
        base
    }
}

/// Split release name into its qualifiers.
pub fn decompose(name: &str) -> ReleaseName {
    let mut parts = name.split('-');
    let mut release = ReleaseName {
        base: parts.next().unwrap_or_default().to_string(),
        custom: coordinate_from_name(name),
        ..ReleaseName::default()
    };

    for part in parts {
        if DATE_TOKEN.is_match(part) {
            release.dates.push(part.to_string());
        } else if part.starts_with("py") {
            release.python = format!("-{part}");
        } else if part.starts_with("rhel") {
            release.platform = format!("-{part}");
        }
    }

    release
}

/// Determine custom coordinate of a release directory.
///
/// Prefers the coordinate declared in the release's enable script, and falls
/// back to inferring it from the directory name.
pub fn find_custom_coordinate(release_dir: impl AsRef<Path>) -> String {
    let release_dir = release_dir.as_ref();
    if let Some(coordinate) = declared_coordinate(release_dir.join("enable")) {
        return coordinate;
    }

    let name = release_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    coordinate_from_name(&name)
}

fn declared_coordinate(enable: PathBuf) -> Option<String> {
    if !enable.is_file() {
        return None;
    }

    let content = match read_to_string(&enable) {
        Ok(content) => content,
        Err(err) => {
            debug!("cannot read {:?}: {err}", enable.display());
            return None;
        }
    };

    let line = content
        .lines()
        .find(|line| line.contains(COORDINATE_ASSIGNMENT))?;
    let (_, value) = line.trim().split_once(COORDINATE_ASSIGNMENT)?;
    let value = value.trim_matches('"').trim_matches('-');
    if value.is_empty() {
        return Some(String::new());
    }

    Some(format!("-{value}"))
}

fn coordinate_from_name(name: &str) -> String {
    let parts: Vec<&str> = name.split('-').collect();
    let Some(last) = parts.last() else {
        return String::new();
    };

    // INVARIANT: Reserved qualifiers are never coordinates.
    if parts.len() < 2
        || last.is_empty()
        || last.starts_with("py")
        || last.starts_with("rhel")
        || DATE_TOKEN.is_match(last)
    {
        return String::new();
    }

    format!("-{last}")
}

/// Candidate release directories, most specific first.
///
/// Platform and coordinate together beat platform alone, which in turn beats
/// coordinate alone.
pub fn candidate_paths(
    base_release: impl AsRef<Path>,
    python: &str,
    platform: &str,
    custom: &str,
) -> [PathBuf; 4] {
    let base = base_release.as_ref().to_string_lossy();
    [
        PathBuf::from(format!("{base}{python}{platform}{custom}")),
        PathBuf::from(format!("{base}{python}{platform}")),
        PathBuf::from(format!("{base}{python}{custom}")),
        PathBuf::from(format!("{base}{python}")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;
    use std::fs;

    #[test]
    fn decompose_dated_release() {
        let result = decompose("bleeding-20250225-1209-py311-rhel8-numpy1");
        let expect = ReleaseName {
            base: "bleeding".into(),
            dates: vec!["20250225".into(), "1209".into()],
            python: "-py311".into(),
            platform: "-rhel8".into(),
            custom: "-numpy1".into(),
        };
        pretty_assertions::assert_eq!(result, expect);
        pretty_assertions::assert_eq!(result.base_release(), "bleeding-20250225-1209");
    }

    #[test_case("stable"; "bare track")]
    #[test_case("2030.01.00-py311"; "version with python")]
    #[test_case("2030.01.00-py311-rhel9"; "version with platform")]
    #[test_case("bleeding-20250225-py311-rhel8-numpy1"; "dated with coordinate")]
    #[test_case("2025.04.01-py311-rhel8-numpy1"; "version with coordinate")]
    #[test]
    fn first_candidate_reproduces_name(name: &str) {
        let parts = decompose(name);
        let candidates = candidate_paths(
            parts.base_release(),
            &parts.python,
            &parts.platform,
            &parts.custom,
        );
        pretty_assertions::assert_eq!(candidates[0], PathBuf::from(name));
    }

    #[test]
    fn candidate_priority() {
        let result = candidate_paths("/k/2030.01.00", "-py311", "-rhel8", "-numpy1");
        let expect = [
            PathBuf::from("/k/2030.01.00-py311-rhel8-numpy1"),
            PathBuf::from("/k/2030.01.00-py311-rhel8"),
            PathBuf::from("/k/2030.01.00-py311-numpy1"),
            PathBuf::from("/k/2030.01.00-py311"),
        ];
        pretty_assertions::assert_eq!(result, expect);
    }

    #[test]
    fn coordinate_declared_in_enable() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let release = dir.path().join("2030.01.00-py311");
        fs::create_dir(&release)?;
        fs::write(
            release.join("enable"),
            "CUSTOM_COORDINATE=\"-foo\"\nsource /elsewhere/enable\n",
        )?;

        pretty_assertions::assert_eq!(find_custom_coordinate(&release), "-foo");

        Ok(())
    }

    #[test]
    fn empty_declared_coordinate() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let release = dir.path().join("2030.01.00-bar");
        fs::create_dir(&release)?;
        fs::write(release.join("enable"), "CUSTOM_COORDINATE=\"\"\n")?;

        pretty_assertions::assert_eq!(find_custom_coordinate(&release), "");

        Ok(())
    }

    #[test_case("2030.01.00-py311-foo", "-foo"; "trailing coordinate")]
    #[test_case("2030.01.00-py311", ""; "python qualifier")]
    #[test_case("2030.01.00-py311-rhel8", ""; "platform qualifier")]
    #[test_case("bleeding-20250225", ""; "date stamp")]
    #[test_case("stable", ""; "single segment")]
    #[test]
    fn coordinate_inferred_from_name(name: &str, expect: &str) {
        let dir = tempfile::tempdir().unwrap();
        let release = dir.path().join(name);
        fs::create_dir(&release).unwrap();

        pretty_assertions::assert_eq!(find_custom_coordinate(&release), expect);
    }
}
