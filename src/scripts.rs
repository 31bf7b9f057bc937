// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Generated scripts of a komodoenv.
//!
//! A komodoenv only holds what the user installed into it. Everything else
//! is borrowed from the komodo release it tracks through three kinds of
//! generated files:
//!
//! - __Activation scripts__ (`enable`, `enable.csh`) that put the komodoenv
//!   and then the release on `PATH`.
//! - __Shims__ in `root/shims` redirecting to release executables that the
//!   komodoenv does not provide itself.
//! - A __fallback finder__ in site-packages that lets Python import
//!   release packages the komodoenv does not provide itself.

use crate::{
    file::{write_atomic, FileError, EXEC_MODE, FILE_MODE},
    path::Prefix,
};

use std::{
    fs,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

const ENABLE_BASH: &str = r#"disable_komodo () {
    if [[ -v _PRE_KOMODO_PATH ]]; then
        export PATH="${_PRE_KOMODO_PATH}"
        unset _PRE_KOMODO_PATH
    fi
    if [[ -v _PRE_KOMODO_MANPATH ]]; then
        export MANPATH="${_PRE_KOMODO_MANPATH}"
        unset _PRE_KOMODO_MANPATH
    fi
    if [[ -v _PRE_KOMODO_LD_LIBRARY_PATH ]]; then
        export LD_LIBRARY_PATH="${_PRE_KOMODO_LD_LIBRARY_PATH}"
        unset _PRE_KOMODO_LD_LIBRARY_PATH
    fi
    if [[ -v _PRE_KOMODO_PS1 ]]; then
        export PS1="${_PRE_KOMODO_PS1}"
        unset _PRE_KOMODO_PS1
    fi
    if [ -n "${BASH:-}" -o -n "${ZSH_VERSION:-}" ]; then
        hash -r
    fi

    unset KOMODO_RELEASE
    unset ERT_LSF_SERVER

    if [ ! "${1:-}" = "preserve_disable_komodo" ]; then
        unset -f disable_komodo
    fi
}

# unset irrelevant variables
disable_komodo preserve_disable_komodo

export KOMODO_RELEASE={komodoenv_prefix}

export _PRE_KOMODO_PATH="$PATH"
export PATH={komodoenv_prefix}/root/bin:{komodoenv_prefix}/root/shims:{komodo_prefix}/root/bin${PATH:+:${PATH}}

export _PRE_KOMODO_MANPATH="${MANPATH:-}"
export MANPATH={komodoenv_prefix}/root/share/man:{komodo_prefix}/root/share/man${MANPATH:+:${MANPATH}}

export _PRE_KOMODO_LD_LIBRARY_PATH="${LD_LIBRARY_PATH:-}"
export LD_LIBRARY_PATH={komodo_prefix}/root/lib:{komodo_prefix}/root/lib64

export _PRE_KOMODO_PS1="${PS1:-}"
export PS1="({komodoenv_release} + {komodo_release}) ${PS1:-}"

if [ -n "${BASH:-}" -o -n "${ZSH_VERSION:-}" ]; then
    hash -r
fi

if [ -d {komodo_prefix}/motd/scripts ]
then
    for f in {komodo_prefix}/motd/scripts/*
    do
        $f
    done
fi

if [ -d {komodo_prefix}/motd/messages ]
then
    cat {komodo_prefix}/motd/messages/*
fi

{komodoenv_prefix}/root/bin/komodoenv-update --check
"#;

const ENABLE_CSH: &str = r#"alias disable_komodo '\\
    test $?_PRE_KOMODO_PATH != 0 && setenv PATH "$_PRE_KOMODO_PATH" && unsetenv _PRE_KOMODO_PATH;\\
    test $?_PRE_KOMODO_MANPATH != 0 && setenv MANPATH "$_PRE_KOMODO_MANPATH" && unsetenv _PRE_KOMODO_MANPATH;\\
    test $?_PRE_KOMODO_LD_PATH != 0 && setenv LD_LIBRARY_PATH "$_PRE_KOMODO_LD_PATH" && unsetenv _PRE_KOMODO_LD_PATH;\\
    test $?_KOMODO_OLD_PROMPT != 0 && set prompt="$_KOMODO_OLD_PROMPT" && unsetenv _KOMODO_OLD_PROMPT;\\
    test "\!:*" != "preserve_disable_komodo" && unalias disable_komodo;\\
    unsetenv KOMODO_RELEASE;\\
    unsetenv ERT_LSF_SERVER;\\
    rehash;\\
    '
rehash
disable_komodo preserve_disable_komodo

if $?PATH then
    setenv _PRE_KOMODO_PATH "$PATH"
    setenv PATH {komodoenv_prefix}/root/bin:{komodoenv_prefix}/root/shims:{komodo_prefix}/root/bin:$PATH
else
    setenv PATH {komodoenv_prefix}/root/bin:{komodoenv_prefix}/root/shims:{komodo_prefix}/root/bin
endif

if $?MANPATH then
    setenv _PRE_KOMODO_MANPATH "$MANPATH"
    setenv MANPATH {komodoenv_prefix}/root/share/man:{komodo_prefix}/root/share/man:$MANPATH
else
    setenv MANPATH {komodoenv_prefix}/root/share/man:{komodo_prefix}/root/share/man:
endif

if $?LD_LIBRARY_PATH then
    setenv _PRE_KOMODO_LD_PATH "$LD_LIBRARY_PATH"
endif
setenv LD_LIBRARY_PATH {komodo_prefix}/root/lib:{komodo_prefix}/root/lib64

setenv KOMODO_RELEASE {komodoenv_prefix}

# Could be in a non-interactive environment,
# in which case, $prompt is undefined and we wouldn't
# care about the prompt anyway.
if ( $?prompt ) then
    setenv _KOMODO_OLD_PROMPT "$prompt"
    set prompt = "[{komodoenv_release} + {komodo_release}] $prompt"
endif

rehash

if ( -d {komodo_prefix}/motd/scripts ) then
    foreach f ({komodo_prefix}/motd/scripts/*)
        $f
    end
endif

if ( -d {komodo_prefix}/motd/messages ) then
    cat {komodo_prefix}/motd/messages/*
endif

{komodoenv_prefix}/root/bin/komodoenv-update --check
"#;

/// Module name of the fallback finder, sorted after every other `.pth`.
const FINDER_MODULE: &str = "zzz_komodo_finder";

/// Activation script flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Posix,
    Csh,
}

impl Shell {
    fn template(&self) -> &'static str {
        match self {
            Self::Posix => ENABLE_BASH,
            Self::Csh => ENABLE_CSH,
        }
    }
}

/// Render activation script of komodoenv `dest` on top of release `source`.
pub fn enable_script(shell: Shell, source: &Prefix, dest: &Prefix) -> String {
    shell
        .template()
        .replace("{komodo_prefix}", &source.as_path().to_string_lossy())
        .replace("{komodo_release}", &source.name())
        .replace("{komodoenv_prefix}", &dest.as_path().to_string_lossy())
        .replace("{komodoenv_release}", &dest.name())
}

/// Regenerate both activation scripts of komodoenv.
///
/// # Errors
///
/// - Return [`ScriptError::Write`] if a script cannot be written.
#[instrument(skip(source, dest), level = "debug")]
pub fn write_enable_scripts(source: &Prefix, dest: &Prefix) -> Result<()> {
    write_atomic(dest.enable(), enable_script(Shell::Posix, source, dest), FILE_MODE)?;
    write_atomic(dest.enable_csh(), enable_script(Shell::Csh, source, dest), FILE_MODE)?;
    Ok(())
}

/// Rewrite release executable so that it runs from within a komodoenv.
///
/// Python scripts get their interpreter line pointed at `python`, with the
/// rest of the file untouched. Anything else gets wrapped in a bash script
/// that exposes the release's libraries before running `target` under its
/// original name. The `target` path must already be resolved, since its
/// release root is derived from it.
pub fn rewrite_executable(target: &Path, python: &Path, text: &[u8]) -> Vec<u8> {
    if let Some(newline) = text.iter().position(|&byte| byte == b'\n') {
        let first_line = &text[..newline];
        if first_line.starts_with(b"#!") && first_line.windows(6).any(|word| word == b"python") {
            let mut out = Vec::with_capacity(text.len());
            out.extend_from_slice(b"#!");
            out.extend_from_slice(python.as_os_str().as_bytes());
            out.extend_from_slice(&text[newline..]);
            return out;
        }
    }

    let root = target
        .parent()
        .and_then(Path::parent)
        .unwrap_or_else(|| Path::new("/"));
    let libs = format!(
        "{}:{}",
        root.join("lib").display(),
        root.join("lib64").display()
    );

    format!(
        "#!/bin/bash\n\
         export LD_LIBRARY_PATH={libs}${{LD_LIBRARY_PATH:+:${{LD_LIBRARY_PATH}}}}\n\
         exec -a \"$0\" \"{}\" \"$@\"\n",
        target.display()
    )
    .into_bytes()
}

/// Rebuild shim directory of komodoenv from scratch.
///
/// Every executable of `source` that the komodoenv does not provide in its
/// own `bin` gets a shim. Hidden implementations in `libexec` are preferred
/// over their public `bin` counterparts. Returns the number of shims made.
///
/// # Errors
///
/// - Return [`ScriptError::Io`] if directories or executables cannot be
///   accessed.
/// - Return [`ScriptError::Write`] if a shim cannot be written.
#[instrument(skip(source, dest), level = "debug")]
pub fn rebuild_shims(source: &Prefix, dest: &Prefix) -> Result<usize> {
    let shims = dest.shims();
    if shims.is_dir() {
        fs::remove_dir_all(&shims).map_err(|err| io_error(err, &shims))?;
    }
    fs::create_dir(&shims).map_err(|err| io_error(err, &shims))?;

    let bin = source.bin();
    let mut names = fs::read_dir(&bin)
        .map_err(|err| io_error(err, &bin))?
        .map(|entry| entry.map(|entry| entry.file_name()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|err| io_error(err, &bin))?;
    names.sort();

    let python = dest.python();
    let mut count = 0;
    for name in names {
        // INVARIANT: Executables installed into the komodoenv always win.
        if dest.bin().join(&name).is_file() {
            continue;
        }

        let mut target = source.libexec().join(&name);
        if !target.is_file() {
            target = bin.join(&name);
        }
        if !target.is_file() {
            continue;
        }

        let target = fs::canonicalize(&target).map_err(|err| io_error(err, &target))?;
        let text = fs::read(&target).map_err(|err| io_error(err, &target))?;
        write_atomic(
            shims.join(&name),
            rewrite_executable(&target, &python, &text),
            EXEC_MODE,
        )?;
        count += 1;
    }
    debug!("made {count} shims in {:?}", shims.display());

    Ok(count)
}

/// Render fallback finder module over given site-packages directories.
pub fn fallback_finder(paths: &[PathBuf]) -> String {
    let paths = paths
        .iter()
        .map(|path| python_str(&path.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"import sys
from importlib.machinery import PathFinder

KOMODO_PATHS = [{paths}]

class KomodoFallbackFinder:
    @classmethod
    def find_spec(cls, fullname, path=None, target=None):
        spec = PathFinder.find_spec(fullname, KOMODO_PATHS)
        if spec:
            return spec
        return None

def install():
    if not any(isinstance(f, KomodoFallbackFinder) for f in sys.meta_path):
        sys.meta_path.append(KomodoFallbackFinder())
"#
    )
}

/// Register release site-packages as fallback import paths of komodoenv.
///
/// The finder is loaded through `zzz_komodo.pth`, which sorts after every
/// other `.pth` file. Thus, packages installed into the komodoenv, editable
/// ones included, shadow those of the release.
///
/// # Errors
///
/// - Return [`ScriptError::Io`] if the legacy `.pth` cannot be removed.
/// - Return [`ScriptError::Write`] if finder files cannot be written.
#[instrument(skip(site_packages, paths), level = "debug")]
pub fn write_fallback_finder(site_packages: &Path, paths: &[PathBuf]) -> Result<()> {
    let legacy = site_packages.join("_komodo.pth");
    match fs::remove_file(&legacy) {
        Ok(()) => debug!("removed legacy {:?}", legacy.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(io_error(err, &legacy)),
    }

    write_atomic(
        site_packages.join(format!("{FINDER_MODULE}.py")),
        fallback_finder(paths),
        FILE_MODE,
    )?;
    write_atomic(
        site_packages.join("zzz_komodo.pth"),
        format!("import {FINDER_MODULE}; {FINDER_MODULE}.install()"),
        FILE_MODE,
    )?;

    Ok(())
}

fn python_str(value: &str) -> String {
    format!("'{}'", value.replace('\\', r"\\").replace('\'', r"\'"))
}

fn io_error(source: std::io::Error, path: &Path) -> ScriptError {
    ScriptError::Io {
        source,
        path: path.to_path_buf(),
    }
}

/// Script generation error types.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to access {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Write(#[from] FileError),
}

/// Friendly result alias :3
pub type Result<T, E = ScriptError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use simple_test_case::test_case;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn rewrite_python_shebang_only() {
        let pip = indoc! {"
            #!/prog/res/komodo/2030.01.00-py311/root/bin/python3.11
            # -*- coding: utf-8 -*-
            import re
            import sys
            from pip._internal.cli.main import main
            if __name__ == '__main__':
                sys.exit(main())
        "};

        let result = rewrite_executable(
            Path::new("/prog/res/komodo/2030.01.00-py311/root/bin/pip"),
            Path::new("/home/user/kenv/root/bin/python"),
            pip.as_bytes(),
        );

        let mut expect = b"#!/home/user/kenv/root/bin/python".to_vec();
        expect.extend_from_slice(&pip.as_bytes()[pip.find('\n').unwrap()..]);
        pretty_assertions::assert_eq!(result, expect);
    }

    #[test_case(b"\x7fELF\x02\x01\x01\x00\n\x00\x00binary"; "binary executable")]
    #[test_case(b"#!/prog/res/komodo/bin/ruby\nrequire 'rubygems'\n"; "other shebang")]
    #[test_case(b"#!/bin/sh\n# python is mentioned later only\n"; "python below first line")]
    #[test_case(b"#!python"; "no newline")]
    #[test]
    fn wrap_everything_else(text: &[u8]) {
        let result = rewrite_executable(
            Path::new("/prog/res/komodo/stable/root/bin/tool"),
            Path::new("/home/user/kenv/root/bin/python"),
            text,
        );

        let expect = indoc! {r#"
            #!/bin/bash
            export LD_LIBRARY_PATH=/prog/res/komodo/stable/root/lib:/prog/res/komodo/stable/root/lib64${LD_LIBRARY_PATH:+:${LD_LIBRARY_PATH}}
            exec -a "$0" "/prog/res/komodo/stable/root/bin/tool" "$@"
        "#};
        pretty_assertions::assert_eq!(String::from_utf8(result).unwrap(), expect);
    }

    #[test]
    fn render_enable_script() {
        let source = Prefix::new("/prog/res/komodo/2030.01.00-py311");
        let dest = Prefix::new("/home/user/kenv");
        let result = enable_script(Shell::Posix, &source, &dest);

        assert!(result.contains(
            "export PATH=/home/user/kenv/root/bin:/home/user/kenv/root/shims:\
             /prog/res/komodo/2030.01.00-py311/root/bin${PATH:+:${PATH}}"
        ));
        assert!(result.contains(
            "export LD_LIBRARY_PATH=/prog/res/komodo/2030.01.00-py311/root/lib:\
             /prog/res/komodo/2030.01.00-py311/root/lib64\n"
        ));
        assert!(result.contains(r#"export PS1="(kenv + 2030.01.00-py311) ${PS1:-}""#));
        assert!(result.ends_with("/home/user/kenv/root/bin/komodoenv-update --check\n"));
        assert!(!result.contains("{komodo"));

        let result = enable_script(Shell::Csh, &source, &dest);
        assert!(result.contains(r#"set prompt = "[kenv + 2030.01.00-py311] $prompt""#));
        assert!(!result.contains("{komodo"));
    }

    #[test]
    fn shims_prefer_libexec_and_skip_local() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let base = fs::canonicalize(dir.path())?;
        let source = Prefix::new(base.join("release"));
        let dest = Prefix::new(base.join("kenv"));
        fs::create_dir_all(source.bin())?;
        fs::create_dir_all(source.libexec())?;
        fs::create_dir_all(source.bin().join("subdir"))?;
        fs::create_dir_all(dest.bin())?;

        fs::write(source.bin().join("python"), "#!/bin/sh\n")?;
        fs::write(dest.bin().join("python"), "#!/bin/sh\n")?;
        fs::write(source.bin().join("ert"), "#!/usr/bin/env python3\nimport ert\n")?;
        fs::write(source.bin().join("flow"), "#!/bin/sh\nexec libexec/flow\n")?;
        fs::write(source.libexec().join("flow"), "\x7fELF")?;

        // Stale shims are dropped.
        fs::create_dir_all(dest.shims())?;
        fs::write(dest.shims().join("stale"), "")?;

        let count = rebuild_shims(&source, &dest)?;
        pretty_assertions::assert_eq!(count, 2);

        let mut names = fs::read_dir(dest.shims())?
            .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<Vec<_>>>()?;
        names.sort();
        pretty_assertions::assert_eq!(names, vec!["ert".to_string(), "flow".to_string()]);

        let ert = fs::read_to_string(dest.shims().join("ert"))?;
        pretty_assertions::assert_eq!(ert, format!("#!{}\nimport ert\n", dest.python().display()));

        let flow = fs::read_to_string(dest.shims().join("flow"))?;
        assert!(flow.contains(&format!(
            "exec -a \"$0\" \"{}\" \"$@\"",
            source.libexec().join("flow").display()
        )));
        let mode = fs::metadata(dest.shims().join("flow"))?.permissions().mode();
        pretty_assertions::assert_eq!(mode & 0o777, EXEC_MODE);

        Ok(())
    }

    #[test]
    fn fallback_finder_replaces_legacy_pth() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("_komodo.pth"), "/old/path\n")?;

        write_fallback_finder(
            dir.path(),
            &[
                PathBuf::from("/k/stable/root/lib64/python3.11/site-packages"),
                PathBuf::from("/k/stable/root/lib/python3.11/site-packages"),
            ],
        )?;

        assert!(!dir.path().join("_komodo.pth").exists());
        pretty_assertions::assert_eq!(
            fs::read_to_string(dir.path().join("zzz_komodo.pth"))?,
            "import zzz_komodo_finder; zzz_komodo_finder.install()"
        );
        let finder = fs::read_to_string(dir.path().join("zzz_komodo_finder.py"))?;
        assert!(finder.contains(
            "KOMODO_PATHS = ['/k/stable/root/lib64/python3.11/site-packages', \
             '/k/stable/root/lib/python3.11/site-packages']"
        ));

        Ok(())
    }
}
