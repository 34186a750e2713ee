//! Locating an installed llama.cpp build and sniffing its capabilities.
//!
//! An [`Installation`] is pinned to one directory containing both
//! `llama-server` and `llama-cli`. Version and help output are captured on
//! first use and memoized for the life of the handle; everything derived
//! (build number, CUDA support, flash-attention flag style) reads from those
//! cached strings.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tokio::sync::OnceCell;
use walkdir::WalkDir;

use crate::error::{Error, Result};

pub const SERVER_BINARY: &str = "llama-server";
pub const CLI_BINARY: &str = "llama-cli";

/// Help text advertising the enum form of the flash-attention flag.
const FLASH_ATTN_ENUM_MARKER: &str = " --flash-attn [on|off|auto]";

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    version_output: OnceCell<String>,
    help_output: OnceCell<String>,
}

/// Handle to a directory holding the llama.cpp binaries.
///
/// Cheap to clone; the memoized probe output is shared between clones.
#[derive(Debug, Clone)]
pub struct Installation {
    inner: Arc<Inner>,
}

impl Installation {
    /// Recursively scan `path` for the first directory that contains both
    /// binaries with an executable bit set. Traversal errors (permissions,
    /// dangling links) are skipped, not reported.
    pub fn detect(path: &Path) -> Option<Installation> {
        for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir = entry.path();
            if is_executable_file(&dir.join(SERVER_BINARY))
                && is_executable_file(&dir.join(CLI_BINARY))
            {
                return Some(Installation::at(dir));
            }
        }
        None
    }

    /// Handle rooted at `dir` without scanning. The binaries are looked up
    /// lazily, so a handle to a not-yet-populated directory is allowed.
    pub fn at(dir: impl Into<PathBuf>) -> Installation {
        Installation {
            inner: Arc::new(Inner {
                root: dir.into(),
                version_output: OnceCell::new(),
                help_output: OnceCell::new(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Path to `llama-server`, or `None` if the file has vanished.
    pub fn server_path(&self) -> Option<PathBuf> {
        let path = self.inner.root.join(SERVER_BINARY);
        path.is_file().then_some(path)
    }

    /// Path to `llama-cli`, or `None` if the file has vanished.
    pub fn cli_path(&self) -> Option<PathBuf> {
        let path = self.inner.root.join(CLI_BINARY);
        path.is_file().then_some(path)
    }

    /// Output of `llama-cli --version`, memoized. llama.cpp prints the
    /// version banner to stderr.
    pub async fn version_output(&self) -> Result<&str> {
        let text = self
            .inner
            .version_output
            .get_or_try_init(|| self.capture(&["--version"], true))
            .await?;
        Ok(text.as_str())
    }

    /// Output of `llama-cli --help`, memoized.
    pub async fn help_output(&self) -> Result<&str> {
        let text = self
            .inner
            .help_output
            .get_or_try_init(|| self.capture(&["--help"], false))
            .await?;
        Ok(text.as_str())
    }

    /// Numeric build number parsed from the version banner, e.g.
    /// `version: 5011 (58caa3a4)` yields 5011.
    pub async fn build_version(&self) -> Result<u64> {
        let output = self.version_output().await?;
        parse_build_version(output)
    }

    /// Whether this build was compiled with CUDA support.
    pub async fn has_cuda(&self) -> Result<bool> {
        Ok(self.version_output().await?.contains("CUDA"))
    }

    /// Whether `--flash-attn` takes an `on|off|auto` argument rather than
    /// being a bare flag.
    pub async fn flash_attn_takes_value(&self) -> Result<bool> {
        Ok(self.help_output().await?.contains(FLASH_ATTN_ENUM_MARKER))
    }

    async fn capture(&self, args: &[&str], prefer_stderr: bool) -> Result<String> {
        let cli = self
            .cli_path()
            .ok_or_else(|| Error::NotFound(format!("{CLI_BINARY} in {}", self.root().display())))?;
        let output = tokio::process::Command::new(&cli)
            .args(args)
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let text = if prefer_stderr && !stderr.trim().is_empty() {
            stderr
        } else if stdout.trim().is_empty() {
            stderr
        } else {
            stdout
        };
        Ok(text.into_owned())
    }
}

fn parse_build_version(output: &str) -> Result<u64> {
    // The release banner looks like `version: 5011 (58caa3a4)`; fall back to
    // a bare `version: N` for locally built binaries.
    for pattern in [r"version:\s*(\d+)\s*\([^)]+\)", r"version:\s*(\d+)"] {
        let re = Regex::new(pattern).expect("const regex");
        if let Some(caps) = re.captures(output) {
            if let Ok(version) = caps[1].parse::<u64>() {
                return Ok(version);
            }
        }
    }
    Err(Error::Parse(format!(
        "no version number in llama-cli output: {:?}",
        output.lines().next().unwrap_or_default()
    )))
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_release_and_bare_version_lines() {
        let banner = "register_backend: registered backend CUDA (1 devices)\nversion: 5011 (58caa3a4)\nbuilt with cc";
        assert_eq!(parse_build_version(banner).unwrap(), 5011);
        assert_eq!(parse_build_version("version: 4722").unwrap(), 4722);
        assert!(matches!(
            parse_build_version("llama-cli: unknown flag"),
            Err(Error::Parse(_))
        ));
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;

        fn fake_binary(dir: &Path, name: &str, script: &str) {
            let path = dir.join(name);
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        #[test]
        fn detect_finds_nested_installation() {
            let dir = tempfile::tempdir().unwrap();
            let nested = dir.path().join("build").join("bin");
            std::fs::create_dir_all(&nested).unwrap();
            fake_binary(&nested, SERVER_BINARY, "#!/bin/sh\nexit 0\n");
            fake_binary(&nested, CLI_BINARY, "#!/bin/sh\nexit 0\n");

            let install = Installation::detect(dir.path()).unwrap();
            assert_eq!(install.root(), nested);
            assert!(install.server_path().is_some());
            assert!(install.cli_path().is_some());
        }

        #[test]
        fn detect_requires_both_binaries_executable() {
            let dir = tempfile::tempdir().unwrap();
            fake_binary(dir.path(), SERVER_BINARY, "#!/bin/sh\nexit 0\n");
            // llama-cli present but not executable.
            std::fs::write(dir.path().join(CLI_BINARY), "#!/bin/sh\n").unwrap();
            std::fs::set_permissions(
                dir.path().join(CLI_BINARY),
                std::fs::Permissions::from_mode(0o644),
            )
            .unwrap();
            assert!(Installation::detect(dir.path()).is_none());
        }

        #[tokio::test]
        async fn version_and_features_come_from_cli_output() {
            let dir = tempfile::tempdir().unwrap();
            fake_binary(dir.path(), SERVER_BINARY, "#!/bin/sh\nexit 0\n");
            fake_binary(
                dir.path(),
                CLI_BINARY,
                concat!(
                    "#!/bin/sh\n",
                    "if [ \"$1\" = --version ]; then\n",
                    "  echo 'ggml_cuda_init: found 1 CUDA devices' >&2\n",
                    "  echo 'version: 6123 (0abc123f)' >&2\n",
                    "else\n",
                    "  echo 'usage: llama-cli [options]'\n",
                    "  echo ' --flash-attn [on|off|auto]   set flash attention'\n",
                    "fi\n",
                ),
            );

            let install = Installation::at(dir.path());
            assert_eq!(install.build_version().await.unwrap(), 6123);
            assert!(install.has_cuda().await.unwrap());
            assert!(install.flash_attn_takes_value().await.unwrap());
        }

        #[tokio::test]
        async fn missing_cli_is_not_found() {
            let dir = tempfile::tempdir().unwrap();
            let install = Installation::at(dir.path());
            assert!(install.server_path().is_none());
            assert!(matches!(
                install.version_output().await,
                Err(Error::NotFound(_))
            ));
        }
    }
}
