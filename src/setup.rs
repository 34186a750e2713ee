//! Fetching a prebuilt llama.cpp release into an installation directory.
//!
//! Downloads the official release archive for the current platform, extracts
//! it, fixes up permissions and hands back an [`Installation`]. A directory
//! that already holds a different build is refused rather than overwritten.

use std::path::Path;

use futures_util::StreamExt;

use crate::error::{Error, Result};
use crate::installation::Installation;

/// Official release downloads; overridable for mirrors.
pub const DEFAULT_RELEASE_BASE_URL: &str =
    "https://github.com/ggml-org/llama.cpp/releases/download";

pub struct Installer {
    base_url: String,
    client: reqwest::Client,
}

impl Installer {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("llamactl/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: DEFAULT_RELEASE_BASE_URL.to_string(),
            client,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Ensure `dir` contains llama.cpp build `build`.
    ///
    /// An existing installation of the same build is reused as-is; one of a
    /// different build fails with [`Error::VersionMismatch`] and the
    /// directory is left untouched. Otherwise the release archive is
    /// downloaded and extracted into `dir`.
    pub async fn install(&self, dir: &Path, build: u64) -> Result<Installation> {
        if let Some(existing) = Installation::detect(dir) {
            let found = existing.build_version().await?;
            if found != build {
                return Err(Error::VersionMismatch {
                    expected: build,
                    found,
                });
            }
            log::debug!("build {build} already installed in {}", dir.display());
            return Ok(existing);
        }

        tokio::fs::create_dir_all(dir).await?;
        let archive_name = release_archive_name(build);
        let url = format!("{}/b{build}/{archive_name}", self.base_url);
        let archive_path = dir.join(&archive_name);
        log::info!("downloading {url}");
        self.download_to_file(&url, &archive_path).await?;

        extract_zip(&archive_path, dir)?;
        let _ = tokio::fs::remove_file(&archive_path).await;
        #[cfg(unix)]
        set_executable_permissions(dir);

        Installation::detect(dir).ok_or_else(|| {
            Error::NotFound(format!(
                "no llama-server/llama-cli found after extracting {archive_name} into {}",
                dir.display()
            ))
        })
    }

    /// Streamed download into `dest` via a `.part` file, renamed on success.
    async fn download_to_file(&self, url: &str, dest: &Path) -> Result<()> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::NotFound(format!("{url} -> HTTP {}", resp.status())));
        }
        let expected = resp.content_length();

        let tmp_path = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut stream = resp.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(e.into());
                }
            };
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
            written = written.saturating_add(chunk.len() as u64);
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        drop(file);

        if let Some(len) = expected {
            if written != len {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(Error::Protocol(format!(
                    "incomplete download ({written}/{len} bytes) from {url}"
                )));
            }
        }
        tokio::fs::rename(&tmp_path, dest).await?;
        Ok(())
    }
}

/// Zip asset name for the current platform. Only the zip assets are used so
/// extraction stays in-process.
fn release_archive_name(build: u64) -> String {
    #[cfg(target_os = "windows")]
    {
        format!("llama-b{build}-bin-win-cpu-x64.zip")
    }
    #[cfg(target_os = "macos")]
    {
        #[cfg(target_arch = "aarch64")]
        {
            format!("llama-b{build}-bin-macos-arm64.zip")
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            format!("llama-b{build}-bin-macos-x64.zip")
        }
    }
    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    {
        format!("llama-b{build}-bin-ubuntu-x64.zip")
    }
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| Error::Parse(format!("bad zip archive {}: {e}", archive.display())))?;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| Error::Parse(format!("bad zip entry: {e}")))?;
        let entry_name = entry.name().replace('\\', "/");
        // Refuse absolute paths and traversal.
        if entry_name.starts_with('/') || entry_name.contains("..") {
            continue;
        }
        let out_path = dest.join(&entry_name);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out)?;
        }
    }
    Ok(())
}

/// Extracted binaries need their exec bits back.
#[cfg(unix)]
fn set_executable_permissions(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    for entry in walkdir::WalkDir::new(dir)
        .max_depth(3)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if name.starts_with("llama-") || !name.contains('.') {
            let _ = std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(0o755));
        }
    }
}

/// Install with the default release source.
pub async fn install(dir: impl AsRef<Path>, build: u64) -> Result<Installation> {
    Installer::new()?.install(dir.as_ref(), build).await
}
