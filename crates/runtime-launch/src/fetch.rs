//! Download and unpack runtime distribution archives.
//!
//! The bootstrap only needs two capabilities: fetch a URL to a local file,
//! and unpack a zip into a directory. [`ArchiveFetcher`] names them so the
//! orchestrator can be driven by a fake in tests; [`HttpFetcher`] is the
//! real implementation on top of `reqwest` and `zip`.

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use log::{debug, info};
use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use zip::ZipArchive;

/// Fetches and unpacks distribution archives.
pub trait ArchiveFetcher: Send + Sync {
    /// Download `url` to `dest`, failing on a non-success HTTP status.
    fn download<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Unpack the zip at `archive` into `dest`, overwriting existing files.
    fn extract<'a>(
        &'a self,
        archive: &'a Path,
        dest: &'a Path,
    ) -> impl Future<Output = Result<()>> + Send + 'a;
}

/// [`ArchiveFetcher`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        // Follows redirects (python.org and bootstrap.pypa.io both redirect)
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }
}

impl ArchiveFetcher for HttpFetcher {
    fn download<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        async move {
            info!("Downloading {} -> {:?}", url, dest);

            let response = self.client.get(url).send().await?;
            if !response.status().is_success() {
                return Err(anyhow!(
                    "Failed to download {}: {}",
                    url,
                    response.status()
                ));
            }

            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(dest)
                .await
                .with_context(|| format!("Failed to create {:?}", dest))?;

            let mut written: u64 = 0;
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;

            debug!("Downloaded {} bytes from {}", written, url);
            Ok(())
        }
    }

    fn extract<'a>(
        &'a self,
        archive: &'a Path,
        dest: &'a Path,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        async move {
            info!("Extracting {:?} to {:?}...", archive, dest);
            // Zip IO is blocking, run it on the blocking pool
            let count = tokio::task::spawn_blocking(move || extract_zip(&archive, &dest))
                .await
                .map_err(|e| anyhow!("Extraction task panicked: {}", e))??;
            debug!("Extracted {} entries", count);
            Ok(())
        }
    }
}

/// Unpack every entry of a zip file into `dest`. Returns the entry count.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive).with_context(|| format!("Failed to open {:?}", archive))?;
    let mut zip = ZipArchive::new(file)?;
    std::fs::create_dir_all(dest)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let relative: PathBuf = entry
            .enclosed_name()
            .ok_or_else(|| anyhow!("Archive entry escapes destination: {}", entry.name()))?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // File::create truncates, so existing files are overwritten
        let mut out = File::create(&out_path)
            .with_context(|| format!("Failed to write {:?}", out_path))?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
        }
    }

    Ok(zip.len())
}
