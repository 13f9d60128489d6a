use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use futures_util::StreamExt;
use resources::objects::Distribution;
use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncWriteExt};

use crate::exec::{Cmd, CommandRunner};

const PROGRESS_STEP: u64 = 64 << 20;

/// Local cache of downloaded cloud images.
#[derive(Debug, Clone)]
pub struct ImageCache {
    dir: PathBuf,
    client: reqwest::Client,
}

impl ImageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Path the usable (decompressed) image of `distro` has in the cache.
    pub fn image_path(&self, distro: &Distribution) -> PathBuf {
        match local_path(&distro.url) {
            Some(path) if !distro.is_compressed() => path,
            _ => self.dir.join(distro.image_file_name()),
        }
    }

    /// Make sure the image of `distro` is available locally and return its path.
    pub async fn fetch(&self, runner: &dyn CommandRunner, distro: &Distribution) -> Result<PathBuf> {
        let image = self.image_path(distro);
        if runner.is_dry_run() {
            tracing::info!("[dry-run] would fetch {} into {}", distro.url, image.display());
            return Ok(image);
        }
        if fs::metadata(&image).await.is_ok() {
            tracing::info!("Using cached image {}", image.display());
            return Ok(image);
        }
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create image cache {}", self.dir.display()))?;

        let download = match local_path(&distro.url) {
            Some(path) => {
                if let Some(expected) = &distro.sha256 {
                    verify_file(&path, expected).await?;
                }
                path
            },
            None => self.download(distro).await?,
        };

        if distro.is_compressed() {
            self.decompress(runner, &download, &image).await?;
        }
        Ok(image)
    }

    async fn download(&self, distro: &Distribution) -> Result<PathBuf> {
        let file_name = distro
            .url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow!("Cannot derive a file name from {}", distro.url))?;
        let target = self.dir.join(file_name);
        let partial = self.dir.join(format!("{}.part", file_name));

        tracing::info!("Downloading {}...", distro.url);
        let response = self
            .client
            .get(&distro.url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", distro.url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("Error downloading {}. status: {}", distro.url, status);
        }
        let total = response.content_length();

        let mut file = fs::File::create(&partial)
            .await
            .with_context(|| format!("Failed to create {}", partial.display()))?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut next_report = PROGRESS_STEP;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Failed to download {}", distro.url))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if written >= next_report {
                match total {
                    Some(total) => tracing::info!(
                        "{}: {} / {} MiB",
                        file_name,
                        written >> 20,
                        total >> 20
                    ),
                    None => tracing::info!("{}: {} MiB", file_name, written >> 20),
                }
                next_report += PROGRESS_STEP;
            }
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = &distro.sha256 {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                fs::remove_file(&partial).await.ok();
                bail!(
                    "Checksum mismatch for {}: expected {}, got {}",
                    distro.url,
                    expected,
                    actual
                );
            }
            tracing::info!("Checksum of {} verified", file_name);
        }
        fs::rename(&partial, &target)
            .await
            .with_context(|| format!("Failed to move {} into place", partial.display()))?;
        tracing::info!("Downloaded {} ({} MiB)", target.display(), written >> 20);
        Ok(target)
    }

    async fn decompress(&self, runner: &dyn CommandRunner, source: &Path, target: &Path) -> Result<()> {
        tracing::info!("Decompressing {}...", source.display());
        let partial = target.with_extension("part");
        let output = runner
            .check(
                &Cmd::new("sh")
                    .arg("-c")
                    .arg("xz --decompress --stdout \"$1\" > \"$2\"")
                    .arg("xz")
                    .arg(source.display().to_string())
                    .arg(partial.display().to_string()),
            )
            .await;
        if let Err(err) = output {
            fs::remove_file(&partial).await.ok();
            return Err(err).with_context(|| format!("Failed to decompress {}", source.display()));
        }
        fs::rename(&partial, target).await?;
        Ok(())
    }
}

fn local_path(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file://").map(PathBuf::from)
}

async fn verify_file(path: &Path, expected: &str) -> Result<()> {
    let content = fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let actual = hex::encode(Sha256::digest(&content));
    if !actual.eq_ignore_ascii_case(expected) {
        bail!(
            "Checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use resources::objects::{distribution::ImageFormat, OsFamily};

    use super::*;
    use crate::exec::{DryRunRunner, SystemRunner};

    fn distro(url: &str, sha256: Option<&str>) -> Distribution {
        Distribution {
            key: "test".to_string(),
            name: "Test".to_string(),
            family: OsFamily::Debian,
            release: "1".to_string(),
            url: url.to_string(),
            format: ImageFormat::Qcow2,
            sha256: sha256.map(str::to_owned),
            default_user: "debian".to_string(),
            cloud_init: true,
        }
    }

    #[tokio::test]
    async fn local_images_are_used_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("local.qcow2");
        std::fs::write(&image, b"disk").unwrap();
        let sum = hex::encode(Sha256::digest(b"disk"));
        let cache = ImageCache::new(dir.path().join("cache"));
        let url = format!("file://{}", image.display());

        let path = cache
            .fetch(&SystemRunner::default(), &distro(&url, Some(&sum)))
            .await
            .unwrap();
        assert_eq!(path, image);
    }

    #[tokio::test]
    async fn local_checksum_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("local.qcow2");
        std::fs::write(&image, b"disk").unwrap();
        let cache = ImageCache::new(dir.path().join("cache"));
        let url = format!("file://{}", image.display());

        let err = cache
            .fetch(&SystemRunner::default(), &distro(&url, Some("00ff")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[tokio::test]
    async fn cached_image_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path());
        let d = distro("https://example.invalid/images/cached.img", None);
        std::fs::write(dir.path().join("cached.img"), b"disk").unwrap();

        let path = cache.fetch(&SystemRunner::default(), &d).await.unwrap();
        assert_eq!(path, dir.path().join("cached.img"));
    }

    #[tokio::test]
    async fn dry_run_does_not_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path());
        let d = distro("https://example.invalid/images/foo.qcow2.xz", None);

        let path = cache.fetch(&DryRunRunner, &d).await.unwrap();
        assert_eq!(path, dir.path().join("foo.qcow2"));
        assert!(!path.exists());
    }
}
