use std::{
    fs,
    io::Cursor,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use futures_util::StreamExt;

const DOWNLOAD_ATTEMPTS: u32 = 3;
const MAX_ARCHIVE_BYTES: u64 = 512 * 1024 * 1024;

/// Downloads a branch of a repository into a directory.
#[async_trait::async_trait]
pub trait ArchiveFetcher: Send + Sync {
    /// `dest` must not exist yet; it is created with the branch contents at its root.
    async fn fetch(&self, source_repo: &str, branch: &str, dest: &Path) -> anyhow::Result<()>;
}

/// Fetches `https://github.com/<repo>/archive/<branch>.zip` and unpacks it.
pub struct GithubArchiveFetcher {
    http: reqwest::Client,
    base_url: String,
}

impl GithubArchiveFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: "https://github.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn archive_url(&self, source_repo: &str, branch: &str) -> String {
        format!("{}/{source_repo}/archive/{branch}.zip", self.base_url)
    }

    async fn download_once(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("request branch archive")?
            .error_for_status()
            .context("branch archive returned non-2xx")?;

        let mut out: Vec<u8> = Vec::new();
        if let Some(len) = resp.content_length() {
            out.reserve(len.min(MAX_ARCHIVE_BYTES) as usize);
        }
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("read branch archive body chunk")?;
            out.extend_from_slice(&chunk);
            if out.len() as u64 > MAX_ARCHIVE_BYTES {
                anyhow::bail!("branch archive exceeds {MAX_ARCHIVE_BYTES} bytes");
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl ArchiveFetcher for GithubArchiveFetcher {
    async fn fetch(&self, source_repo: &str, branch: &str, dest: &Path) -> anyhow::Result<()> {
        let url = self.archive_url(source_repo, branch);

        let mut last_err: Option<anyhow::Error> = None;
        let mut bytes: Option<Vec<u8>> = None;
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            match self.download_once(&url).await {
                Ok(b) => {
                    bytes = Some(b);
                    break;
                }
                Err(e) => {
                    tracing::debug!(%url, attempt, error = %format!("{e:#}"), "archive download attempt failed");
                    last_err = Some(e);
                    if attempt < DOWNLOAD_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            200_u64.saturating_mul(2_u64.pow(attempt - 1)),
                        ))
                        .await;
                    }
                }
            }
        }
        let bytes = bytes
            .ok_or_else(|| last_err.unwrap_or_else(|| anyhow::anyhow!("download failed")))
            .with_context(|| format!("download {url}"))?;

        let dest = dest.to_path_buf();
        let files = tokio::task::spawn_blocking(move || unpack_into(&bytes, &dest))
            .await
            .context("join archive extraction")??;
        tracing::info!(%url, files, "branch archive extracted");
        Ok(())
    }
}

// Extract next to `dest` first so a failed extraction never leaves a half-populated
// site directory behind.
fn unpack_into(bytes: &[u8], dest: &Path) -> anyhow::Result<usize> {
    if dest.exists() {
        anyhow::bail!("destination already exists: {}", dest.display());
    }
    let staging = staging_dir(dest);
    if staging.exists() {
        fs::remove_dir_all(&staging).context("clear stale staging dir")?;
    }
    if let Some(parent) = staging.parent() {
        fs::create_dir_all(parent)?;
    }

    let files = match extract_stripped(bytes, &staging) {
        Ok(n) => n,
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
    };
    fs::rename(&staging, dest).with_context(|| format!("move archive into {}", dest.display()))?;
    Ok(files)
}

fn staging_dir(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}.partial"))
}

/// Unpacks a GitHub branch zip into `out`, dropping the single `<repo>-<branch>/`
/// directory GitHub wraps everything in. Returns the number of files written.
pub fn extract_stripped(bytes: &[u8], out: &Path) -> anyhow::Result<usize> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).context("open branch zip")?;
    fs::create_dir_all(out)?;

    let mut files = 0usize;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("read zip entry")?;
        // Entries that would escape the output directory are skipped.
        let Some(name) = file.enclosed_name() else {
            continue;
        };
        let rel: PathBuf = name.components().skip(1).collect();
        if rel.as_os_str().is_empty() {
            continue;
        }

        let out_path = out.join(&rel);
        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::File::create(&out_path)
            .with_context(|| format!("create extracted file {}", out_path.display()))?;
        std::io::copy(&mut file, &mut f).context("extract file")?;
        files += 1;
    }

    if files == 0 {
        anyhow::bail!("branch archive contained no files");
    }
    Ok(files)
}
