// src/fetch.rs

//! Source fetching with a local cache, retries, and bounded parallelism
//!
//! Every source is cached under its URL basename in the sources cache;
//! a file already present is reused unless `force` is set. Downloads
//! stream into a `.part` file that is renamed into place only on success,
//! so a failed or interrupted fetch never leaves a partial file behind.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::package::PackageId;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// HTTP request timeout per attempt
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Base delay between retries; grows linearly with the attempt number
const RETRY_DELAY_MS: u64 = 500;

/// Streaming copy buffer
const BUFFER_SIZE: usize = 64 * 1024;

pub struct Fetcher {
    cache_dir: PathBuf,
    retry: u32,
    parallel: u32,
    force: bool,
}

impl Fetcher {
    pub fn new(config: &Config, force: bool) -> Self {
        Self {
            cache_dir: config.cache_sources_dir.clone(),
            retry: config.retry.max(1),
            parallel: config.parallel.max(1),
            force,
        }
    }

    /// The cache path a source URL maps to
    pub fn cache_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(basename(url))
    }

    /// Fetch every source for one package; all sources must succeed
    ///
    /// Sources are fetched concurrently up to the configured parallelism.
    /// Returns the cache paths in source order.
    pub fn fetch(&self, pkg: &PackageId, sources: &[String]) -> Result<Vec<PathBuf>> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        fs::create_dir_all(&self.cache_dir)
            .map_err(|e| Error::io(format!("creating {}", self.cache_dir.display()), e))?;

        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Io(format!("building HTTP client: {e}")))?;

        let progress = MultiProgress::new();
        let next = AtomicUsize::new(0);
        let results: Mutex<Vec<Option<Result<PathBuf>>>> =
            Mutex::new((0..sources.len()).map(|_| None).collect());
        let workers = (self.parallel as usize).min(sources.len());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        if idx >= sources.len() {
                            break;
                        }
                        let result = self.fetch_one(&client, &progress, &sources[idx]);
                        results.lock().unwrap()[idx] = Some(result);
                    }
                });
            }
        });

        let results = results.into_inner().unwrap();
        let mut paths = Vec::with_capacity(sources.len());
        for result in results {
            paths.push(result.expect("every source index was processed")?);
        }
        info!(package = %pkg, sources = paths.len(), "sources ready");
        Ok(paths)
    }

    fn fetch_one(&self, client: &Client, progress: &MultiProgress, url: &str) -> Result<PathBuf> {
        let dest = self.cache_path(url);

        if dest.exists() && !self.force {
            debug!(source = url, cached = %dest.display(), "using cached source");
            return Ok(dest);
        }

        if let Some(path) = local_source(url) {
            fs::copy(&path, &dest)
                .map_err(|e| Error::io(format!("copying {} into cache", path.display()), e))?;
            return Ok(dest);
        }

        let mut last_error = String::new();
        for attempt in 1..=self.retry {
            match self.download(client, progress, url, &dest) {
                Ok(()) => return Ok(dest),
                Err(err) => {
                    warn!(source = url, attempt, error = %err, "download failed");
                    last_error = err.to_string();
                    if attempt < self.retry {
                        std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                    }
                }
            }
        }
        Err(Error::Fetch {
            url: url.to_string(),
            attempts: self.retry,
            reason: last_error,
        })
    }

    fn download(
        &self,
        client: &Client,
        progress: &MultiProgress,
        url: &str,
        dest: &Path,
    ) -> Result<()> {
        let part = dest.with_extension(format!(
            "{}part",
            dest.extension()
                .map(|e| format!("{}.", e.to_string_lossy()))
                .unwrap_or_default()
        ));

        let result = self.download_to_part(client, progress, url, &part);
        match result {
            Ok(()) => {
                fs::rename(&part, dest)
                    .map_err(|e| Error::io(format!("activating {}", dest.display()), e))?;
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&part);
                Err(err)
            }
        }
    }

    fn download_to_part(
        &self,
        client: &Client,
        progress: &MultiProgress,
        url: &str,
        part: &Path,
    ) -> Result<()> {
        let mut response = client
            .get(url)
            .send()
            .map_err(|e| Error::Io(format!("requesting {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Io(format!("{url}: HTTP {}", response.status())));
        }

        let total = response.content_length().unwrap_or(0);
        let bar = progress.add(progress_bar(total, &basename(url)));

        let mut file = File::create(part)
            .map_err(|e| Error::io(format!("creating {}", part.display()), e))?;
        let mut buffer = [0u8; BUFFER_SIZE];
        let mut downloaded = 0u64;
        loop {
            let n = response
                .read(&mut buffer)
                .map_err(|e| Error::Io(format!("reading {url}: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])
                .map_err(|e| Error::io(format!("writing {}", part.display()), e))?;
            downloaded += n as u64;
            bar.set_position(downloaded);
        }
        file.sync_all()
            .map_err(|e| Error::io(format!("syncing {}", part.display()), e))?;
        bar.finish_and_clear();
        Ok(())
    }
}

/// Interpret `file://` URLs and plain filesystem paths as local sources
fn local_source(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if !url.contains("://") {
        return Some(PathBuf::from(url));
    }
    None
}

/// Cache key for a source URL: its basename with any query string stripped
fn basename(url: &str) -> String {
    let no_query = url.split(['?', '#']).next().unwrap_or(url);
    no_query
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("source")
        .to_string()
}

fn progress_bar(total: u64, name: &str) -> ProgressBar {
    let bar = if total > 0 {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template("{msg:20} {bytes}/{total_bytes} {wide_bar}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    } else {
        ProgressBar::new_spinner()
    };
    bar.set_message(name.to_string());
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basename() {
        assert_eq!(basename("https://example.com/a/b/pkg-1.0.tar.gz"), "pkg-1.0.tar.gz");
        assert_eq!(basename("https://example.com/dl?f=x.tar.gz"), "dl");
        assert_eq!(basename("file:///src/alpha.tar.zst"), "alpha.tar.zst");
        assert_eq!(basename("https://example.com/"), "source");
    }

    #[test]
    fn test_local_source_detection() {
        assert_eq!(
            local_source("file:///srv/src/a.tar.gz"),
            Some(PathBuf::from("/srv/src/a.tar.gz"))
        );
        assert_eq!(
            local_source("/srv/src/a.tar.gz"),
            Some(PathBuf::from("/srv/src/a.tar.gz"))
        );
        assert_eq!(local_source("https://example.com/a.tar.gz"), None);
    }

    fn fetcher(dir: &Path) -> Fetcher {
        let mut config = Config::for_root(dir);
        config.parallel = 2;
        config.retry = 2;
        Fetcher::new(&config, false)
    }

    #[test]
    fn test_fetch_local_sources() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("upstream/alpha-1.0.tar.gz");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, b"tarball").unwrap();

        let f = fetcher(dir.path());
        fs::create_dir_all(&f.cache_dir).unwrap();
        let pkg = PackageId::new("alpha", "1.0");
        let paths = f
            .fetch(&pkg, &[format!("file://{}", src.display())])
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(fs::read(&paths[0]).unwrap(), b"tarball");
        assert_eq!(paths[0], f.cache_path("alpha-1.0.tar.gz"));
    }

    #[test]
    fn test_cached_source_reused() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path());
        fs::create_dir_all(&f.cache_dir).unwrap();
        let cached = f.cache_path("alpha-1.0.tar.gz");
        fs::write(&cached, b"already here").unwrap();

        // no upstream file exists; the cache satisfies the fetch
        let pkg = PackageId::new("alpha", "1.0");
        let paths = f
            .fetch(&pkg, &["file:///nonexistent/alpha-1.0.tar.gz".to_string()])
            .unwrap();
        assert_eq!(fs::read(&paths[0]).unwrap(), b"already here");
    }

    #[test]
    fn test_failed_fetch_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path());
        fs::create_dir_all(&f.cache_dir).unwrap();
        let pkg = PackageId::new("alpha", "1.0");
        let err = f
            .fetch(&pkg, &["file:///nonexistent/missing.tar.gz".to_string()])
            .unwrap_err();
        // local copy failures surface as I/O errors, not silent skips
        assert!(matches!(err, Error::Io(_)));
        assert!(!f.cache_path("missing.tar.gz").exists());
    }
}
