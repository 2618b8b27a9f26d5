//! Optional on-disk copy of every rewritten playlist.
//!
//! Files land at `<dir>/<host>_<basename>` and are replaced on each fetch.
//! Writing happens off the request path; failures are logged and never
//! reach the client.

use crate::proxy::media;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use url::Url;

/// Per-process counter making temp file names unique across concurrent saves.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug)]
pub struct ManifestArchive {
    dir: PathBuf,
}

impl ManifestArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Archive path for `target`. Characters outside `[A-Za-z0-9._-]` are
    /// replaced so the name cannot escape the directory.
    pub fn path_for(&self, target: &Url) -> PathBuf {
        let host = target.host_str().unwrap_or("unknown");
        let name = format!("{}_{}", sanitize(host), sanitize(&media::basename(target)));
        self.dir.join(name)
    }

    /// Write `body` in the background.
    pub fn save(&self, target: &Url, body: Bytes) {
        let path = self.path_for(target);
        let dir = self.dir.clone();
        tokio::spawn(async move {
            if let Err(e) = write_atomic(&dir, &path, &body).await {
                warn!("Failed to archive playlist to {:?}: {}", path, e);
            } else {
                debug!("Archived playlist to {:?}", path);
            }
        });
    }
}

/// Write to a temp file and rename so readers never see a partial playlist.
async fn write_atomic(dir: &Path, path: &Path, body: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let temp_path = temp_path_for(path);
    tokio::fs::write(&temp_path, body).await?;
    tokio::fs::rename(&temp_path, path).await
}

/// `<path>.<pid>.<seq>.tmp`, next to the final file so the rename stays on
/// one filesystem.
fn temp_path_for(path: &Path) -> PathBuf {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut temp = path.as_os_str().to_owned();
    temp.push(format!(".{}.{}.tmp", std::process::id(), seq));
    PathBuf::from(temp)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hls-relay-{label}-{}", std::process::id()))
    }

    #[test]
    fn path_is_host_and_basename() {
        let archive = ManifestArchive::new("/srv/saved");
        let url = Url::parse("https://cdn.example.com/live/index.m3u8?token=1").unwrap();
        assert_eq!(
            archive.path_for(&url),
            PathBuf::from("/srv/saved/cdn.example.com_index.m3u8")
        );
    }

    #[test]
    fn path_falls_back_to_file() {
        let archive = ManifestArchive::new("/srv/saved");
        let url = Url::parse("https://cdn.example.com/live/").unwrap();
        assert_eq!(
            archive.path_for(&url),
            PathBuf::from("/srv/saved/cdn.example.com_file")
        );
    }

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize("a%2F..%2Fb.m3u8"), "a_2F.._2Fb.m3u8");
        assert_eq!(sanitize("..hidden"), "hidden");
    }

    #[test]
    fn temp_paths_are_unique_per_write() {
        let path = Path::new("/srv/saved/origin.example_index.m3u8");
        let a = temp_path_for(path);
        let b = temp_path_for(path);
        assert_ne!(a, b);
        assert_eq!(a.parent(), path.parent());
        assert!(a.to_string_lossy().ends_with(".tmp"));
    }

    #[tokio::test]
    async fn concurrent_writes_leave_one_whole_body() {
        let dir = temp_dir("concurrent");
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let path = dir.join("origin.example_index.m3u8");
        let bodies: Vec<Vec<u8>> = (0..8u8)
            .map(|i| vec![b'a' + i; 64 * 1024])
            .collect();

        let writes = bodies.iter().map(|body| write_atomic(&dir, &path, body));
        for result in futures_util::future::join_all(writes).await {
            result.unwrap();
        }

        let written = tokio::fs::read(&path).await.unwrap();
        assert!(bodies.contains(&written), "archived file mixes bodies");

        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name());
        }
        assert_eq!(names.len(), 1, "leftover temp files: {names:?}");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn save_writes_file() {
        let dir = temp_dir("save");
        let archive = ManifestArchive::new(&dir);
        let url = Url::parse("https://origin.example/stream/index.m3u8").unwrap();

        archive.save(&url, Bytes::from("#EXTM3U\n"));

        let path = dir.join("origin.example_index.m3u8");
        let mut contents = None;
        for _ in 0..50 {
            if let Ok(c) = tokio::fs::read_to_string(&path).await {
                contents = Some(c);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(contents.as_deref(), Some("#EXTM3U\n"));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
