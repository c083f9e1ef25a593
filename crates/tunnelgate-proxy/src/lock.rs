//! Cross-process exclusive lock around proxy configuration writes
//!
//! Fragment and aggregate files are not safe against concurrent writers, and
//! invocations of the manager share no memory, so writers serialise on a
//! `flock` held on `lock_path`. The lock is released when the guard is dropped.

use fs4::tokio::AsyncFileExt;
use std::io;
use std::path::Path;
use tokio::fs::{self, File, OpenOptions};
use tracing::debug;

pub struct ConfigLock {
    _file: File,
}

impl ConfigLock {
    pub async fn acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .await?;

        // flock blocks, so wait for it off the async workers
        let file = tokio::task::spawn_blocking(move || file.lock_exclusive().map(|()| file))
            .await
            .map_err(io::Error::other)??;

        debug!("Acquired proxy config lock {:?}", path);
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_serialises_holders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("proxy.lock");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = path.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = ConfigLock::acquire(&path).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
