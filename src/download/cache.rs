use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;

use crate::{platform::Platform, utils::hash_id};

/// Extensions a published entry can carry, in lookup order.
const ENTRY_EXTENSIONS: [&str; 4] = ["mp4", "ts", "jpg", "png"];
const PART_MARKER: &str = ".part";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub platform: Platform,
    pub id: String,
    pub index: usize,
}

impl CacheKey {
    pub fn new(platform: Platform, id: impl Into<String>, index: usize) -> Self {
        Self {
            platform,
            id: id.into(),
            index,
        }
    }

    fn stem(&self) -> String {
        format!("{}_{}", hash_id(&self.id), self.index)
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.platform, self.id, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Files under `{root}/{platform}/{hash(id)}_{index}.{ext}`. In-progress data lives in
/// `.part` siblings and only becomes visible through a rename.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.platform.tag())
    }

    pub fn entry_path(&self, key: &CacheKey, ext: &str) -> PathBuf {
        self.dir(key).join(format!("{}.{}", key.stem(), ext))
    }

    pub fn part_path(&self, key: &CacheKey) -> PathBuf {
        self.dir(key).join(format!("{}{}", key.stem(), PART_MARKER))
    }

    /// Scratch file for one piece of a transfer, e.g. an HLS segment.
    pub fn piece_path(&self, key: &CacheKey, piece: usize) -> PathBuf {
        self.dir(key).join(format!("{}{}.{}", key.stem(), PART_MARKER, piece))
    }

    pub async fn prepare(&self, key: &CacheKey) -> std::io::Result<()> {
        fs::create_dir_all(self.dir(key)).await
    }

    /// A published, non-empty file for `key`.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        for ext in ENTRY_EXTENSIONS {
            let path = self.entry_path(key, ext);
            let Ok(metadata) = fs::metadata(&path).await else {
                continue;
            };
            if metadata.is_file() && metadata.len() > 0 {
                let created_at = metadata
                    .created()
                    .or_else(|_| metadata.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                return Some(CacheEntry {
                    key: key.clone(),
                    path,
                    size: metadata.len(),
                    created_at,
                });
            }
        }
        None
    }

    /// Moves the finished `.part` file into place.
    pub async fn publish(&self, key: &CacheKey, ext: &str) -> std::io::Result<CacheEntry> {
        let part = self.part_path(key);
        let path = self.entry_path(key, ext);
        fs::rename(&part, &path).await?;
        let size = fs::metadata(&path).await?.len();
        Ok(CacheEntry {
            key: key.clone(),
            path,
            size,
            created_at: Utc::now(),
        })
    }

    /// Removes every scratch file belonging to `key`.
    pub async fn discard(&self, key: &CacheKey) {
        let prefix = format!("{}{}", key.stem(), PART_MARKER);
        let Ok(mut entries) = fs::read_dir(self.dir(key)).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                if let Err(e) = fs::remove_file(entry.path()).await {
                    warn!("Failed to remove {}: {}", entry.path().display(), e);
                }
            }
        }
    }

    /// Deletes scratch files left behind by an earlier process. Returns how many were removed.
    pub async fn clean_stale(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        let mut platforms = match fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        while let Some(platform) = platforms.next_entry().await? {
            if !platform.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(platform.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if file.file_name().to_string_lossy().contains(PART_MARKER) {
                    fs::remove_file(file.path()).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("Removed {} stale partial files from {}", removed, self.root.display());
        }
        Ok(removed)
    }
}
