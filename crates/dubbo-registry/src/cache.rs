//! Durable provider cache
//!
//! One JSON file per service key, named after the key with `:` replaced by
//! `@` (and a group's `/` by `+`), holding `{"url": <subscription url>, "value": [<provider url>, ...]}`.

use crate::{
    error::{Error, Result},
    url::ServiceUrl,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A cached subscription value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The subscription URL the value belongs to
    pub url: ServiceUrl,
    /// Last known provider URL strings
    pub value: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    url: String,
    value: Vec<String>,
}

/// Result of loading the cache directory
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    /// Entries keyed by service key
    pub entries: HashMap<String, CacheEntry>,
    /// Files that were skipped
    pub errors: Vec<Error>,
}

/// File-per-service provider cache
#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    /// Open the cache, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        async_fs::create_dir_all(&dir).await?;
        info!("Using local registry cache at {:?}", dir);
        Ok(Self { dir })
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every cache file
    ///
    /// Unreadable or malformed files are skipped and reported in
    /// [`CacheSnapshot::errors`]; the rest still load.
    pub async fn load_all(&self) -> Result<CacheSnapshot> {
        use futures::StreamExt;

        let mut snapshot = CacheSnapshot::default();
        let mut dir = async_fs::read_dir(&self.dir).await?;

        while let Some(entry) = dir.next().await {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if filename.ends_with(TMP_SUFFIX) {
                continue;
            }

            match Self::load_file(&path).await {
                Ok(cache_entry) => {
                    let key = cache_entry
                        .url
                        .service_key()
                        .unwrap_or_else(|| filename.replace('@', ":").replace('+', "/"));
                    debug!("Loaded cached value for {} ({} urls)", key, cache_entry.value.len());
                    snapshot.entries.insert(key, cache_entry);
                }
                Err(reason) => {
                    warn!("Skipping local cache file {:?}: {}", path, reason);
                    snapshot.errors.push(Error::CacheLoad { path, reason });
                }
            }
        }

        Ok(snapshot)
    }

    async fn load_file(path: &Path) -> std::result::Result<CacheEntry, String> {
        let content = async_fs::read_to_string(path)
            .await
            .map_err(|e| e.to_string())?;
        let file: CacheFile =
            serde_json::from_str(content.trim()).map_err(|e| format!("{e}, data: {content:?}"))?;
        let url = ServiceUrl::value_of(&file.url).map_err(|e| e.to_string())?;
        Ok(CacheEntry {
            url,
            value: file.value,
        })
    }

    /// Persist the value for the subscription `url`
    pub async fn write(&self, url: &ServiceUrl, value: &[String]) -> Result<()> {
        let key = url.service_key().ok_or_else(|| {
            Error::invalid_url(url.to_full_string(), "no service key to cache under")
        })?;
        let path = self.path_for(&key);
        let content = serde_json::to_vec(&CacheFile {
            url: url.to_full_string(),
            value: value.to_vec(),
        })?;

        // Replace atomically so a crash never leaves a torn file behind
        let tmp = path.with_file_name(format!("{}{}", file_name(&key), TMP_SUFFIX));
        async_fs::write(&tmp, content).await?;
        async_fs::rename(&tmp, &path).await?;
        debug!("Wrote local cache for {} to {:?}", key, path);
        Ok(())
    }

    /// File holding the entry for `service_key`
    pub fn path_for(&self, service_key: &str) -> PathBuf {
        self.dir.join(file_name(service_key))
    }
}

const TMP_SUFFIX: &str = ".tmp";

fn file_name(service_key: &str) -> String {
    service_key.replace(':', "@").replace('/', "+")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_url() -> ServiceUrl {
        ServiceUrl::new("consumer", "127.0.0.1", 0, "com.test.TestService").with_parameters([
            ("category", "providers,configurators,routers"),
            ("methods", "*"),
            ("side", "consumer"),
            ("interface", "com.test.TestService"),
            ("version", "1.0.0"),
        ])
    }

    #[smol_potat::test]
    async fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("nested").join("cache");
        LocalCache::open(&cache_dir).await.unwrap();
        assert!(cache_dir.is_dir());
    }

    #[smol_potat::test]
    async fn test_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).await.unwrap();
        let url = consumer_url();
        let value = vec![
            "dubbo://127.0.0.1:12200/com.test.TestService?application=test&interface=com.test.TestService&version=1.0.0".to_string(),
            "dubbo://127.0.0.2:12200/com.test.TestService?application=test&interface=com.test.TestService&version=1.0.0".to_string(),
        ];
        cache.write(&url, &value).await.unwrap();
        assert!(dir.path().join("com.test.TestService@1.0.0").is_file());

        let snapshot = cache.load_all().await.unwrap();
        assert!(snapshot.errors.is_empty());
        assert_eq!(snapshot.entries.len(), 1);
        let entry = &snapshot.entries["com.test.TestService:1.0.0"];
        assert_eq!(entry.url, url);
        assert_eq!(entry.value, value);
    }

    #[smol_potat::test]
    async fn test_bad_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).await.unwrap();
        cache.write(&consumer_url(), &[]).await.unwrap();
        async_fs::write(dir.path().join("broken@1.0.0"), "{not json").await.unwrap();

        let snapshot = cache.load_all().await.unwrap();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.errors.len(), 1);
        assert!(matches!(snapshot.errors[0], Error::CacheLoad { .. }));
    }

    #[smol_potat::test]
    async fn test_grouped_key_stays_in_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).await.unwrap();
        let url = consumer_url().with_parameter("group", "blue");
        cache.write(&url, &[]).await.unwrap();
        assert!(dir.path().join("blue+com.test.TestService@1.0.0").is_file());

        let snapshot = cache.load_all().await.unwrap();
        assert!(snapshot.entries.contains_key("blue/com.test.TestService:1.0.0"));
    }
}
