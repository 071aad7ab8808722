//! Sitemap buckets: scheme, host and directory of each captured URL

use parking_lot::RwLock;
use std::collections::HashSet;
use url::Url;

/// Bucket for `url`: everything up to and including the last `/` of the path.
///
/// `https://example.com/a/b.php?x=1` buckets as `https://example.com/a/`.
pub fn sitemap_bucket(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;

    let mut bucket = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        bucket.push_str(&format!(":{}", port));
    }

    let path = parsed.path();
    match path.rfind('/') {
        Some(idx) => bucket.push_str(&path[..=idx]),
        None => bucket.push('/'),
    }
    Some(bucket)
}

/// Set of buckets seen so far in this project.
#[derive(Default)]
pub struct SiteMap {
    seen: RwLock<HashSet<String>>,
}

impl SiteMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `bucket`; true the first time it is seen.
    pub fn insert(&self, bucket: &str) -> bool {
        if self.seen.read().contains(bucket) {
            return false;
        }
        self.seen.write().insert(bucket.to_string())
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.seen.read().iter().cloned().collect();
        paths.sort();
        paths
    }
}
