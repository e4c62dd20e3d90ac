//! On-disk geometry cache artifacts.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Extension of cache artifacts.
pub const EXTENSION: &str = "json";

/// File name of the artifact for `name` at `frame`, e.g. `foo.0001.json`.
pub fn artifact_name(name: &str, frame: i64) -> String {
    format!("{name}.{frame:04}.{EXTENSION}")
}

/// Full path of the artifact for `name` at `frame` under `dir`.
pub fn cache_path(dir: &Path, name: &str, frame: i64) -> PathBuf {
    dir.join(artifact_name(name, frame))
}

/// Decide whether an existing artifact may be reused.
///
/// When `use_cache` is false a stale artifact is deleted so the next write
/// starts fresh. Returns whether the artifact should be read instead of
/// re-streaming.
pub async fn resolve(path: &Path, use_cache: bool) -> Result<bool> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(false);
    }
    if use_cache {
        return Ok(true);
    }
    tracing::debug!(path = %path.display(), "removing stale cache artifact");
    tokio::fs::remove_file(path).await?;
    Ok(false)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_naming() {
        assert_eq!(artifact_name("foo", 1), "foo.0001.json");
        assert_eq!(artifact_name("foo", 12345), "foo.12345.json");
        assert_eq!(
            cache_path(Path::new("/tmp/hyview"), "bar", 42),
            PathBuf::from("/tmp/hyview/bar.0042.json")
        );
    }

    #[tokio::test]
    async fn test_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let path = cache_path(dir.path(), "foo", 1);

        assert!(!resolve(&path, true).await.unwrap());

        std::fs::write(&path, "{}").unwrap();
        assert!(resolve(&path, true).await.unwrap());
        assert!(path.exists());

        assert!(!resolve(&path, false).await.unwrap());
        assert!(!path.exists());
    }
}
