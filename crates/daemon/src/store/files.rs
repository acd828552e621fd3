// Durable file writes.
//
// Content is written to a temporary file in the target directory and
// renamed into place, so a crash mid-write never leaves a torn document.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Atomically replace the file at `path` with `bytes`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("cannot write to path without a parent: {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("cannot write to path without a file name: {}", path.display()))?;

    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("failed to create parent directory for {}", path.display()))?;

    let temp_path = parent.join(format!(".{file_name}.tmp.{}", Uuid::new_v4().simple()));
    let result = async {
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .with_context(|| format!("failed to create temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("failed to write temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("failed to flush temp file {}", temp_path.display()))?;
        drop(file);
        tokio::fs::rename(&temp_path, path)
            .await
            .with_context(|| format!("failed to move temp file into {}", path.display()))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp_path).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::write_atomic;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_new_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.md");

        write_atomic(&path, b"# Hello\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# Hello\n");
    }

    #[tokio::test]
    async fn replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.md");
        std::fs::write(&path, "old content").unwrap();

        write_atomic(&path, b"new content").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new content");
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("doc.md");

        write_atomic(&path, b"nested").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "nested");
    }

    #[tokio::test]
    async fn leaves_no_temp_files_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.md");

        write_atomic(&path, b"content").await.unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["doc.md".to_string()]);
    }

    #[tokio::test]
    async fn empty_write_is_allowed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.md");

        write_atomic(&path, b"").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), Vec::<u8>::new());
    }
}
