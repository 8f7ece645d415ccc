//! `local` scheme backend over the engine host's filesystem.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use geneflow_core::data::{DataBackend, StagingError};
use geneflow_core::locator::{Locator, Scheme};

/// Filesystem operations via `tokio::fs`. A locator's chopped path is used
/// as-is, so relative locators resolve against the process working
/// directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

fn path_of(location: &Locator) -> PathBuf {
    PathBuf::from(location.chopped_path())
}

/// Copy the tree rooted at `src` into `dst`, merging with anything already
/// at `dst`. Walks with an explicit stack.
async fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

impl DataBackend for LocalBackend {
    fn scheme(&self) -> Scheme {
        Scheme::Local
    }

    async fn list(&self, dir: &Locator) -> Result<Vec<String>, StagingError> {
        let path = path_of(dir);
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StagingError::NotFound(dir.serialize()));
            }
            Err(e) => return Err(StagingError::transfer("list", dir, e)),
        };

        let mut names = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => names.push(entry.file_name().to_string_lossy().into_owned()),
                Ok(None) => break,
                Err(e) => return Err(StagingError::transfer("list", dir, e)),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, location: &Locator) -> Result<bool, StagingError> {
        tokio::fs::try_exists(path_of(location))
            .await
            .map_err(|e| StagingError::transfer("stat", location, e))
    }

    async fn mkdir(&self, dir: &Locator) -> Result<(), StagingError> {
        tokio::fs::create_dir_all(path_of(dir))
            .await
            .map_err(|e| StagingError::transfer("mkdir", dir, e))
    }

    async fn copy(&self, src: &Locator, dst: &Locator) -> Result<(), StagingError> {
        let from = path_of(src);
        let to = path_of(dst);
        let meta = match tokio::fs::metadata(&from).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StagingError::NotFound(src.serialize()));
            }
            Err(e) => return Err(StagingError::transfer("copy", src, e)),
        };

        let result = if meta.is_dir() {
            copy_tree(&from, &to).await
        } else {
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StagingError::transfer("copy", dst, e))?;
            }
            tokio::fs::copy(&from, &to).await.map(|_| ())
        };
        result.map_err(|e| StagingError::transfer("copy", dst, e))?;

        tracing::debug!(src = %from.display(), dst = %to.display(), "copied local data");
        Ok(())
    }

    async fn delete(&self, location: &Locator) -> Result<(), StagingError> {
        let path = path_of(location);
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StagingError::transfer("delete", location, e)),
        };
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|e| StagingError::transfer("delete", location, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(path: &Path) -> Locator {
        Locator::parse(&path.display().to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_list_sorted_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b_R1.fastq", "a_R1.fastq", "a_R2.fastq"] {
            std::fs::write(dir.path().join(name), "ACGT").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let names = LocalBackend.list(&loc(dir.path())).await.unwrap();
        assert_eq!(names, vec!["a_R1.fastq", "a_R2.fastq", "b_R1.fastq", "nested"]);
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = loc(&dir.path().join("nope"));
        let err = LocalBackend.list(&missing).await.unwrap_err();
        assert!(matches!(err, StagingError::NotFound(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn test_mkdir_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let target = loc(&dir.path().join("a/b/c"));
        assert!(!LocalBackend.exists(&target).await.unwrap());
        LocalBackend.mkdir(&target).await.unwrap();
        LocalBackend.mkdir(&target).await.unwrap();
        assert!(LocalBackend.exists(&target).await.unwrap());
        assert!(dir.path().join("a/b/c").is_dir());
    }

    #[tokio::test]
    async fn test_copy_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("ref.fa");
        std::fs::write(&src, ">chr1\nACGT\n").unwrap();
        let dst = dir.path().join("out/deep/ref.fa");

        LocalBackend.copy(&loc(&src), &loc(&dst)).await.unwrap();
        assert_eq!(std::fs::read_to_string(dst).unwrap(), ">chr1\nACGT\n");
    }

    #[tokio::test]
    async fn test_copy_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("index");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("ref.bwt"), "x").unwrap();
        std::fs::write(src.join("sub/ref.sa"), "y").unwrap();
        let dst = dir.path().join("published/index");

        LocalBackend.copy(&loc(&src), &loc(&dst)).await.unwrap();
        assert_eq!(std::fs::read_to_string(dst.join("ref.bwt")).unwrap(), "x");
        assert_eq!(std::fs::read_to_string(dst.join("sub/ref.sa")).unwrap(), "y");
    }

    #[tokio::test]
    async fn test_copy_missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalBackend
            .copy(&loc(&dir.path().join("missing")), &loc(&dir.path().join("dst")))
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::NotFound(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn test_delete_tree_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("work");
        std::fs::create_dir_all(tree.join("step")).unwrap();
        std::fs::write(tree.join("step/out.sam"), "@HD").unwrap();

        LocalBackend.delete(&loc(&tree)).await.unwrap();
        assert!(!tree.exists());
        LocalBackend.delete(&loc(&tree)).await.unwrap();
    }
}
