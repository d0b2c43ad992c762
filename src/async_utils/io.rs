//! I/O utilities.

use tokio::{
    fs::{self, File},
    io::{AsyncWrite, AsyncWriteExt as _},
};

use crate::prelude::*;

/// Create a writer for either a file or standard output.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Path of the scratch file used while writing `path`.
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Replace `path` with `contents`, so readers see either the old file or the
/// new one, never a partial write.
pub async fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = sibling_with_suffix(path, ".tmp");
    let mut file = File::create(&tmp_path)
        .await
        .with_context(|| format!("Failed to create file at path: {:?}", tmp_path))?;
    file.write_all(contents)
        .await
        .with_context(|| format!("Failed to write {:?}", tmp_path))?;
    file.sync_all()
        .await
        .with_context(|| format!("Failed to sync {:?}", tmp_path))?;
    drop(file);
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to rename {:?} to {:?}", tmp_path, path))
}

/// Create `dir` and its parents if needed.
pub async fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create directory {:?}", dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn atomic_write_replaces_file() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("io")?;
        let path = dir.path().join("progress.json");
        write_atomically(&path, b"old").await?;
        write_atomically(&path, b"new").await?;
        assert_eq!(fs::read_to_string(&path).await?, "new");
        assert!(!sibling_with_suffix(&path, ".tmp").exists());
        Ok(())
    }

    #[test]
    fn sibling_keeps_directory() {
        let path = sibling_with_suffix(Path::new("/out/texts/a.txt"), ".partial");
        assert_eq!(path, Path::new("/out/texts/a.txt.partial"));
    }
}
