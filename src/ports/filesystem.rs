use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;

    async fn size(&self, path: &Path) -> io::Result<u64>;

    async fn delete(&self, path: &Path) -> io::Result<()>;

    /// Reads a text file another process may still be appending to.
    async fn read_shared(&self, path: &Path) -> io::Result<String>;

    async fn last_write_time(&self, path: &Path) -> io::Result<SystemTime>;

    /// Entries of `dir`, files only.
    async fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    async fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
}
