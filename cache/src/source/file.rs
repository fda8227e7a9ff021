use crate::{Error, Priority, Source};
use std::{io::SeekFrom, path::Path, sync::Arc};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::Mutex as AsyncMutex,
};

/// A [Source] backed by a file on disk.
#[derive(Clone)]
pub struct File {
    // Files must be seeked prior to any read and are thus not safe to read concurrently.
    file: Arc<AsyncMutex<fs::File>>,
}

impl File {
    /// Open the file at `path` for reading.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = fs::File::open(path).await?;
        Ok(Self {
            file: Arc::new(AsyncMutex::new(file)),
        })
    }
}

impl Source for File {
    async fn size(&self) -> Result<u64, Error> {
        let file = self.file.lock().await;
        Ok(file.metadata().await?.len())
    }

    async fn read_at(
        &self,
        mut buf: Vec<u8>,
        offset: u64,
        _priority: Priority,
    ) -> Result<Vec<u8>, Error> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[tokio::test]
    async fn test_file_read() {
        let path = std::env::temp_dir().join(format!("streamcache-file-{}", std::process::id()));
        fs::write(&path, b"hello, world").await.unwrap();

        let source = File::open(&path).await.unwrap();
        assert_eq!(source.size().await.unwrap(), 12);
        let buf = source
            .read_at(vec![0; 5], 7, Priority::Normal)
            .await
            .unwrap();
        assert_eq!(buf, b"world");

        // Reading past the end fails instead of returning a short buffer.
        let result = source.read_at(vec![0; 4], 10, Priority::Normal).await;
        assert!(matches!(result, Err(Error::Io(err)) if err.kind() == ErrorKind::UnexpectedEof));

        fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_missing() {
        let path = std::env::temp_dir().join("streamcache-file-missing");
        assert!(matches!(File::open(&path).await, Err(Error::Io(_))));
    }
}
