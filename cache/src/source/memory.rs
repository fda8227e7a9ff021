use crate::{Error, Priority, Source};
use bytes::Bytes;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// An in-memory [Source].
///
/// Counts the reads served across all clones, which makes it useful for observing how many
/// requests the cache actually issues.
#[derive(Clone)]
pub struct Memory {
    content: Bytes,
    reads: Arc<AtomicUsize>,
}

impl Memory {
    /// Create a new [Memory] source serving `content`.
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The number of reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl Source for Memory {
    async fn size(&self) -> Result<u64, Error> {
        Ok(self.content.len() as u64)
    }

    async fn read_at(
        &self,
        mut buf: Vec<u8>,
        offset: u64,
        _priority: Priority,
    ) -> Result<Vec<u8>, Error> {
        let (size, len) = (buf.len(), self.content.len() as u64);
        let out_of_bounds = || Error::OutOfBounds { offset, size, len };
        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let end = start.checked_add(size).ok_or_else(out_of_bounds)?;
        let Some(content) = self.content.get(start..end) else {
            return Err(out_of_bounds());
        };
        buf.copy_from_slice(content);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_memory_read() {
        let source = Memory::new(b"abcdef".to_vec());
        block_on(async {
            assert_eq!(source.size().await.unwrap(), 6);
            let buf = source
                .read_at(vec![0; 3], 2, Priority::Normal)
                .await
                .unwrap();
            assert_eq!(buf, b"cde");
            assert_eq!(source.clone().reads(), 1);
        });
    }

    #[test]
    fn test_memory_read_out_of_bounds() {
        let source = Memory::new(b"abcdef".to_vec());
        let result = block_on(source.read_at(vec![0; 3], 4, Priority::Normal));
        assert!(matches!(
            result,
            Err(Error::OutOfBounds {
                offset: 4,
                size: 3,
                len: 6
            })
        ));
        assert_eq!(source.reads(), 0);
    }
}
