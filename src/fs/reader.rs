use crate::fs::errors::Result;
use crate::fs::file::{FileRef, Timestamp};
use crate::store::data::PayloadReader;

/// Streaming read handle. Each read takes the file's shared lock for its
/// duration; close stamps the access time.
pub struct Reader {
    file: FileRef,
    payload: PayloadReader,
}

impl Reader {
    pub(crate) fn new(file: FileRef, payload: PayloadReader) -> Self {
        Reader { file, payload }
    }

    /// Reads up to `len` bytes at `offset`; a short result means end of
    /// payload.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let _guard = self.file.lock.read().await;
        Ok(self.payload.read_at(offset, len).await?)
    }

    /// Reads the whole payload.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let _guard = self.file.lock.read().await;
        let len = self.payload.len().await?;
        Ok(self.payload.read_at(0, len as usize).await?)
    }

    pub fn close(self) {
        self.file.set_atime(Timestamp::now());
    }
}
