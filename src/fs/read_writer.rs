use crate::fs::errors::Result;
use crate::fs::reader::Reader;
use crate::fs::writer::Writer;

/// Coupled read/write handle over a single duplicated working copy.
/// Closing it closes both sides; the writer's outcome decides the result.
pub struct ReadWriter {
    reader: Reader,
    writer: Writer,
}

impl ReadWriter {
    pub(crate) fn new(reader: Reader, writer: Writer) -> Self {
        ReadWriter { reader, writer }
    }

    pub async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.reader.read_at(offset, len).await
    }

    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        self.writer.write_at(offset, data).await
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.writer.write(data).await
    }

    pub async fn sync(&mut self) -> Result<()> {
        self.writer.sync().await
    }

    pub async fn close(self) -> Result<()> {
        let result = self.writer.close().await;
        self.reader.close();
        result
    }
}
