//! File-backed `Source` and `Sink`: the Transfer Engine's only contact
//! with the filesystem.
//!
//! A [`Source`] produces successive fixed-size blocks of a file by index
//! (random access, so a retransmitted block never depends on a stream
//! position). A [`Sink`] accepts blocks strictly in order and only
//! becomes visible at its final path on [`Sink::commit`].

use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::BLOCK_SIZE;

/// Produces block `n` (1-based) of a file, `BLOCK_SIZE` bytes at a time.
/// The final block is shorter than `BLOCK_SIZE`, possibly empty if the
/// file size is an exact multiple of `BLOCK_SIZE`.
pub struct FileSource {
    file: File,
    block_size: usize,
}

impl FileSource {
    /// Opens `path` once; the handle is reused for every `block()` call
    /// so retries never reopen the file.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).await.map_err(Error::LocalIo)?;
        Ok(Self {
            file,
            block_size: BLOCK_SIZE,
        })
    }

    /// Read block `n` (1-based). Returns `Ok(bytes)` with `bytes.len() <
    /// block_size` exactly once, on the final block (possibly empty).
    pub async fn block(&mut self, n: u32) -> Result<Vec<u8>> {
        let offset = (n as u64 - 1) * self.block_size as u64;
        self.file
            .seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(Error::LocalIo)?;
        let mut buf = vec![0u8; self.block_size];
        let mut total = 0;
        while total < buf.len() {
            let n = self
                .file
                .read(&mut buf[total..])
                .await
                .map_err(Error::LocalIo)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        buf.truncate(total);
        Ok(buf)
    }
}

/// Accepts blocks in strictly increasing order and writes them to a
/// temporary file, becoming visible at `final_path` only on `commit()`.
pub struct FileSink {
    file: File,
    temp_path: PathBuf,
    final_path: PathBuf,
    last_accepted: u32,
    committed: bool,
}

impl FileSink {
    pub async fn create(final_path: &Path) -> Result<Self> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await.map_err(Error::LocalIo)?;
        }
        let temp_path = temp_sibling(final_path);
        let file = File::create(&temp_path).await.map_err(Error::LocalIo)?;
        Ok(Self {
            file,
            temp_path,
            final_path: final_path.to_path_buf(),
            last_accepted: 0,
            committed: false,
        })
    }

    /// Append block `n` (1-based). Fails if `n != last_accepted + 1`.
    pub async fn accept(&mut self, n: u32, bytes: &[u8]) -> Result<()> {
        if n != self.last_accepted + 1 {
            return Err(Error::ProtocolViolation(format!(
                "out-of-order block: expected {}, got {n}",
                self.last_accepted + 1
            )));
        }
        self.file.write_all(bytes).await.map_err(Error::LocalIo)?;
        self.last_accepted = n;
        Ok(())
    }

    /// Flush and atomically publish the file at its final path.
    pub async fn commit(mut self) -> Result<()> {
        self.file.flush().await.map_err(Error::LocalIo)?;
        drop(self.file);
        fs::rename(&self.temp_path, &self.final_path)
            .await
            .map_err(Error::LocalIo)?;
        self.committed = true;
        Ok(())
    }

    /// Discard the partial file. Also runs if a `FileSink` is dropped
    /// without being committed.
    pub async fn abort(mut self) {
        self.committed = true; // suppress the Drop-time cleanup attempt below
        let _ = fs::remove_file(&self.temp_path).await;
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

fn temp_sibling(final_path: &Path) -> PathBuf {
    let file_name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let unique: u32 = rand::random();
    let temp_name = format!(".{file_name}.partial-{unique:08x}");
    final_path.with_file_name(temp_name)
}
