//! Per-connection persistence sink.
//!
//! Every payload byte a peer sends inside a frame is appended, unmodified
//! and in arrival order, to a file named after the connection's descriptor
//! (`client<fd>`). Files are opened lazily so connections that never send a
//! payload leave nothing behind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Directory that holds the sink files.
#[derive(Debug, Clone)]
pub struct SinkDir {
    dir: PathBuf,
}

impl SinkDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the sink file for connection `id`.
    pub fn path_for(&self, id: i32) -> PathBuf {
        self.dir.join(format!("client{id}"))
    }

    /// Sink for connection `id`. Nothing touches the filesystem until the
    /// first write.
    pub fn open(&self, id: i32) -> FileSink {
        FileSink::new(self.path_for(id))
    }

    /// Create the directory (and parents) if it does not exist yet.
    pub fn create(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Append-only file sink, opened on first write.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> io::Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?,
        };
        Ok(self.file.insert(file))
    }
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file {
            Some(ref mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Scratch directory helper shared by tests across modules.
#[cfg(test)]
pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "caret-echo-{tag}-{}-{n}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
