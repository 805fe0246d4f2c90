//! Generic byte streams over plain or gzip-compressed files.
//!
//! The codec is selected by file suffix: a path containing `.gz` opens
//! through the gzip codec, anything else as a plain file. Readers and
//! writers see the same byte stream either way.

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

fn is_gz(path: &Path) -> bool {
    path.to_string_lossy().contains(".gz")
}

pub enum ByteSource {
    Plain(BufReader<File>),
    Gzip(GzDecoder<BufReader<File>>),
}

impl ByteSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let file = File::open(p)
            .with_context(|| format!("failed to open \"{}\" for reading", p.display()))?;
        let reader = BufReader::new(file);
        if is_gz(p) {
            Ok(Self::Gzip(GzDecoder::new(reader)))
        } else {
            Ok(Self::Plain(reader))
        }
    }
}

impl Read for ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Gzip(r) => r.read(buf),
        }
    }
}

pub enum ByteSink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl ByteSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let file = File::create(p)
            .with_context(|| format!("failed to open \"{}\" for writing", p.display()))?;
        let writer = BufWriter::new(file);
        if is_gz(p) {
            Ok(Self::Gzip(GzEncoder::new(writer, Compression::default())))
        } else {
            Ok(Self::Plain(writer))
        }
    }

    /// Finishes the compressed stream (if any) and flushes.
    pub fn finish(self) -> Result<()> {
        match self {
            Self::Plain(mut w) => w.flush().context("flush plain stream")?,
            Self::Gzip(w) => {
                w.finish().context("finish gzip stream")?.flush().context("flush gzip stream")?
            }
        }
        Ok(())
    }
}

impl Write for ByteSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
        }
    }
}
