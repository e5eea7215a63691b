use camino::{Utf8Path, Utf8PathBuf};
use flate2::{Compression, write::GzEncoder};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Suffix appended to the relative path of a retired file.
pub const ARCHIVE_SUFFIX: &str = ".gz";

/// Maximum number of archive generations kept per logical file.
pub const MAX_GENERATIONS: usize = 5;

/// Errors that can occur while retiring a file
///
/// All of these are recoverable: the live file is left as it was (or, for
/// [`RetireError::Truncate`], archived but not yet emptied) and is evaluated
/// again on the next cycle.
#[derive(Error, Debug)]
pub enum RetireError {
    #[error("Failed to open {path}: {source}")]
    Open { path: Utf8PathBuf, source: io::Error },

    #[error("Failed to write archive {path}: {source}")]
    Archive { path: Utf8PathBuf, source: io::Error },

    #[error("Failed to rotate archives for {path}: {source}")]
    Rotate { path: Utf8PathBuf, source: io::Error },

    #[error("Archived {path} but failed to truncate it: {source}")]
    Truncate { path: Utf8PathBuf, source: io::Error },
}

/// Result of retiring one file
#[derive(Debug, Clone)]
pub struct RetireOutcome {
    pub relative: Utf8PathBuf,
    /// Generation 0 archive that now holds the content
    pub archive: Utf8PathBuf,
    /// Uncompressed bytes written to the archive
    pub bytes_archived: u64,
    /// Size of the archive on disk
    pub compressed_bytes: u64,
    /// Bytes appended by writers during eviction and kept in the live file
    pub carried_over: u64,
    pub duration: Duration,
}

/// The bounded set of archive generations for one logical file.
///
/// Generation 0 lives at `<archive root>/<relative path>.gz`, older
/// generations append `.1` through `.4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationChain {
    base: Utf8PathBuf,
}

impl RotationChain {
    pub fn new(archive_root: &Utf8Path, relative: &Utf8Path) -> Self {
        Self {
            base: archive_root.join(format!("{}{}", relative, ARCHIVE_SUFFIX)),
        }
    }

    pub fn generation_path(&self, generation: usize) -> Utf8PathBuf {
        if generation == 0 {
            self.base.clone()
        } else {
            Utf8PathBuf::from(format!("{}.{}", self.base, generation))
        }
    }

    /// Generations currently present on disk, newest first.
    pub fn existing(&self) -> Vec<usize> {
        (0..MAX_GENERATIONS)
            .filter(|&generation| self.generation_path(generation).is_file())
            .collect()
    }

    /// Make room for a new generation 0: drop the oldest generation, then
    /// shift every remaining generation up by one.
    pub fn rotate(&self) -> io::Result<()> {
        let oldest = self.generation_path(MAX_GENERATIONS - 1);
        match fs::remove_file(&oldest) {
            Ok(()) => tracing::debug!("Dropped oldest archive {}", oldest),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        for generation in (0..MAX_GENERATIONS - 1).rev() {
            let from = self.generation_path(generation);
            if from.is_file() {
                fs::rename(&from, self.generation_path(generation + 1))?;
            }
        }

        Ok(())
    }

    fn directory(&self) -> Option<&Utf8Path> {
        self.base.parent()
    }
}

/// Compresses oversized live files into their rotation chain and truncates
/// them in place.
///
/// The live file keeps its inode, so writers holding it open keep appending
/// without reopening. A new generation 0 only appears once the compressed
/// data has been fully written and synced to a temporary file in the archive
/// directory, which is then renamed into place.
#[derive(Debug, Clone)]
pub struct Evictor {
    active_path: Utf8PathBuf,
    archive_path: Utf8PathBuf,
}

impl Evictor {
    pub fn new<P, Q>(active_path: P, archive_path: Q) -> Self
    where
        P: Into<Utf8PathBuf>,
        Q: Into<Utf8PathBuf>,
    {
        Self {
            active_path: active_path.into(),
            archive_path: archive_path.into(),
        }
    }

    pub fn chain_for(&self, relative: &Utf8Path) -> RotationChain {
        RotationChain::new(&self.archive_path, relative)
    }

    /// Retire the file at `relative` (relative to the active path).
    ///
    /// The file's size when opened is the snapshot that gets archived. Bytes
    /// appended after that point are moved to the start of the truncated file
    /// instead of being discarded. Two windows remain where concurrent writes
    /// can be lost:
    ///
    /// - bytes appended between reading that tail and the truncate are
    ///   dropped by the truncate
    /// - an `O_APPEND` write landing between the truncate and writing the
    ///   tail back goes to offset 0 and is then overwritten by the tail
    pub fn retire(&self, relative: &Utf8Path) -> Result<RetireOutcome, RetireError> {
        let start = Instant::now();
        let live_path = self.active_path.join(relative);
        let chain = self.chain_for(relative);
        let archive = chain.generation_path(0);

        let mut live = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&live_path)
            .map_err(|source| RetireError::Open {
                path: live_path.clone(),
                source,
            })?;
        let snapshot_len = live
            .metadata()
            .map_err(|source| RetireError::Open {
                path: live_path.clone(),
                source,
            })?
            .len();

        let archive_error = |source| RetireError::Archive {
            path: archive.clone(),
            source,
        };

        let directory = chain
            .directory()
            .ok_or_else(|| archive_error(io::Error::other("archive path has no parent")))?;
        fs::create_dir_all(directory).map_err(archive_error)?;

        let (staged, bytes_archived) =
            compress_snapshot(&live, snapshot_len, directory).map_err(archive_error)?;
        let compressed_bytes = staged
            .as_file()
            .metadata()
            .map_err(archive_error)?
            .len();

        chain.rotate().map_err(|source| RetireError::Rotate {
            path: archive.clone(),
            source,
        })?;
        staged
            .persist(&archive)
            .map_err(|e| archive_error(e.error))?;

        let carried_over = truncate_retired(&mut live, bytes_archived).map_err(|source| {
            RetireError::Truncate {
                path: live_path.clone(),
                source,
            }
        })?;

        if carried_over > 0 {
            tracing::debug!(
                "{} grew by {} bytes during eviction, kept in live file",
                live_path,
                carried_over
            );
        }

        tracing::info!("{} retired to {}", live_path, archive);

        Ok(RetireOutcome {
            relative: relative.to_path_buf(),
            archive,
            bytes_archived,
            compressed_bytes,
            carried_over,
            duration: start.elapsed(),
        })
    }
}

/// Gzip the first `len` bytes of `live` into a synced temporary file inside
/// `directory`.
fn compress_snapshot(
    live: &File,
    len: u64,
    directory: &Utf8Path,
) -> io::Result<(tempfile::NamedTempFile, u64)> {
    let staged = tempfile::Builder::new()
        .prefix(".logrunner-")
        .suffix(".tmp")
        .tempfile_in(directory)?;

    let mut encoder = GzEncoder::new(BufWriter::new(staged), Compression::default());
    let copied = io::copy(&mut live.take(len), &mut encoder)?;
    let staged = encoder
        .finish()?
        .into_inner()
        .map_err(|e| e.into_error())?;
    staged.as_file().sync_all()?;

    Ok((staged, copied))
}

/// Empty the live file after its first `archived` bytes went to the archive.
///
/// Returns how many trailing bytes were appended after the snapshot and
/// written back to the start of the file.
fn truncate_retired(live: &mut File, archived: u64) -> io::Result<u64> {
    let mut tail = Vec::new();
    if live.metadata()?.len() > archived {
        live.seek(SeekFrom::Start(archived))?;
        live.read_to_end(&mut tail)?;
    }

    live.set_len(0)?;

    if !tail.is_empty() {
        live.seek(SeekFrom::Start(0))?;
        live.write_all(&tail)?;
    }

    Ok(tail.len() as u64)
}
