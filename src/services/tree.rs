//! Metadata-preserving copy helpers shared by seeding and shutdown sync.
//!
//! Copies keep mode bits, access/modification times and, when the process has
//! the privilege, ownership. Symlinks are recreated rather than followed.
//! FIFOs, sockets and device nodes are skipped.

use nix::errno::Errno;
use std::fs::{self, File, FileTimes, Metadata, Permissions};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt, lchown, symlink};
use std::path::Path;
use walkdir::WalkDir;

/// Copy a file, directory tree or symlink from `src` to `dst`.
///
/// Returns the number of regular files copied.
pub fn copy_entry(src: &Path, dst: &Path) -> io::Result<u64> {
    let metadata = fs::symlink_metadata(src)?;
    let file_type = metadata.file_type();

    if file_type.is_dir() {
        copy_tree(src, dst)
    } else if file_type.is_symlink() {
        copy_symlink(src, dst)?;
        Ok(0)
    } else if file_type.is_file() {
        copy_file(src, dst, &metadata)?;
        Ok(1)
    } else {
        tracing::debug!("Skipping special file {}", src.display());
        Ok(0)
    }
}

/// Recursively copy the directory `src` into `dst`, merging with anything
/// already present at `dst`.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut files = 0;

    // contents_first yields each directory after its children, so directory
    // times are stamped after nothing else will touch them
    for entry in WalkDir::new(src).follow_links(false).contents_first(true) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            preserve_metadata(&entry.metadata().map_err(io::Error::from)?, &target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else if file_type.is_file() {
            copy_file(entry.path(), &target, &entry.metadata().map_err(io::Error::from)?)?;
            files += 1;
        } else {
            tracing::debug!("Skipping special file {}", entry.path().display());
        }
    }

    Ok(files)
}

/// Replace whatever exists at `dst` with a copy of the directory `src`.
pub fn replace_dir(src: &Path, dst: &Path) -> io::Result<u64> {
    remove_existing(dst)?;
    copy_tree(src, dst)
}

/// Move a file, falling back to copy and delete across filesystems.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(Errno::EXDEV as i32) => {
            let metadata = fs::symlink_metadata(src)?;
            copy_file(src, dst, &metadata)?;
            fs::remove_file(src)
        }
        Err(e) => Err(e),
    }
}

fn copy_file(src: &Path, dst: &Path, metadata: &Metadata) -> io::Result<()> {
    // fs::copy follows a symlink at the destination, so clear it first
    if fs::symlink_metadata(dst).is_ok_and(|m| m.file_type().is_symlink()) {
        fs::remove_file(dst)?;
    }
    fs::copy(src, dst)?;
    preserve_metadata(metadata, dst)
}

fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    remove_existing(dst)?;
    symlink(&link, dst)?;
    chown_best_effort(&fs::symlink_metadata(src)?, dst);
    Ok(())
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn preserve_metadata(metadata: &Metadata, target: &Path) -> io::Result<()> {
    chown_best_effort(metadata, target);

    let times = FileTimes::new()
        .set_accessed(metadata.accessed()?)
        .set_modified(metadata.modified()?);
    File::open(target)?.set_times(times)?;

    fs::set_permissions(target, Permissions::from_mode(metadata.mode()))
}

// Ownership needs CAP_CHOWN; unprivileged copies keep the caller as owner.
fn chown_best_effort(metadata: &Metadata, target: &Path) {
    if let Err(e) = lchown(target, Some(metadata.uid()), Some(metadata.gid())) {
        tracing::trace!("Could not preserve ownership of {}: {}", target.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_tree_preserves_content_and_mode() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.log"), b"alpha").unwrap();
        fs::write(src.join("nested/b.log"), b"beta").unwrap();
        fs::set_permissions(src.join("a.log"), Permissions::from_mode(0o640)).unwrap();

        let copied = copy_tree(&src, &dst).unwrap();

        assert_eq!(copied, 2);
        assert_eq!(fs::read(dst.join("a.log")).unwrap(), b"alpha");
        assert_eq!(fs::read(dst.join("nested/b.log")).unwrap(), b"beta");
        let mode = fs::metadata(dst.join("a.log")).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn test_copy_tree_preserves_mtime() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("old.log"), b"x").unwrap();

        let past = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        File::options()
            .write(true)
            .open(src.join("old.log"))
            .unwrap()
            .set_modified(past)
            .unwrap();

        copy_tree(&src, &dst).unwrap();

        let copied = fs::metadata(dst.join("old.log")).unwrap().modified().unwrap();
        assert_eq!(copied, past);
    }

    #[test]
    fn test_copy_entry_recreates_symlink() {
        let temp_dir = TempDir::new().unwrap();
        let link = temp_dir.path().join("current.log");
        symlink("app.log", &link).unwrap();

        let dst = temp_dir.path().join("copy.log");
        assert_eq!(copy_entry(&link, &dst).unwrap(), 0);
        assert_eq!(fs::read_link(&dst).unwrap(), Path::new("app.log"));
    }

    #[test]
    fn test_replace_dir_drops_stale_entries() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("fresh.log"), b"new").unwrap();
        fs::write(dst.join("stale.log"), b"old").unwrap();

        replace_dir(&src, &dst).unwrap();

        assert!(dst.join("fresh.log").exists());
        assert!(!dst.join("stale.log").exists());
    }

    #[test]
    fn test_move_file_creates_parent() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("a.log.gz");
        let dst = temp_dir.path().join("archive/deep/a.log.gz");
        fs::write(&src, b"gz").unwrap();

        move_file(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"gz");
    }
}
