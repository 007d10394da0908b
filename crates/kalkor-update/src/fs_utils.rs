use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

pub(crate) fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

/// Write `content` to a sibling temp file, sync it, then rename it over
/// `path`. Readers see either the old or the new file, never a torn one.
pub(crate) fn write_atomically(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = parent_dir(path)?;
    std::fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|error| error.error)?;
    Ok(())
}

/// Copy `src` next to `dest` and rename it into place.
pub(crate) fn copy_atomically(src: &Path, dest: &Path) -> io::Result<()> {
    let parent = parent_dir(dest)?;
    std::fs::create_dir_all(parent)?;
    let temp = tempfile::Builder::new()
        .prefix(".kalkor-swap-")
        .tempfile_in(parent)?;
    std::fs::copy(src, temp.path())?;
    temp.as_file().sync_all()?;
    temp.persist(dest).map_err(|error| error.error)?;
    Ok(())
}

/// Move `src` over `dest`, replacing it.
///
/// A same-filesystem rename is atomic. When rename is impossible (for
/// example across filesystems) the file is copied beside `dest` first, so
/// the final step is still a rename.
pub(crate) fn replace_file(src: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if std::fs::rename(src, dest).is_ok() {
        return Ok(());
    }

    copy_atomically(src, dest)?;
    remove_file_if_exists(src)
}

/// Relative paths of every regular file below `root`, sorted.
pub(crate) fn list_files_recursive(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_files(root, Path::new(""), &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_files(dir: &Path, relative: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let relative_path = relative.join(entry.file_name());
        if file_type.is_dir() {
            collect_files(&entry.path(), &relative_path, files)?;
        } else if file_type.is_file() {
            files.push(relative_path);
        }
    }
    Ok(())
}

/// Whether `path` names the executable of the running process.
pub(crate) fn is_current_exe(path: &Path) -> bool {
    let Ok(current) = std::env::current_exe() else {
        return false;
    };
    match (current.canonicalize(), path.canonicalize()) {
        (Ok(current), Ok(path)) => current == path,
        _ => false,
    }
}

fn parent_dir(path: &Path) -> io::Result<&Path> {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .ok_or_else(|| io::Error::other(format!("{} has no parent directory", path.display())))
}
