use crate::utils::parent_dir;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use tempfile::{Builder, NamedTempFile};

/// Create a temp file next to `destination` so a later rename stays on one filesystem.
pub fn staging_file(destination: &Path) -> io::Result<NamedTempFile> {
    let dir = parent_dir(destination);
    fs::create_dir_all(&dir)?;
    Builder::new()
        .prefix(".pdfsq-")
        .suffix(".part")
        .tempfile_in(&dir)
}

/// Copy `source` byte-for-byte to `destination`, keeping permissions and mtime.
///
/// The data is staged in a temp file and renamed into place, so an
/// interrupted copy never leaves a truncated destination behind.
pub fn copy_verbatim(source: &Path, destination: &Path) -> io::Result<u64> {
    let metadata = fs::metadata(source)?;
    let mut staged = staging_file(destination)?;

    let mut reader = File::open(source)?;
    let bytes = io::copy(&mut reader, staged.as_file_mut())?;
    staged.as_file_mut().flush()?;
    staged.as_file().sync_all()?;

    if let Ok(modified) = metadata.modified() {
        staged.as_file().set_modified(modified)?;
    }
    fs::set_permissions(staged.path(), metadata.permissions())?;

    staged.persist(destination).map_err(|e| e.error)?;
    Ok(bytes)
}

/// True when `destination` already holds a copy with the same size and mtime.
pub fn is_up_to_date(source: &Path, destination: &Path) -> bool {
    let (Ok(src), Ok(dst)) = (fs::metadata(source), fs::metadata(destination)) else {
        return false;
    };
    if src.len() != dst.len() {
        return false;
    }
    matches!((src.modified(), dst.modified()), (Ok(a), Ok(b)) if a == b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    #[test]
    fn test_copy_verbatim_bytes_and_mtime() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("src.bin");
        fs::write(&source, b"hello world").unwrap();
        let past = SystemTime::now() - Duration::from_secs(3600);
        File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let destination = temp_dir.path().join("out/nested/dst.bin");
        let copied = copy_verbatim(&source, &destination).unwrap();

        assert_eq!(copied, 11);
        assert_eq!(fs::read(&destination).unwrap(), b"hello world");
        assert_eq!(
            fs::metadata(&destination).unwrap().modified().unwrap(),
            fs::metadata(&source).unwrap().modified().unwrap()
        );
        assert!(is_up_to_date(&source, &destination));
    }

    #[test]
    fn test_copy_leaves_no_staging_files() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, b"abc").unwrap();
        let out = temp_dir.path().join("out");
        copy_verbatim(&source, &out.join("a.txt")).unwrap();

        let names: Vec<_> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("a.txt")]);
    }

    #[test]
    fn test_copy_missing_source_fails_without_output() {
        let temp_dir = TempDir::new().unwrap();
        let destination = temp_dir.path().join("out.txt");
        assert!(copy_verbatim(&temp_dir.path().join("missing"), &destination).is_err());
        assert!(!destination.exists());
    }

    #[test]
    fn test_is_up_to_date_detects_changes() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("s.txt");
        let destination = temp_dir.path().join("d.txt");
        fs::write(&source, b"one").unwrap();
        assert!(!is_up_to_date(&source, &destination));

        copy_verbatim(&source, &destination).unwrap();
        fs::write(&source, b"three").unwrap();
        assert!(!is_up_to_date(&source, &destination));
    }
}
