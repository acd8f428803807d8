//! Source-side filesystem abstraction.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::entry::SpecEntryMeta;

/// Read-only view of the source tree.
///
/// When injected through [`crate::SpecCopyOptions::fs_source`], every source
/// metadata lookup, listing, read and link resolution goes through it.
/// Destination writes always use the OS filesystem.
pub trait SourceFs: Send + Sync {
    /// Metadata of `path` without following a final symlink.
    fn symlink_metadata(&self, path: &Path) -> io::Result<SpecEntryMeta>;

    /// Immediate children of `path`, sorted by name.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<SpecEntryMeta>>;

    /// Open `path` for reading.
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Target of the symlink at `path`.
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;
}

/// The real OS filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSourceFs;

fn entry_name(path: &Path) -> OsString {
    path.file_name()
        .map(|v| v.to_os_string())
        .unwrap_or_else(|| path.as_os_str().to_os_string())
}

impl SourceFs for OsSourceFs {
    fn symlink_metadata(&self, path: &Path) -> io::Result<SpecEntryMeta> {
        let meta = fs::symlink_metadata(path)?;
        Ok(SpecEntryMeta::from_metadata(entry_name(path), &meta))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<SpecEntryMeta>> {
        let mut l_entries = Vec::new();
        for entry_res in fs::read_dir(path)? {
            let entry = entry_res?;
            // Children removed between listing and stat are dropped here.
            let meta = match entry.metadata() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            l_entries.push(SpecEntryMeta::from_metadata(entry.file_name(), &meta));
        }
        l_entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(l_entries)
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::{OsSourceFs, SourceFs};
    use crate::entry::EnumEntryKind;

    #[test]
    fn os_source_lists_sorted_and_reads() {
        let path_root = std::env::temp_dir().join(format!(
            "axiomkit_copy_source_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&path_root);
        std::fs::create_dir_all(path_root.join("b_dir")).expect("mkdir");
        std::fs::write(path_root.join("c.txt"), "cc").expect("write c");
        std::fs::write(path_root.join("a.txt"), "a").expect("write a");

        let l_entries = OsSourceFs.read_dir(&path_root).expect("read dir");
        let l_names: Vec<_> = l_entries
            .iter()
            .map(|v| v.name.to_string_lossy().to_string())
            .collect();
        assert_eq!(l_names, vec!["a.txt", "b_dir", "c.txt"]);
        assert_eq!(l_entries[1].kind, EnumEntryKind::Dir);

        let mut txt = String::new();
        OsSourceFs
            .open(&path_root.join("c.txt"))
            .expect("open")
            .read_to_string(&mut txt)
            .expect("read");
        assert_eq!(txt, "cc");

        let meta = OsSourceFs
            .symlink_metadata(&path_root.join("a.txt"))
            .expect("stat");
        assert_eq!(meta.name.to_string_lossy(), "a.txt");
        assert_eq!(meta.len, 1);

        let _ = std::fs::remove_dir_all(&path_root);
    }
}
