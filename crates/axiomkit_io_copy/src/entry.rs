//! Entry metadata snapshot and type classification.

use std::ffi::OsString;
use std::fs;
use std::time::SystemTime;

/// Entry type, in dispatch precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumEntryKind {
    /// Symbolic link (never followed by classification).
    Symlink,
    /// Directory.
    Dir,
    /// Named pipe (FIFO).
    NamedPipe,
    /// Character or block device.
    Device {
        /// `true` for block devices.
        if_block: bool,
    },
    /// Unix domain socket.
    Socket,
    /// Regular file.
    File,
}

impl EnumEntryKind {
    /// Classify a file type: symlink > dir > pipe > device > socket > file.
    pub fn classify(file_type: &fs::FileType) -> Self {
        if file_type.is_symlink() {
            return Self::Symlink;
        }
        if file_type.is_dir() {
            return Self::Dir;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if file_type.is_fifo() {
                return Self::NamedPipe;
            }
            if file_type.is_char_device() || file_type.is_block_device() {
                return Self::Device {
                    if_block: file_type.is_block_device(),
                };
            }
            if file_type.is_socket() {
                return Self::Socket;
            }
        }
        Self::File
    }
}

/// Metadata snapshot that travels with every entry through the dispatcher.
///
/// Built from [`fs::Metadata`] for the OS filesystem, or filled in directly by
/// a custom [`crate::SourceFs`]. Fields a source cannot provide stay `None`,
/// and the matching preservation step is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecEntryMeta {
    /// Basename of the entry.
    pub name: OsString,
    /// Entry type.
    pub kind: EnumEntryKind,
    /// Permission bits (`0o7777` mask).
    pub mode: u32,
    /// Size in bytes.
    pub len: u64,
    /// Owner user id.
    pub uid: Option<u32>,
    /// Owner group id.
    pub gid: Option<u32>,
    /// Last access time.
    pub atime: Option<SystemTime>,
    /// Last modification time.
    pub mtime: Option<SystemTime>,
    /// Device number for device special files.
    pub rdev: Option<u64>,
    /// `(st_dev, st_ino)` identity, used to spot directory cycles.
    pub dev_ino: Option<(u64, u64)>,
}

impl SpecEntryMeta {
    /// Snapshot of OS metadata (obtained without following links).
    pub fn from_metadata(name: OsString, meta: &fs::Metadata) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Self {
                name,
                kind: EnumEntryKind::classify(&meta.file_type()),
                mode: meta.mode() & 0o7777,
                len: meta.len(),
                uid: Some(meta.uid()),
                gid: Some(meta.gid()),
                atime: meta.accessed().ok(),
                mtime: meta.modified().ok(),
                rdev: Some(meta.rdev()),
                dev_ino: Some((meta.dev(), meta.ino())),
            }
        }
        #[cfg(not(unix))]
        {
            let mode = if meta.permissions().readonly() {
                0o444
            } else {
                0o666
            };
            Self {
                name,
                kind: EnumEntryKind::classify(&meta.file_type()),
                mode,
                len: meta.len(),
                uid: None,
                gid: None,
                atime: meta.accessed().ok(),
                mtime: meta.modified().ok(),
                rdev: None,
                dev_ino: None,
            }
        }
    }

    /// Convenience constructor for sources that only know type and mode.
    pub fn new<N: Into<OsString>>(name: N, kind: EnumEntryKind, mode: u32, len: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            mode: mode & 0o7777,
            len,
            uid: None,
            gid: None,
            atime: None,
            mtime: None,
            rdev: None,
            dev_ino: None,
        }
    }

    /// `true` for directories (links to directories are not directories).
    pub fn is_dir(&self) -> bool {
        self.kind == EnumEntryKind::Dir
    }
}
