use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use filetime::FileTime;

use crate::entry::SpecEntryMeta;
use crate::spec::CopyTreeError;

/// Mode used for directories while they are being populated.
pub(crate) const N_MODE_DIR_PERMISSIVE: u32 = 0o777;

////////////////////////////////////////////////////////////////////////////////
// #region DestinationNodes

pub(crate) fn create_dir_permissive(path_dir: &Path) -> Result<(), CopyTreeError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(N_MODE_DIR_PERMISSIVE);
    }
    builder
        .create(path_dir)
        .map_err(|e| CopyTreeError::io(path_dir, e))
}

pub(crate) fn ensure_parent_dir(path_dst: &Path) -> Result<(), CopyTreeError> {
    match path_dst.parent() {
        Some(path_parent) if !path_parent.as_os_str().is_empty() => {
            create_dir_permissive(path_parent)
        }
        _ => Ok(()),
    }
}

pub(crate) fn set_permission_mode(path_dst: &Path, mode: u32) -> Result<(), CopyTreeError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path_dst, fs::Permissions::from_mode(mode))
            .map_err(|e| CopyTreeError::io(path_dst, e))
    }
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(path_dst)
            .map_err(|e| CopyTreeError::io(path_dst, e))?
            .permissions();
        perms.set_readonly(mode & 0o222 == 0);
        fs::set_permissions(path_dst, perms).map_err(|e| CopyTreeError::io(path_dst, e))
    }
}

/// Remove whatever sits at `path_dst` (directory tree or single node).
pub(crate) fn remove_existing(path_dst: &Path) -> Result<(), CopyTreeError> {
    let meta_dst = fs::symlink_metadata(path_dst).map_err(|e| CopyTreeError::io(path_dst, e))?;
    let res = if meta_dst.is_dir() {
        fs::remove_dir_all(path_dst)
    } else {
        fs::remove_file(path_dst)
    };
    res.map_err(|e| CopyTreeError::io(path_dst, e))
}

pub(crate) fn create_symbolic_link(
    path_target: &Path,
    path_dst: &Path,
    b_target_is_dir: bool,
) -> Result<(), CopyTreeError> {
    // Re-running a copy replaces links it created earlier.
    if let Ok(meta_dst) = fs::symlink_metadata(path_dst)
        && meta_dst.file_type().is_symlink()
    {
        fs::remove_file(path_dst).map_err(|e| CopyTreeError::io(path_dst, e))?;
    }

    #[cfg(unix)]
    {
        let _ = b_target_is_dir;
        std::os::unix::fs::symlink(path_target, path_dst)
            .map_err(|e| CopyTreeError::io(path_dst, e))
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::{symlink_dir, symlink_file};
        let res = if b_target_is_dir {
            symlink_dir(path_target, path_dst)
        } else {
            symlink_file(path_target, path_dst)
        };
        res.map_err(|e| CopyTreeError::io(path_dst, e))
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (path_target, b_target_is_dir);
        Err(CopyTreeError::UnsupportedType(path_dst.to_path_buf()))
    }
}

pub(crate) fn create_named_pipe(path_dst: &Path, mode: u32) -> Result<(), CopyTreeError> {
    #[cfg(unix)]
    {
        use nix::sys::stat::Mode;
        use std::os::unix::fs::FileTypeExt;

        if let Ok(meta_dst) = fs::symlink_metadata(path_dst)
            && meta_dst.file_type().is_fifo()
        {
            return Ok(());
        }
        nix::unistd::mkfifo(path_dst, Mode::from_bits_truncate(mode as _))
            .map_err(|e| CopyTreeError::io(path_dst, io::Error::from(e)))
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        Err(CopyTreeError::UnsupportedType(path_dst.to_path_buf()))
    }
}

pub(crate) fn create_device_node(
    path_dst: &Path,
    meta: &SpecEntryMeta,
    b_is_block: bool,
) -> Result<(), CopyTreeError> {
    #[cfg(unix)]
    {
        use nix::sys::stat::{Mode, SFlag, mknod};

        let Some(rdev) = meta.rdev else {
            return Err(CopyTreeError::UnsupportedType(path_dst.to_path_buf()));
        };
        let kind = if b_is_block {
            SFlag::S_IFBLK
        } else {
            SFlag::S_IFCHR
        };
        mknod(
            path_dst,
            kind,
            Mode::from_bits_truncate(meta.mode as _),
            rdev as nix::libc::dev_t,
        )
        .map_err(|e| CopyTreeError::io(path_dst, io::Error::from(e)))
    }
    #[cfg(not(unix))]
    {
        let _ = (meta, b_is_block);
        Err(CopyTreeError::UnsupportedType(path_dst.to_path_buf()))
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region ByteStreams

/// Plain read/write loop with a caller-sized buffer.
pub(crate) fn copy_with_buffer<R, W>(reader: &mut R, writer: &mut W, n_buf: usize) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0_u8; n_buf];
    let mut n_total = 0_u64;
    loop {
        let n_read = match reader.read(&mut buf) {
            Ok(0) => return Ok(n_total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n_read])?;
        n_total += n_read as u64;
    }
}

/// Close `file` and surface the close error (dropping a `File` swallows it).
pub(crate) fn close_file(file: fs::File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::fd::IntoRawFd;
        nix::unistd::close(file.into_raw_fd()).map_err(io::Error::from)
    }
    #[cfg(not(unix))]
    {
        drop(file);
        Ok(())
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region MetadataPreservation

pub(crate) fn preserve_times(meta: &SpecEntryMeta, path_dst: &Path) -> Result<(), CopyTreeError> {
    let (Some(atime), Some(mtime)) = (meta.atime, meta.mtime) else {
        log::debug!("No source times to preserve for {}", path_dst.display());
        return Ok(());
    };
    filetime::set_file_times(
        path_dst,
        FileTime::from_system_time(atime),
        FileTime::from_system_time(mtime),
    )
    .map_err(|e| CopyTreeError::io(path_dst, e))
}

/// Times of the link itself, not of its target.
pub(crate) fn preserve_ltimes(meta: &SpecEntryMeta, path_dst: &Path) -> Result<(), CopyTreeError> {
    let (Some(atime), Some(mtime)) = (meta.atime, meta.mtime) else {
        return Ok(());
    };
    filetime::set_symlink_file_times(
        path_dst,
        FileTime::from_system_time(atime),
        FileTime::from_system_time(mtime),
    )
    .map_err(|e| CopyTreeError::io(path_dst, e))
}

pub(crate) fn preserve_owner(meta: &SpecEntryMeta, path_dst: &Path) -> Result<(), CopyTreeError> {
    #[cfg(unix)]
    {
        if meta.uid.is_none() && meta.gid.is_none() {
            return Ok(());
        }
        std::os::unix::fs::lchown(path_dst, meta.uid, meta.gid)
            .map_err(|e| CopyTreeError::io(path_dst, e))
    }
    #[cfg(not(unix))]
    {
        let _ = (meta, path_dst);
        Ok(())
    }
}

/// Best-effort: attributes that cannot be read or written are skipped.
pub(crate) fn copy_xattrs(path_src: &Path, path_dst: &Path) {
    let iter_xattr_names = match xattr::list(path_src) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("Cannot list xattrs of {} ({e})", path_src.display());
            return;
        }
    };

    for name in iter_xattr_names {
        let Some(raw_value) = xattr::get(path_src, &name).ok().flatten() else {
            continue;
        };
        if let Err(e) = xattr::set(path_dst, &name, &raw_value) {
            log::debug!(
                "Cannot set xattr {} on {} ({e})",
                name.to_string_lossy(),
                path_dst.display()
            );
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::copy_with_buffer;

    #[test]
    fn buffered_copy_handles_partial_chunks() {
        let raw_src: Vec<u8> = (0..1000_u32).map(|v| (v % 251) as u8).collect();
        for n_buf in [1_usize, 7, 999, 1000, 1001] {
            let mut reader = Cursor::new(raw_src.clone());
            let mut raw_dst = Vec::new();
            let n_copied = copy_with_buffer(&mut reader, &mut raw_dst, n_buf).expect("copy");
            assert_eq!(n_copied, 1000);
            assert_eq!(raw_dst, raw_src);
        }
    }

    #[test]
    fn buffered_copy_empty_source() {
        let mut reader = Cursor::new(Vec::<u8>::new());
        let mut raw_dst = Vec::new();
        assert_eq!(copy_with_buffer(&mut reader, &mut raw_dst, 16).expect("copy"), 0);
        assert!(raw_dst.is_empty());
    }
}
