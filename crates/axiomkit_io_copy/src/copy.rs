//! Recursive traversal, per-entry dispatch and bounded concurrent fan-out.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;

use crate::entry::{EnumEntryKind, SpecEntryMeta};
use crate::limiter::{AdmissionLimiter, CancelToken};
use crate::policy::CopyPolicy;
use crate::source::{OsSourceFs, SourceFs};
use crate::spec::{
    CopyTreeError, EnumDirExistsAction, EnumSymlinkAction, SpecCopyConfig, SpecCopyOptions,
};
use crate::util::{
    close_file, copy_with_buffer, copy_xattrs, create_device_node, create_dir_permissive,
    create_named_pipe, create_symbolic_link, ensure_parent_dir, preserve_ltimes, preserve_owner,
    preserve_times, remove_existing,
};

/// Symlink hops followed by one Deep resolution before giving up.
const N_MAX_LINK_HOPS: usize = 40;

/// Failure of one handler, tagged with whether `on_error` already saw it.
#[derive(Debug)]
enum EnumCopyFault {
    /// Raised for the entry being handled.
    Origin(CopyTreeError),
    /// Raised below this entry and already passed through `on_error`, or a
    /// cancellation that never goes through it.
    Routed(CopyTreeError),
}

impl From<CopyTreeError> for EnumCopyFault {
    fn from(err: CopyTreeError) -> Self {
        Self::Origin(err)
    }
}

enum EnumSourceReader {
    Native(fs::File),
    Stream(Box<dyn Read + Send>),
}

/// Identity of a source directory. Sources without inode numbers fall back
/// to the path the directory was reached through.
#[derive(Debug, PartialEq, Eq)]
enum EnumDirKey {
    Inode(u64, u64),
    Path(PathBuf),
}

impl EnumDirKey {
    fn of(path_src: &Path, meta: &SpecEntryMeta) -> Self {
        match meta.dev_ino {
            Some((n_dev, n_ino)) => Self::Inode(n_dev, n_ino),
            None => Self::Path(path_src.to_path_buf()),
        }
    }
}

/// One directory currently being copied, linked to the one enclosing it.
struct SpecDirFrame<'a> {
    key_dir: EnumDirKey,
    parent: Option<&'a SpecDirFrame<'a>>,
}

/// State that differs per traversal branch: the cancel token of the task
/// group the entry runs in, and the directories above it.
#[derive(Clone, Copy)]
struct SpecBranch<'a> {
    token: &'a CancelToken<'a>,
    dir_parent: Option<&'a SpecDirFrame<'a>>,
}

impl SpecBranch<'_> {
    fn is_ancestor(&self, key_dir: &EnumDirKey) -> bool {
        let mut frame = self.dir_parent;
        while let Some(v) = frame {
            if v.key_dir == *key_dir {
                return true;
            }
            frame = v.parent;
        }
        false
    }
}

/// Per-call state shared by every recursive step.
struct SpecCopyContext {
    spec_cp_config: SpecCopyConfig,
    fs_source: Arc<dyn SourceFs>,
    path_dst_root: PathBuf,
    limiter: Option<AdmissionLimiter>,
    thread_pool: Option<rayon::ThreadPool>,
}

impl SpecCopyContext {
    fn new(spec_cp_config: SpecCopyConfig, path_dst_root: PathBuf) -> Self {
        let fs_source = spec_cp_config
            .fs_source
            .clone()
            .unwrap_or_else(|| Arc::new(OsSourceFs));

        let n_workers = spec_cp_config.num_workers;
        let mut limiter = None;
        let mut thread_pool = None;
        if n_workers > 1 {
            match ThreadPoolBuilder::new()
                .num_threads(n_workers)
                .thread_name(|n_idx| format!("axiomkit-copy-{n_idx}"))
                .build()
            {
                Ok(v) => {
                    limiter = Some(AdmissionLimiter::new(n_workers));
                    thread_pool = Some(v);
                }
                Err(e) => log::warn!(
                    "Failed to initialize thread pool (workers={n_workers}); fallback to serial copy ({e})."
                ),
            }
        }
        log::debug!(
            "Copy mode: {} (workers={n_workers})",
            if limiter.is_some() {
                "concurrent"
            } else {
                "sequential"
            }
        );

        Self {
            spec_cp_config,
            fs_source,
            path_dst_root,
            limiter,
            thread_pool,
        }
    }

    fn policy(&self) -> &dyn CopyPolicy {
        self.spec_cp_config.policy.as_ref()
    }

    /// Hand `err` to the `on_error` hook; `Ok` when the hook swallowed it.
    fn route_error(
        &self,
        path_src: &Path,
        path_dst: &Path,
        err: CopyTreeError,
    ) -> Result<(), CopyTreeError> {
        match self.policy().on_error(path_src, path_dst, err) {
            Some(e) => Err(e),
            None => {
                log::debug!("Error vetoed by policy: {}", path_src.display());
                Ok(())
            }
        }
    }

    fn open_source(&self, path_src: &Path) -> io::Result<EnumSourceReader> {
        if self.spec_cp_config.fs_source.is_none() && self.spec_cp_config.wrap_reader.is_none() {
            return fs::File::open(path_src).map(EnumSourceReader::Native);
        }
        let reader = self.fs_source.open(path_src)?;
        Ok(EnumSourceReader::Stream(
            match &self.spec_cp_config.wrap_reader {
                Some(fn_wrap) => fn_wrap(reader),
                None => reader,
            },
        ))
    }
}

/// Copy `source` to `destination`, whatever kind of entry `source` is.
///
/// `overlays` are merged left to right into one [`SpecCopyOptions`]; fields a
/// later overlay leaves unset keep the earlier value.
///
/// Directories are copied recursively. With more than one worker, the
/// children of each directory are copied concurrently while at most
/// `num_workers` non-directory copies run at the same time. Every failure goes
/// through [`CopyPolicy::on_error`] once; the first one it does not swallow is
/// returned. Cancellations caused by that failure never reach `on_error` and
/// never replace it as the returned error.
pub fn copy_tree<P, Q, I>(source: P, destination: Q, overlays: I) -> Result<(), CopyTreeError>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    I: IntoIterator<Item = SpecCopyOptions>,
{
    let spec_cp_options = overlays
        .into_iter()
        .fold(SpecCopyOptions::default(), SpecCopyOptions::merge);
    let spec_cp_config = SpecCopyConfig::resolve(spec_cp_options)?;

    let path_src = source.as_ref().to_path_buf();
    let path_dst = destination.as_ref().to_path_buf();
    let spec_cp_ctx = SpecCopyContext::new(spec_cp_config, path_dst.clone());

    let run = || {
        let meta_src = match spec_cp_ctx.fs_source.symlink_metadata(&path_src) {
            Ok(v) => v,
            Err(e) => {
                return spec_cp_ctx.route_error(
                    &path_src,
                    &path_dst,
                    CopyTreeError::io(&path_src, e),
                );
            }
        };
        let token_root = CancelToken::root();
        let branch = SpecBranch {
            token: &token_root,
            dir_parent: None,
        };
        copy_next_or_skip(&path_src, &path_dst, &meta_src, branch, &spec_cp_ctx)
    };

    match &spec_cp_ctx.thread_pool {
        Some(thread_pool) => thread_pool.install(run),
        None => run(),
    }
}

/// Entry gate: consult the skip hook, then dispatch.
fn copy_next_or_skip(
    path_src: &Path,
    path_dst: &Path,
    meta: &SpecEntryMeta,
    branch: SpecBranch<'_>,
    spec_cp_ctx: &SpecCopyContext,
) -> Result<(), CopyTreeError> {
    match spec_cp_ctx.policy().should_skip(meta, path_src, path_dst) {
        Ok(true) => {
            log::debug!("Skipped by policy: {}", path_src.display());
            Ok(())
        }
        Ok(false) => switchboard(path_src, path_dst, meta, branch, spec_cp_ctx),
        Err(e) => spec_cp_ctx.route_error(path_src, path_dst, e),
    }
}

/// Pick the handler for `meta.kind`. Errors raised for this entry leave
/// through `on_error`; errors from descendants already did.
fn switchboard(
    path_src: &Path,
    path_dst: &Path,
    meta: &SpecEntryMeta,
    branch: SpecBranch<'_>,
    spec_cp_ctx: &SpecCopyContext,
) -> Result<(), CopyTreeError> {
    log::trace!(
        "{:?}: {} -> {}",
        meta.kind,
        path_src.display(),
        path_dst.display()
    );

    let res = match meta.kind {
        EnumEntryKind::Device { .. } if !spec_cp_ctx.spec_cp_config.if_specials => Err(
            EnumCopyFault::Origin(CopyTreeError::SpecialFile(path_src.to_path_buf())),
        ),
        EnumEntryKind::Symlink => copy_symlink(path_src, path_dst, meta, branch, spec_cp_ctx),
        EnumEntryKind::Dir => copy_dir(path_src, path_dst, meta, branch, spec_cp_ctx),
        EnumEntryKind::NamedPipe => {
            copy_leaf_admitted(branch, spec_cp_ctx, || copy_pipe(path_dst, meta))
        }
        EnumEntryKind::Device { if_block } => copy_leaf_admitted(branch, spec_cp_ctx, || {
            copy_device(path_dst, meta, if_block)
        }),
        EnumEntryKind::Socket => Err(EnumCopyFault::Origin(CopyTreeError::UnsupportedType(
            path_src.to_path_buf(),
        ))),
        EnumEntryKind::File => copy_leaf_admitted(branch, spec_cp_ctx, || {
            copy_file(path_src, path_dst, meta, spec_cp_ctx)
        }),
    };

    match res {
        Ok(()) => Ok(()),
        Err(EnumCopyFault::Routed(e)) => Err(e),
        Err(EnumCopyFault::Origin(e)) => spec_cp_ctx.route_error(path_src, path_dst, e),
    }
}

/// Run one leaf copy while holding an admission slot (concurrent mode only).
/// Slots are never held across recursion into a directory. A cancelled wait
/// goes straight back to the task group, not through `on_error`.
fn copy_leaf_admitted<F>(
    branch: SpecBranch<'_>,
    spec_cp_ctx: &SpecCopyContext,
    f: F,
) -> Result<(), EnumCopyFault>
where
    F: FnOnce() -> Result<(), CopyTreeError>,
{
    let _permit = match &spec_cp_ctx.limiter {
        Some(limiter) => Some(limiter.acquire(branch.token).map_err(EnumCopyFault::Routed)?),
        None => None,
    };
    f().map_err(EnumCopyFault::from)
}

////////////////////////////////////////////////////////////////////////////////
// #region Files

fn copy_file(
    path_src: &Path,
    path_dst: &Path,
    meta: &SpecEntryMeta,
    spec_cp_ctx: &SpecCopyContext,
) -> Result<(), CopyTreeError> {
    let reader_src = match spec_cp_ctx.open_source(path_src) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!("Source vanished before copy: {}", path_src.display());
            return Ok(());
        }
        Err(e) => return Err(CopyTreeError::io(path_src, e)),
    };

    ensure_parent_dir(path_dst)?;
    let file_dst = fs::File::create(path_dst).map_err(|e| CopyTreeError::io(path_dst, e))?;
    let finalize = spec_cp_ctx.policy().permission_control(meta, path_dst)?;

    let mut res = write_contents(reader_src, file_dst, path_dst, spec_cp_ctx);
    finalize.apply(&mut res);
    res?;

    let spec_cp_config = &spec_cp_ctx.spec_cp_config;
    if spec_cp_config.if_preserve_owner {
        preserve_owner(meta, path_dst)?;
    }
    if spec_cp_config.if_preserve_times {
        preserve_times(meta, path_dst)?;
    }
    if spec_cp_config.if_preserve_xattrs && spec_cp_config.fs_source.is_none() {
        copy_xattrs(path_src, path_dst);
    }
    Ok(())
}

/// Stream bytes, optionally sync, then close both handles. The first error
/// wins; a close error only surfaces when everything before it succeeded.
fn write_contents(
    reader_src: EnumSourceReader,
    mut file_dst: fs::File,
    path_dst: &Path,
    spec_cp_ctx: &SpecCopyContext,
) -> Result<(), CopyTreeError> {
    let n_buf = spec_cp_ctx.spec_cp_config.copy_buffer_size;

    let mut res = match reader_src {
        EnumSourceReader::Native(mut file_src) => {
            let res_copy = match n_buf {
                Some(n) => copy_with_buffer(&mut file_src, &mut file_dst, n),
                None => io::copy(&mut file_src, &mut file_dst),
            };
            let res_close = close_file(file_src);
            res_copy.and(res_close)
        }
        EnumSourceReader::Stream(mut reader) => match n_buf {
            Some(n) => copy_with_buffer(reader.as_mut(), &mut file_dst, n),
            None => io::copy(reader.as_mut(), &mut file_dst),
        }
        .map(|_| ()),
    };

    if res.is_ok() && spec_cp_ctx.spec_cp_config.if_sync {
        res = file_dst.sync_all();
    }
    let res_close = close_file(file_dst);
    res.and(res_close)
        .map_err(|e| CopyTreeError::io(path_dst, e))
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Directories

fn copy_dir(
    path_dir_src: &Path,
    path_dir_dst: &Path,
    meta: &SpecEntryMeta,
    branch: SpecBranch<'_>,
    spec_cp_ctx: &SpecCopyContext,
) -> Result<(), EnumCopyFault> {
    // A directory that is its own ancestor can only be reached through Deep
    // links; copying it would never terminate.
    let key_dir = EnumDirKey::of(path_dir_src, meta);
    if branch.is_ancestor(&key_dir) {
        return Err(CopyTreeError::DirectoryCycle(path_dir_src.to_path_buf()).into());
    }

    if should_leave_dir_untouched(path_dir_src, path_dir_dst, spec_cp_ctx)? {
        return Ok(());
    }

    let l_entries = match spec_cp_ctx.fs_source.read_dir(path_dir_src) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!("Source directory vanished: {}", path_dir_src.display());
            return Ok(());
        }
        Err(e) => return Err(CopyTreeError::io(path_dir_src, e).into()),
    };

    create_dir_permissive(path_dir_dst)?;
    let finalize = spec_cp_ctx
        .policy()
        .permission_control(meta, path_dir_dst)?;

    let frame = SpecDirFrame {
        key_dir,
        parent: branch.dir_parent,
    };
    let branch_children = SpecBranch {
        token: branch.token,
        dir_parent: Some(&frame),
    };
    let mut res = copy_dir_contents(
        path_dir_src,
        path_dir_dst,
        l_entries,
        branch_children,
        spec_cp_ctx,
    );
    finalize.apply(&mut res);
    res?;

    if spec_cp_ctx.spec_cp_config.if_preserve_owner {
        preserve_owner(meta, path_dir_dst)?;
    }
    if spec_cp_ctx.spec_cp_config.if_preserve_times {
        preserve_times(meta, path_dir_dst)?;
    }
    Ok(())
}

/// Destination conflict check. `Ok(true)` means the subtree must be left alone.
fn should_leave_dir_untouched(
    path_dir_src: &Path,
    path_dir_dst: &Path,
    spec_cp_ctx: &SpecCopyContext,
) -> Result<bool, CopyTreeError> {
    match fs::metadata(path_dir_dst) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(CopyTreeError::io(path_dir_dst, e)),
    }
    if path_dir_dst == spec_cp_ctx.path_dst_root {
        return Ok(false);
    }

    match spec_cp_ctx
        .policy()
        .on_dir_exists(path_dir_src, path_dir_dst)
    {
        EnumDirExistsAction::Replace => {
            log::debug!("Replacing destination: {}", path_dir_dst.display());
            remove_existing(path_dir_dst)?;
            Ok(false)
        }
        EnumDirExistsAction::Untouchable => {
            log::debug!("Destination left untouched: {}", path_dir_dst.display());
            Ok(true)
        }
        EnumDirExistsAction::Merge => Ok(false),
    }
}

fn copy_dir_contents(
    path_dir_src: &Path,
    path_dir_dst: &Path,
    l_entries: Vec<SpecEntryMeta>,
    branch: SpecBranch<'_>,
    spec_cp_ctx: &SpecCopyContext,
) -> Result<(), EnumCopyFault> {
    let limiter = match &spec_cp_ctx.limiter {
        Some(v) => v,
        None => {
            return copy_dir_sequential(path_dir_src, path_dir_dst, &l_entries, branch, spec_cp_ctx)
                .map_err(EnumCopyFault::Routed);
        }
    };

    if spec_cp_ctx
        .policy()
        .prefer_concurrent(path_dir_src, path_dir_dst)?
    {
        copy_dir_concurrent(
            path_dir_src,
            path_dir_dst,
            l_entries,
            branch,
            limiter,
            spec_cp_ctx,
        )
    } else {
        copy_dir_sequential(path_dir_src, path_dir_dst, &l_entries, branch, spec_cp_ctx)
    }
    .map_err(EnumCopyFault::Routed)
}

fn copy_dir_sequential(
    path_dir_src: &Path,
    path_dir_dst: &Path,
    l_entries: &[SpecEntryMeta],
    branch: SpecBranch<'_>,
    spec_cp_ctx: &SpecCopyContext,
) -> Result<(), CopyTreeError> {
    for meta_child in l_entries {
        let path_src_child = path_dir_src.join(&meta_child.name);
        let path_dst_child = path_dir_dst.join(&meta_child.name);
        copy_next_or_skip(
            &path_src_child,
            &path_dst_child,
            meta_child,
            branch,
            spec_cp_ctx,
        )?;
    }
    Ok(())
}

/// One task per child under a group token chained to the enclosing group.
/// A failure cancels this group only; the enclosing group learns about it
/// when this call returns, with the failure already recorded as first error.
fn copy_dir_concurrent(
    path_dir_src: &Path,
    path_dir_dst: &Path,
    l_entries: Vec<SpecEntryMeta>,
    branch: SpecBranch<'_>,
    limiter: &AdmissionLimiter,
    spec_cp_ctx: &SpecCopyContext,
) -> Result<(), CopyTreeError> {
    let token_group = branch.token.child();
    let branch_group = SpecBranch {
        token: &token_group,
        dir_parent: branch.dir_parent,
    };
    let err_first: Mutex<Option<CopyTreeError>> = Mutex::new(None);

    rayon::scope(|s| {
        for meta_child in l_entries {
            let err_first = &err_first;
            let token_group = &token_group;
            s.spawn(move |_| {
                let path_src_child = path_dir_src.join(&meta_child.name);
                let path_dst_child = path_dir_dst.join(&meta_child.name);
                let res = if token_group.is_cancelled() {
                    Err(CopyTreeError::Cancelled)
                } else {
                    copy_next_or_skip(
                        &path_src_child,
                        &path_dst_child,
                        &meta_child,
                        branch_group,
                        spec_cp_ctx,
                    )
                };
                if let Err(e) = res {
                    {
                        let mut slot = err_first.lock();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                    limiter.cancel(token_group);
                }
            });
        }
    });

    match err_first.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region SymlinksAndSpecials

fn resolve_link_target(path_link: &Path, path_target: PathBuf) -> PathBuf {
    if path_target.is_absolute() {
        return path_target;
    }
    match path_link.parent() {
        Some(path_parent) => path_parent.join(path_target),
        None => path_target,
    }
}

fn copy_symlink(
    path_src: &Path,
    path_dst: &Path,
    meta: &SpecEntryMeta,
    branch: SpecBranch<'_>,
    spec_cp_ctx: &SpecCopyContext,
) -> Result<(), EnumCopyFault> {
    match spec_cp_ctx.policy().on_symlink(path_src) {
        EnumSymlinkAction::Shallow => copy_leaf_admitted(branch, spec_cp_ctx, || {
            copy_symlink_shallow(path_src, path_dst, meta, spec_cp_ctx)
        }),
        EnumSymlinkAction::Deep => copy_symlink_deep(path_src, path_dst, branch, spec_cp_ctx),
        EnumSymlinkAction::Skip => Ok(()),
    }
}

fn copy_symlink_shallow(
    path_src: &Path,
    path_dst: &Path,
    meta: &SpecEntryMeta,
    spec_cp_ctx: &SpecCopyContext,
) -> Result<(), CopyTreeError> {
    let path_target = match spec_cp_ctx.fs_source.read_link(path_src) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!("Symlink vanished before copy: {}", path_src.display());
            return Ok(());
        }
        Err(e) => return Err(CopyTreeError::io(path_src, e)),
    };

    let b_target_is_dir = spec_cp_ctx
        .fs_source
        .symlink_metadata(&resolve_link_target(path_src, path_target.clone()))
        .is_ok_and(|v| v.is_dir());

    ensure_parent_dir(path_dst)?;
    create_symbolic_link(&path_target, path_dst, b_target_is_dir)?;
    if spec_cp_ctx.spec_cp_config.if_preserve_times {
        preserve_ltimes(meta, path_dst)?;
    }
    Ok(())
}

/// Follow the link chain and copy the final target in place of the link.
fn copy_symlink_deep(
    path_src: &Path,
    path_dst: &Path,
    branch: SpecBranch<'_>,
    spec_cp_ctx: &SpecCopyContext,
) -> Result<(), EnumCopyFault> {
    let mut path_link = path_src.to_path_buf();
    for _ in 0..N_MAX_LINK_HOPS {
        let path_target = match spec_cp_ctx.fs_source.read_link(&path_link) {
            Ok(v) => resolve_link_target(&path_link, v),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("Symlink vanished before copy: {}", path_link.display());
                return Ok(());
            }
            Err(e) => return Err(CopyTreeError::io(&path_link, e).into()),
        };
        let meta_target = match spec_cp_ctx.fs_source.symlink_metadata(&path_target) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    "Dangling symlink skipped: {} -> {}",
                    path_src.display(),
                    path_target.display()
                );
                return Ok(());
            }
            Err(e) => return Err(CopyTreeError::io(&path_target, e).into()),
        };

        if meta_target.kind != EnumEntryKind::Symlink {
            return copy_next_or_skip(&path_target, path_dst, &meta_target, branch, spec_cp_ctx)
                .map_err(EnumCopyFault::Routed);
        }
        path_link = path_target;
    }

    Err(CopyTreeError::io(
        path_src,
        io::Error::other("too many levels of symbolic links"),
    )
    .into())
}

fn copy_pipe(path_dst: &Path, meta: &SpecEntryMeta) -> Result<(), CopyTreeError> {
    ensure_parent_dir(path_dst)?;
    create_named_pipe(path_dst, meta.mode)
}

fn copy_device(path_dst: &Path, meta: &SpecEntryMeta, if_block: bool) -> Result<(), CopyTreeError> {
    ensure_parent_dir(path_dst)?;
    create_device_node(path_dst, meta, if_block)
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
