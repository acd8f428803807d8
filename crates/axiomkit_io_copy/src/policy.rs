//! Policy hooks consulted during traversal.

use std::fmt;
use std::path::Path;

use crate::entry::SpecEntryMeta;
use crate::spec::{CopyTreeError, EnumDirExistsAction, EnumSymlinkAction};
use crate::util::set_permission_mode;

/// Caller-supplied decisions, one method per hook.
///
/// Every method has a permissive default, so an implementation only overrides
/// the hooks it cares about.
pub trait CopyPolicy: Send + Sync {
    /// Entry gate. `Ok(true)` drops the entry and, for directories, its whole
    /// subtree. Consulted for the top-level source and every child.
    fn should_skip(
        &self,
        _meta: &SpecEntryMeta,
        _path_src: &Path,
        _path_dst: &Path,
    ) -> Result<bool, CopyTreeError> {
        Ok(false)
    }

    /// What to do with the symlink at `path_src`.
    fn on_symlink(&self, _path_src: &Path) -> EnumSymlinkAction {
        EnumSymlinkAction::Shallow
    }

    /// What to do when `path_dst` already exists as a directory target.
    ///
    /// Never consulted for the top-level destination itself.
    fn on_dir_exists(&self, _path_src: &Path, _path_dst: &Path) -> EnumDirExistsAction {
        EnumDirExistsAction::Merge
    }

    /// Permission to apply once `path_dst` is fully written.
    fn permission_control(
        &self,
        meta: &SpecEntryMeta,
        path_dst: &Path,
    ) -> Result<FinalizePermission, CopyTreeError> {
        preserve_permission(meta, path_dst)
    }

    /// Error funnel. `None` swallows the error and lets traversal go on.
    fn on_error(
        &self,
        _path_src: &Path,
        _path_dst: &Path,
        err: CopyTreeError,
    ) -> Option<CopyTreeError> {
        Some(err)
    }

    /// Whether a directory may fan out concurrently. Only asked when more
    /// than one worker is configured.
    fn prefer_concurrent(&self, _path_src: &Path, _path_dst: &Path) -> Result<bool, CopyTreeError> {
        Ok(true)
    }
}

/// Policy with every hook left at its default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCopyPolicy;

impl CopyPolicy for DefaultCopyPolicy {}

type FnFinalize = Box<dyn FnOnce() -> Result<(), CopyTreeError> + Send>;

/// Deferred permission step returned by [`CopyPolicy::permission_control`].
///
/// Applied exactly once after the entry is written, whether or not writing
/// succeeded. Its own failure never replaces an earlier one.
pub struct FinalizePermission(Option<FnFinalize>);

impl FinalizePermission {
    /// Wrap a finalize closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<(), CopyTreeError> + Send + 'static,
    {
        Self(Some(Box::new(f)))
    }

    /// Finalize step that does nothing.
    pub fn noop() -> Self {
        Self(None)
    }

    /// Run the step and merge its outcome into `reported` (first error wins).
    pub fn apply<E: From<CopyTreeError>>(self, reported: &mut Result<(), E>) {
        let Some(f) = self.0 else {
            return;
        };
        if let Err(e) = f()
            && reported.is_ok()
        {
            *reported = Err(e.into());
        }
    }
}

impl fmt::Debug for FinalizePermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FinalizePermission")
            .field(&self.0.is_some())
            .finish()
    }
}

/// Give `path_dst` the source permission bits.
pub fn preserve_permission(
    meta: &SpecEntryMeta,
    path_dst: &Path,
) -> Result<FinalizePermission, CopyTreeError> {
    add_permission(meta, path_dst, 0)
}

/// Give `path_dst` the source permission bits plus `perm`.
pub fn add_permission(
    meta: &SpecEntryMeta,
    path_dst: &Path,
    perm: u32,
) -> Result<FinalizePermission, CopyTreeError> {
    let mode = (meta.mode | perm) & 0o7777;
    let path_dst = path_dst.to_path_buf();
    Ok(FinalizePermission::new(move || {
        set_permission_mode(&path_dst, mode)
    }))
}

/// Leave whatever mode `path_dst` was created with.
pub fn keep_default_permission(
    _meta: &SpecEntryMeta,
    _path_dst: &Path,
) -> Result<FinalizePermission, CopyTreeError> {
    Ok(FinalizePermission::noop())
}
