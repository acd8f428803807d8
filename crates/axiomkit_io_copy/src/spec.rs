//! Copy option models, policy enums and the error type.

use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::policy::{CopyPolicy, DefaultCopyPolicy};
use crate::source::SourceFs;

////////////////////////////////////////////////////////////////////////////////
// #region EnumsInit

/// Symlink handling decided by [`CopyPolicy::on_symlink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumSymlinkAction {
    /// Recreate the link itself at destination (target is not followed).
    #[default]
    Shallow,
    /// Resolve the link and copy the target in place of the link.
    Deep,
    /// Ignore the link entry.
    Skip,
}

/// Existing destination directory policy decided by [`CopyPolicy::on_dir_exists`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumDirExistsAction {
    /// Reuse destination directory; every child is evaluated on its own.
    #[default]
    Merge,
    /// Remove the destination subtree before copying.
    Replace,
    /// Leave the destination subtree alone and copy nothing into it.
    Untouchable,
}

/// Pattern matching mode for include/exclude lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumCopyPatternMode {
    /// Shell-like wildcards (`*`, `?`, character classes).
    #[default]
    Glob,
    /// Regular expression pattern.
    Regex,
    /// Substring match.
    Literal,
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region StructsAndErrors

/// Wraps the raw source byte stream before it reaches the copy loop.
pub type FnWrapReader = Arc<dyn Fn(Box<dyn Read + Send>) -> Box<dyn Read + Send> + Send + Sync>;

/// Input options for `copy_tree`.
///
/// Every field is optional so several option sets can be layered: later
/// overlays only win for the fields they set (see [`SpecCopyOptions::merge`]).
#[derive(Clone, Default)]
pub struct SpecCopyOptions {
    /// Worker count. `<= 1` copies sequentially; `> 1` enables the bounded
    /// concurrent mode with this many leaf copies in flight.
    pub num_workers: Option<usize>,
    /// Read-only filesystem used for the source side instead of the OS.
    pub fs_source: Option<Arc<dyn SourceFs>>,
    /// Explicit copy buffer size. Forces the plain buffered read/write loop.
    pub copy_buffer_size: Option<usize>,
    /// Flush every copied file to storage before returning.
    pub if_sync: Option<bool>,
    /// Copy uid/gid of the source entries.
    pub if_preserve_owner: Option<bool>,
    /// Copy access/modification times of the source entries.
    pub if_preserve_times: Option<bool>,
    /// Copy extended attributes of regular files (OS source only).
    pub if_preserve_xattrs: Option<bool>,
    /// Allow device special files (recreated with `mknod`).
    pub if_specials: Option<bool>,
    /// Policy hooks. [`DefaultCopyPolicy`] when unset.
    pub policy: Option<Arc<dyn CopyPolicy>>,
    /// Optional source stream wrapper.
    pub wrap_reader: Option<FnWrapReader>,
}

impl SpecCopyOptions {
    /// Overlay `other` on top of `self`; fields set in `other` win.
    ///
    /// `policy` is one field: a later overlay that sets it replaces every hook
    /// of the earlier policy, including hooks it leaves at their defaults.
    /// Combine hooks inside one [`CopyPolicy`] implementation (or wrap another
    /// policy, as [`crate::PolicyPatternFilter::with_inner`] does) instead.
    pub fn merge(self, other: SpecCopyOptions) -> SpecCopyOptions {
        SpecCopyOptions {
            num_workers: other.num_workers.or(self.num_workers),
            fs_source: other.fs_source.or(self.fs_source),
            copy_buffer_size: other.copy_buffer_size.or(self.copy_buffer_size),
            if_sync: other.if_sync.or(self.if_sync),
            if_preserve_owner: other.if_preserve_owner.or(self.if_preserve_owner),
            if_preserve_times: other.if_preserve_times.or(self.if_preserve_times),
            if_preserve_xattrs: other.if_preserve_xattrs.or(self.if_preserve_xattrs),
            if_specials: other.if_specials.or(self.if_specials),
            policy: other.policy.or(self.policy),
            wrap_reader: other.wrap_reader.or(self.wrap_reader),
        }
    }
}

impl fmt::Debug for SpecCopyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecCopyOptions")
            .field("num_workers", &self.num_workers)
            .field("fs_source", &self.fs_source.is_some())
            .field("copy_buffer_size", &self.copy_buffer_size)
            .field("if_sync", &self.if_sync)
            .field("if_preserve_owner", &self.if_preserve_owner)
            .field("if_preserve_times", &self.if_preserve_times)
            .field("if_preserve_xattrs", &self.if_preserve_xattrs)
            .field("if_specials", &self.if_specials)
            .field("policy", &self.policy.is_some())
            .field("wrap_reader", &self.wrap_reader.is_some())
            .finish()
    }
}

/// Resolved, read-only configuration of one `copy_tree` call.
pub(crate) struct SpecCopyConfig {
    pub(crate) num_workers: usize,
    pub(crate) fs_source: Option<Arc<dyn SourceFs>>,
    pub(crate) copy_buffer_size: Option<usize>,
    pub(crate) if_sync: bool,
    pub(crate) if_preserve_owner: bool,
    pub(crate) if_preserve_times: bool,
    pub(crate) if_preserve_xattrs: bool,
    pub(crate) if_specials: bool,
    pub(crate) policy: Arc<dyn CopyPolicy>,
    pub(crate) wrap_reader: Option<FnWrapReader>,
}

impl SpecCopyConfig {
    pub(crate) fn resolve(spec_cp_options: SpecCopyOptions) -> Result<Self, CopyTreeError> {
        if spec_cp_options.copy_buffer_size == Some(0) {
            return Err(CopyTreeError::InvalidOptions(
                "Arg `copy_buffer_size` must be >= 1 or None.".to_string(),
            ));
        }

        Ok(Self {
            num_workers: spec_cp_options.num_workers.unwrap_or(1),
            fs_source: spec_cp_options.fs_source,
            copy_buffer_size: spec_cp_options.copy_buffer_size,
            if_sync: spec_cp_options.if_sync.unwrap_or(false),
            if_preserve_owner: spec_cp_options.if_preserve_owner.unwrap_or(false),
            if_preserve_times: spec_cp_options.if_preserve_times.unwrap_or(false),
            if_preserve_xattrs: spec_cp_options.if_preserve_xattrs.unwrap_or(false),
            if_specials: spec_cp_options.if_specials.unwrap_or(false),
            policy: spec_cp_options
                .policy
                .unwrap_or_else(|| Arc::new(DefaultCopyPolicy)),
            wrap_reader: spec_cp_options.wrap_reader,
        })
    }
}

/// Every failure a copy can surface, including ones raised by policy hooks.
#[derive(Debug, Error)]
pub enum CopyTreeError {
    /// Filesystem call failed on `path`.
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        /// Path the failing call operated on.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Device special file met while specials are disabled.
    #[error("Device file rejected (specials disabled): {}", .0.display())]
    SpecialFile(PathBuf),
    /// Entry type the engine cannot replicate (sockets).
    #[error("Unsupported file type: {}", .0.display())]
    UnsupportedType(PathBuf),
    /// Directory reached again below itself (Deep links pointing upwards).
    #[error("Directory cycle detected: {}", .0.display())]
    DirectoryCycle(PathBuf),
    /// Admission wait aborted because a sibling task already failed.
    #[error("Copy cancelled after a sibling task failed")]
    Cancelled,
    /// Invalid option value.
    #[error("{0}")]
    InvalidOptions(String),
    /// Invalid include/exclude pattern.
    #[error("{0}")]
    InvalidPattern(String),
    /// Failure reported by a caller-supplied policy hook.
    #[error("Policy hook failed: {0}")]
    Policy(String),
}

impl CopyTreeError {
    /// Wrap an IO error with the path it happened on.
    pub fn io<P: Into<PathBuf>>(path: P, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// `true` when the error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
