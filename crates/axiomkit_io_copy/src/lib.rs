//! `axiomkit_io_copy` v1:
//! Policy-driven recursive copy engine.
//!
//! Module map:
//! - `copy`    : traversal, dispatch and bounded concurrent fan-out
//! - `spec`    : enums/options/errors
//! - `entry`   : entry metadata snapshot and type classification
//! - `policy`  : policy hooks and permission helpers
//! - `filter`  : include/exclude pattern policy
//! - `source`  : injectable source filesystem
//! - `limiter` : admission gate for concurrent leaf copies
//! - `util`    : shared helper functions

pub mod copy;
pub mod entry;
pub mod filter;
mod limiter;
pub mod policy;
pub mod source;
pub mod spec;
mod util;

pub use copy::copy_tree;
pub use entry::{EnumEntryKind, SpecEntryMeta};
pub use filter::{PolicyPatternFilter, SpecCopyPatternRules};
pub use policy::{
    CopyPolicy, DefaultCopyPolicy, FinalizePermission, add_permission, keep_default_permission,
    preserve_permission,
};
pub use source::{OsSourceFs, SourceFs};
pub use spec::{
    CopyTreeError, EnumCopyPatternMode, EnumDirExistsAction, EnumSymlinkAction, FnWrapReader,
    SpecCopyOptions,
};
