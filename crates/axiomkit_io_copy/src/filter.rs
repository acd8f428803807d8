//! Include/exclude pattern filtering as a skip policy.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobMatcher};
use regex::Regex;

use crate::entry::SpecEntryMeta;
use crate::policy::{CopyPolicy, DefaultCopyPolicy, FinalizePermission};
use crate::spec::{CopyTreeError, EnumCopyPatternMode, EnumDirExistsAction, EnumSymlinkAction};

/// Raw include/exclude rules applied to entry basenames.
#[derive(Debug, Clone, Default)]
pub struct SpecCopyPatternRules {
    /// Include patterns for non-directory entries.
    pub patterns_include_files: Option<Vec<String>>,
    /// Exclude patterns for non-directory entries.
    pub patterns_exclude_files: Option<Vec<String>>,
    /// Include patterns for directories.
    pub patterns_include_dirs: Option<Vec<String>>,
    /// Exclude patterns for directories.
    pub patterns_exclude_dirs: Option<Vec<String>>,
    /// Pattern interpretation mode.
    pub rule_pattern: EnumCopyPatternMode,
}

#[derive(Debug, Clone)]
enum TypeCopyPatternSeq {
    Literal(Vec<String>),
    Glob(Vec<GlobMatcher>),
    Regex(Vec<Regex>),
}

impl TypeCopyPatternSeq {
    fn compile(
        patterns: Option<&[String]>,
        rule_pattern: EnumCopyPatternMode,
    ) -> Result<Option<Self>, CopyTreeError> {
        let Some(patterns) = patterns.filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let invalid =
            |e: &dyn fmt::Display| CopyTreeError::InvalidPattern(format!("Invalid pattern: {e}"));

        let seq = match rule_pattern {
            EnumCopyPatternMode::Literal => Self::Literal(patterns.to_vec()),
            EnumCopyPatternMode::Glob => Self::Glob(
                patterns
                    .iter()
                    .map(|p| Glob::new(p).map(|g| g.compile_matcher()))
                    .collect::<Result<_, _>>()
                    .map_err(|e| invalid(&e))?,
            ),
            EnumCopyPatternMode::Regex => Self::Regex(
                patterns
                    .iter()
                    .map(|p| Regex::new(p))
                    .collect::<Result<_, _>>()
                    .map_err(|e| invalid(&e))?,
            ),
        };
        Ok(Some(seq))
    }

    fn is_match(&self, value: &str) -> bool {
        match self {
            Self::Literal(v) => v.iter().any(|p| value.contains(p.as_str())),
            Self::Glob(v) => v.iter().any(|p| p.is_match(value)),
            Self::Regex(v) => v.iter().any(|p| p.is_match(value)),
        }
    }
}

fn is_excluded(
    value: &str,
    patterns_include: Option<&TypeCopyPatternSeq>,
    patterns_exclude: Option<&TypeCopyPatternSeq>,
) -> bool {
    let b_included = patterns_include.is_none_or(|p| p.is_match(value));
    let b_excluded = patterns_exclude.is_some_and(|p| p.is_match(value));
    !b_included || b_excluded
}

/// Skip policy driven by [`SpecCopyPatternRules`].
///
/// Directories are matched against the directory lists, everything else
/// against the file lists. Hooks other than `should_skip` are forwarded to
/// the inner policy ([`DefaultCopyPolicy`] unless replaced).
pub struct PolicyPatternFilter {
    patterns_include_files: Option<TypeCopyPatternSeq>,
    patterns_exclude_files: Option<TypeCopyPatternSeq>,
    patterns_include_dirs: Option<TypeCopyPatternSeq>,
    patterns_exclude_dirs: Option<TypeCopyPatternSeq>,
    path_root: Option<PathBuf>,
    policy_inner: Arc<dyn CopyPolicy>,
}

impl PolicyPatternFilter {
    /// Compile `rules`. Invalid patterns fail with [`CopyTreeError::InvalidPattern`].
    pub fn new(rules: &SpecCopyPatternRules) -> Result<Self, CopyTreeError> {
        let rule_pattern = rules.rule_pattern;
        Ok(Self {
            patterns_include_files: TypeCopyPatternSeq::compile(
                rules.patterns_include_files.as_deref(),
                rule_pattern,
            )?,
            patterns_exclude_files: TypeCopyPatternSeq::compile(
                rules.patterns_exclude_files.as_deref(),
                rule_pattern,
            )?,
            patterns_include_dirs: TypeCopyPatternSeq::compile(
                rules.patterns_include_dirs.as_deref(),
                rule_pattern,
            )?,
            patterns_exclude_dirs: TypeCopyPatternSeq::compile(
                rules.patterns_exclude_dirs.as_deref(),
                rule_pattern,
            )?,
            path_root: None,
            policy_inner: Arc::new(DefaultCopyPolicy),
        })
    }

    /// Never filter the entry at `path_root` (usually the top-level source).
    pub fn with_root<P: Into<PathBuf>>(mut self, path_root: P) -> Self {
        self.path_root = Some(path_root.into());
        self
    }

    /// Forward the non-filter hooks to `policy_inner`.
    pub fn with_inner(mut self, policy_inner: Arc<dyn CopyPolicy>) -> Self {
        self.policy_inner = policy_inner;
        self
    }
}

impl fmt::Debug for PolicyPatternFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyPatternFilter")
            .field("patterns_include_files", &self.patterns_include_files)
            .field("patterns_exclude_files", &self.patterns_exclude_files)
            .field("patterns_include_dirs", &self.patterns_include_dirs)
            .field("patterns_exclude_dirs", &self.patterns_exclude_dirs)
            .field("path_root", &self.path_root)
            .finish_non_exhaustive()
    }
}

impl CopyPolicy for PolicyPatternFilter {
    fn should_skip(
        &self,
        meta: &SpecEntryMeta,
        path_src: &Path,
        path_dst: &Path,
    ) -> Result<bool, CopyTreeError> {
        if self.path_root.as_deref() == Some(path_src) {
            return self.policy_inner.should_skip(meta, path_src, path_dst);
        }

        let c_name = meta.name.to_string_lossy();
        let b_excluded = if meta.is_dir() {
            is_excluded(
                &c_name,
                self.patterns_include_dirs.as_ref(),
                self.patterns_exclude_dirs.as_ref(),
            )
        } else {
            is_excluded(
                &c_name,
                self.patterns_include_files.as_ref(),
                self.patterns_exclude_files.as_ref(),
            )
        };
        if b_excluded {
            log::debug!("Filtered out by pattern: {}", path_src.display());
            return Ok(true);
        }
        self.policy_inner.should_skip(meta, path_src, path_dst)
    }

    fn on_symlink(&self, path_src: &Path) -> EnumSymlinkAction {
        self.policy_inner.on_symlink(path_src)
    }

    fn on_dir_exists(&self, path_src: &Path, path_dst: &Path) -> EnumDirExistsAction {
        self.policy_inner.on_dir_exists(path_src, path_dst)
    }

    fn permission_control(
        &self,
        meta: &SpecEntryMeta,
        path_dst: &Path,
    ) -> Result<FinalizePermission, CopyTreeError> {
        self.policy_inner.permission_control(meta, path_dst)
    }

    fn on_error(
        &self,
        path_src: &Path,
        path_dst: &Path,
        err: CopyTreeError,
    ) -> Option<CopyTreeError> {
        self.policy_inner.on_error(path_src, path_dst, err)
    }

    fn prefer_concurrent(&self, path_src: &Path, path_dst: &Path) -> Result<bool, CopyTreeError> {
        self.policy_inner.prefer_concurrent(path_src, path_dst)
    }
}
