//! Root containment for every client-supplied path
//!
//! Paths arriving on the wire are never handed to the filesystem directly.
//! They are joined onto the served root (or a directory already resolved
//! under it), normalized lexically, and rejected if the result leaves the
//! root. With symlink confinement enabled the deepest existing ancestor is
//! also canonicalized, so a link inside the root cannot point the transfer
//! somewhere else.

use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};

use crate::error::{RcpError, Result};

/// An absolute path that is the root or lies beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath(PathBuf);

impl ResolvedPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for ResolvedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    canonical_root: PathBuf,
    strict_symlinks: bool,
}

impl PathResolver {
    /// `root` must already be absolute.
    pub fn new(root: impl Into<PathBuf>, strict_symlinks: bool) -> Self {
        let root = lexical_clean(&root.into());
        let canonical_root = std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        Self {
            root,
            canonical_root,
            strict_symlinks,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path from the command line against the root.
    /// Empty and `"."` both name the root itself.
    pub fn resolve(&self, raw: &str) -> Result<ResolvedPath> {
        self.resolve_from(&self.root, OsStr::new(raw))
    }

    /// Resolve a name relative to an already-resolved directory. Containment
    /// is still checked against the root, not against `base`.
    pub fn resolve_within(&self, base: &ResolvedPath, raw: impl AsRef<OsStr>) -> Result<ResolvedPath> {
        self.resolve_from(base.as_path(), raw.as_ref())
    }

    fn resolve_from(&self, base: &Path, raw: &OsStr) -> Result<ResolvedPath> {
        let raw = if raw.is_empty() || raw == OsStr::new(".") {
            OsStr::new("/")
        } else {
            raw
        };
        // Backslashes are treated as separators so `..\..\x` cannot smuggle
        // parent components past the normalizer.
        let rel = wire_path(raw)?;

        let mut out = base.to_path_buf();
        push_normalized(&mut out, &rel);

        if !out.starts_with(&self.root) {
            return Err(RcpError::PathEscape { path: out });
        }
        if self.strict_symlinks {
            self.confine_symlinks(&out)?;
        }
        Ok(ResolvedPath(out))
    }

    fn confine_symlinks(&self, p: &Path) -> Result<()> {
        let mut cursor = p;
        loop {
            match std::fs::canonicalize(cursor) {
                Ok(canon) => {
                    if canon.starts_with(&self.canonical_root) {
                        return Ok(());
                    }
                    return Err(RcpError::PathEscape { path: canon });
                }
                Err(_) => {
                    // A dangling link would be followed by create(); refuse it
                    if let Ok(md) = std::fs::symlink_metadata(cursor) {
                        if md.file_type().is_symlink() {
                            return Err(RcpError::PathEscape {
                                path: cursor.to_path_buf(),
                            });
                        }
                    }
                    match cursor.parent() {
                        Some(parent) => cursor = parent,
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

/// Rewrite backslashes to `/`, refusing embedded NULs.
#[cfg(unix)]
fn wire_path(raw: &OsStr) -> Result<PathBuf> {
    use std::os::unix::ffi::{OsStrExt, OsStringExt};

    let bytes = raw.as_bytes();
    if bytes.contains(&0) {
        return Err(nul_escape(raw));
    }
    let bytes = bytes
        .iter()
        .map(|&b| if b == b'\\' { b'/' } else { b })
        .collect();
    Ok(PathBuf::from(OsString::from_vec(bytes)))
}

#[cfg(not(unix))]
fn wire_path(raw: &OsStr) -> Result<PathBuf> {
    let text = raw.to_string_lossy();
    if text.contains('\0') {
        return Err(nul_escape(raw));
    }
    Ok(PathBuf::from(OsString::from(text.replace('\\', "/"))))
}

fn nul_escape(raw: &OsStr) -> RcpError {
    RcpError::PathEscape {
        path: PathBuf::from(raw.to_string_lossy().replace('\0', "\\0")),
    }
}

/// Append `rel` to `out`, collapsing `.` and `..` without touching the
/// filesystem. Absolute components in `rel` are re-rooted under `out`.
fn push_normalized(out: &mut PathBuf, rel: &Path) {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    for comp in rel.components() {
        match comp {
            CurDir | RootDir | Prefix(_) => {}
            ParentDir => {
                out.pop();
            }
            Normal(s) => out.push(s),
        }
    }
}

fn lexical_clean(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
