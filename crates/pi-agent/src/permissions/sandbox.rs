use std::path::{
    Component,
    Path,
    PathBuf,
};

use tracing::debug;

use crate::util::path::{
    is_within,
    normalize_path,
};

/// Directories that file writes may never touch, regardless of the allowed
/// set.
pub const SYSTEM_DIRS: &[&str] = &["/etc", "/usr", "/bin", "/sbin", "/boot", "/proc", "/sys"];

/// Raw byte sequences that indicate an encoded traversal attempt.
const ENCODED_TRAVERSAL_PATTERNS: &[&str] = &["%2e%2e", "%2f", "%5c", "%00", "\x00"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("Path contains a parent-directory component")]
    ParentTraversal,
    #[error("Path contains an encoded traversal sequence")]
    EncodedTraversal,
    #[error("Path resolves outside the allowed directories")]
    OutsideAllowedDirectories,
    #[error("Writes to system directories are not permitted")]
    SystemDirectory,
    #[error("Failed to resolve path: {}", .0)]
    Resolution(String),
}

/// Validates that file-tool paths stay inside an allowed directory set, with
/// symlinks resolved and directory boundaries respected.
#[derive(Debug, Clone)]
pub struct Sandbox {
    allowed_dirs: Vec<PathBuf>,
    cwd: PathBuf,
}

impl Sandbox {
    pub fn new(allowed_dirs: Vec<PathBuf>, cwd: PathBuf) -> Self {
        // Allowed directories are resolved up front so that containment
        // checks compare like with like.
        let allowed_dirs = allowed_dirs
            .iter()
            .map(|d| d.canonicalize().unwrap_or_else(|_| normalize_path(d)))
            .collect();
        Self { allowed_dirs, cwd }
    }

    pub fn allowed_dirs(&self) -> &[PathBuf] {
        &self.allowed_dirs
    }

    /// Validates `raw` for reading (`for_write = false`) or writing, returning
    /// the resolved absolute path on success.
    pub fn validate(&self, raw: &str, for_write: bool) -> Result<PathBuf, SandboxError> {
        // Literal `..` components are rejected before any resolution.
        let expanded = shellexpand::tilde(raw).to_string();
        if Path::new(&expanded).components().any(|c| c == Component::ParentDir) {
            return Err(SandboxError::ParentTraversal);
        }

        let lowered = raw.to_lowercase();
        if ENCODED_TRAVERSAL_PATTERNS.iter().any(|p| lowered.contains(p)) {
            return Err(SandboxError::EncodedTraversal);
        }

        let absolute = if Path::new(&expanded).is_absolute() {
            PathBuf::from(&expanded)
        } else {
            self.cwd.join(&expanded)
        };
        let resolved = self.resolve_symlinks(&absolute)?;

        if !self.allowed_dirs.iter().any(|dir| is_within(&resolved, dir)) {
            debug!(?resolved, "path is outside the allowed directory set");
            return Err(SandboxError::OutsideAllowedDirectories);
        }

        if for_write
            && SYSTEM_DIRS
                .iter()
                .any(|dir| is_within(&resolved, Path::new(dir)))
        {
            return Err(SandboxError::SystemDirectory);
        }

        Ok(resolved)
    }

    /// Resolves symlinks on the full path when it exists. When it does not yet
    /// exist (the write case), resolves the parent directory and appends the
    /// leaf.
    fn resolve_symlinks(&self, path: &Path) -> Result<PathBuf, SandboxError> {
        if path.exists() {
            return path
                .canonicalize()
                .map_err(|err| SandboxError::Resolution(err.to_string()));
        }

        let Some(file_name) = path.file_name() else {
            return Ok(normalize_path(path));
        };
        match path.parent() {
            Some(parent) if parent.exists() => parent
                .canonicalize()
                .map(|p| p.join(file_name))
                .map_err(|err| SandboxError::Resolution(err.to_string())),
            // Deeply nested write target: nothing to resolve yet, fall back to
            // the lexically normalized path.
            _ => Ok(normalize_path(path)),
        }
    }
}
