//! Filesystem/network security checks consulted by stage 3 of the
//! pipeline. Grounded in the teacher's `utils/path_sanitize.rs` (workspace
//! containment check, regex-based absolute-path matching) generalized from
//! "redact a path for display" into "is this path allowed at all".

use std::path::{Path, PathBuf};

pub struct SecurityChecker {
    allowed_path_prefixes: Vec<PathBuf>,
    allowed_url_schemes: Vec<String>,
}

impl Default for SecurityChecker {
    fn default() -> Self {
        Self {
            allowed_path_prefixes: Vec::new(),
            allowed_url_schemes: vec!["https".into()],
        }
    }
}

impl SecurityChecker {
    pub fn new(allowed_path_prefixes: Vec<PathBuf>, allowed_url_schemes: Vec<String>) -> Self {
        Self {
            allowed_path_prefixes,
            allowed_url_schemes,
        }
    }

    /// Rejects paths outside the allow-list and paths that resolve (via a
    /// symlink) to somewhere outside it. An allow-list of zero entries
    /// permits any path — callers that care about filesystem tools must
    /// configure prefixes explicitly.
    pub fn check_path(&self, path: &Path) -> Result<(), String> {
        if self.allowed_path_prefixes.is_empty() {
            return Ok(());
        }

        let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let within_allow_list = self
            .allowed_path_prefixes
            .iter()
            .any(|prefix| resolved.starts_with(prefix));

        if !within_allow_list {
            return Err(format!(
                "path {} is outside the allowed prefixes",
                path.display()
            ));
        }

        if path.is_symlink() {
            let target = std::fs::read_link(path).unwrap_or_default();
            let target_within = self
                .allowed_path_prefixes
                .iter()
                .any(|prefix| target.starts_with(prefix));
            if !target_within {
                return Err(format!(
                    "{} is a symlink escaping the allowed prefixes",
                    path.display()
                ));
            }
        }

        Ok(())
    }

    pub fn check_url(&self, url: &str) -> Result<(), String> {
        let Some((scheme, _)) = url.split_once("://") else {
            return Err(format!("{url} has no scheme"));
        };
        if self.allowed_url_schemes.iter().any(|s| s == scheme) {
            Ok(())
        } else {
            Err(format!("protocol '{scheme}' is not in the allow-list"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_permits_any_path() {
        let checker = SecurityChecker::default();
        assert!(checker.check_path(Path::new("/etc/passwd")).is_ok());
    }

    #[test]
    fn path_outside_prefixes_is_rejected() {
        let checker = SecurityChecker::new(vec![PathBuf::from("/workspace")], vec![]);
        assert!(checker.check_path(Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn path_inside_prefixes_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "hi").unwrap();
        let checker = SecurityChecker::new(vec![dir.path().to_path_buf()], vec![]);
        assert!(checker.check_path(&file).is_ok());
    }

    #[test]
    fn disallowed_url_scheme_rejected() {
        let checker = SecurityChecker::default();
        assert!(checker.check_url("ftp://example.com/file").is_err());
        assert!(checker.check_url("https://example.com").is_ok());
    }
}
