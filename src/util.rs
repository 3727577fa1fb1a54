use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub fn get_mxf_home() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("MXF_HOME") {
        return Ok(PathBuf::from(home));
    }
    Ok(dirs::home_dir()
        .context("could not determine home directory")?
        .join(".mxf"))
}

pub fn ensure_dir(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mxf_home_respects_env_override() {
        unsafe {
            std::env::set_var("MXF_HOME", "/tmp/mxf-test-home");
        }
        let home = get_mxf_home().unwrap();
        assert_eq!(home, PathBuf::from("/tmp/mxf-test-home"));
        unsafe {
            std::env::remove_var("MXF_HOME");
        }
    }
}
