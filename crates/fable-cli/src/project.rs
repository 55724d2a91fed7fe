use anyhow::{Result, anyhow};
use fable_config::ForgeConfig;
use std::path::{Path, PathBuf};

pub(crate) fn determine_project_root(cd: Option<&str>) -> Result<PathBuf> {
    let path = if let Some(cd_path) = cd {
        PathBuf::from(cd_path)
    } else {
        std::env::current_dir()?
    };

    Ok(path.canonicalize()?)
}

/// Resolve `path` against the project root unless it is absolute.
pub(crate) fn resolve(project_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    }
}

/// Load the explicit config file, or `.fable/config.toml` under the root.
pub(crate) fn load_config(project_root: &Path, explicit: Option<&Path>) -> Result<ForgeConfig> {
    match explicit {
        Some(path) => ForgeConfig::load(&resolve(project_root, path)),
        None => ForgeConfig::load_from_root(project_root)?.ok_or_else(|| {
            anyhow!(
                "No configuration found at {}. Pass --config or create it.",
                ForgeConfig::default_path(project_root).display()
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn determine_project_root_with_valid_path() {
        let tmp = tempfile::tempdir().unwrap();
        let result = determine_project_root(Some(tmp.path().to_str().unwrap())).unwrap();
        assert_eq!(result, tmp.path().canonicalize().unwrap());
    }

    #[test]
    fn determine_project_root_nonexistent_path_errors() {
        assert!(determine_project_root(Some("/nonexistent/path/12345")).is_err());
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let root = Path::new("/project");
        assert_eq!(
            resolve(root, Path::new("/tmp/tasks.toml")),
            PathBuf::from("/tmp/tasks.toml")
        );
        assert_eq!(
            resolve(root, Path::new("tasks.toml")),
            PathBuf::from("/project/tasks.toml")
        );
    }

    #[test]
    fn load_config_missing_default_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load_config(tmp.path(), None).unwrap_err();
        assert!(err.to_string().contains("No configuration found"));
    }

    #[test]
    fn load_config_explicit_relative_path() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("alt.toml"), "[run]\nworkers = 7\n").unwrap();
        let config = load_config(tmp.path(), Some(Path::new("alt.toml"))).unwrap();
        assert_eq!(config.run.workers, 7);
    }
}
