//! Data directory resolution for the CLI.

use std::path::PathBuf;

use grouplog_core::GroupLogPaths;

/// `GROUPLOG_DATA_DIR` wins; otherwise the platform data directory.
pub fn resolve() -> GroupLogPaths {
    let platform = directories::ProjectDirs::from("dev", "grouplog", "grouplog")
        .map(|dirs| dirs.data_dir().to_path_buf());
    GroupLogPaths::from_env(platform)
}

pub fn display(path: &std::path::Path) -> String {
    match std::env::var_os("HOME").map(PathBuf::from) {
        Some(home) => match path.strip_prefix(&home) {
            Ok(rest) => format!("~/{}", rest.display()),
            Err(_) => path.display().to_string(),
        },
        None => path.display().to_string(),
    }
}
