// src/infra/paths.rs — Data and config locations
//
// All paths respect the CHATHUB_HOME environment variable. When it is set,
// config and data live under that directory; otherwise config is read from
// ~/.chathub/ and data goes to the platform data dir.

use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;

fn chathub_home() -> Option<PathBuf> {
    std::env::var_os("CHATHUB_HOME").map(PathBuf::from)
}

/// Configuration directory: $CHATHUB_HOME/ or ~/.chathub/
pub fn config_dir() -> PathBuf {
    if let Some(home) = chathub_home() {
        return home;
    }
    match BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(".chathub"),
        None => PathBuf::from(".chathub"),
    }
}

/// Data directory: $CHATHUB_HOME/data/ or the XDG data dir.
pub fn data_dir() -> PathBuf {
    if let Some(home) = chathub_home() {
        return home.join("data");
    }
    match ProjectDirs::from("", "", "chathub") {
        Some(dirs) => dirs.data_local_dir().to_path_buf(),
        None => PathBuf::from("data"),
    }
}

pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn default_db_path() -> PathBuf {
    data_dir().join("chathub.db")
}

/// Resolve a configured path: absolute paths are kept, relative ones are
/// placed under the data directory.
pub fn resolve_data_path(configured: &str) -> PathBuf {
    let p = PathBuf::from(configured);
    if p.is_absolute() {
        p
    } else {
        data_dir().join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_path_kept() {
        let p = resolve_data_path("/var/lib/chathub/users.json");
        assert_eq!(p, PathBuf::from("/var/lib/chathub/users.json"));
    }

    #[test]
    fn test_relative_path_under_data_dir() {
        let p = resolve_data_path("users.json");
        assert!(p.ends_with("users.json"));
        assert!(p.starts_with(data_dir()));
    }
}
