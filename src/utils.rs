//! Directory lookup and binary discovery
//!
//! Configuration follows the XDG Base Directory specification:
//!
//! - Config: `~/.config/chainwarden/config.json`
//!
//! # Example
//!
//! ```
//! use chainwarden::utils::{find_binary, get_config_dir};
//!
//! if let Some(dir) = get_config_dir() {
//!     println!("config lives in {}", dir.display());
//! }
//! assert!(find_binary("sh").is_some());
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

pub const CONFIG_FILE_NAME: &str = "config.json";

pub fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "chainwarden", "chainwarden").map(|pd| pd.config_dir().to_path_buf())
}

/// Default configuration file location
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Full path of `name` in `PATH`, also searching the sbin directories
/// where iptables usually lives but which are often missing from a user's
/// `PATH`.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    let path_dirs = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
        .unwrap_or_default();

    path_dirs
        .into_iter()
        .chain(["/usr/sbin", "/sbin", "/usr/local/sbin"].into_iter().map(PathBuf::from))
        .map(|dir| dir.join(name))
        .find(|full_path| full_path.is_file())
}

/// Checks if a binary exists in PATH
pub fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .is_some_and(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_exists() {
        // sh should exist on all Unix systems
        assert!(binary_exists("sh"));
        assert!(!binary_exists("chainwarden_nonexistent_binary_xyz"));
    }

    #[test]
    fn test_find_binary() {
        let sh = find_binary("sh").unwrap();
        assert!(sh.ends_with("sh"));
        assert!(find_binary("chainwarden_nonexistent_binary_xyz").is_none());
    }

    #[test]
    fn test_default_config_path_file_name() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with(CONFIG_FILE_NAME));
        }
    }
}
