//! Small process-environment helpers.

use std::env;
use std::path::PathBuf;

/// Current working directory, preferring the `PWD` environment variable.
///
/// Shells keep the logical (symlink-preserving) path in `PWD`; it is used
/// when it names the same inode as the physical current directory, so
/// child processes see the path the user typed.
pub fn getcwd() -> PathBuf {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if let Ok(pwd) = env::var("PWD") {
        use std::os::unix::fs::MetadataExt;
        if let (Ok(a), Ok(b)) = (std::fs::metadata(&pwd), std::fs::metadata(&cwd)) {
            if a.ino() == b.ino() && a.dev() == b.dev() {
                return PathBuf::from(pwd);
            }
        }
    }
    cwd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getcwd_returns_an_existing_directory() {
        assert!(getcwd().is_dir());
    }

    #[test]
    fn getcwd_ignores_unrelated_pwd() {
        let tmp = tempfile::tempdir().unwrap();
        let real = env::current_dir().unwrap();
        env::set_var("PWD", tmp.path());
        let resolved = getcwd();
        env::remove_var("PWD");
        assert_eq!(resolved, real);
    }
}
