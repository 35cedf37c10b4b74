//! Java source discovery.

use std::path::{Path, PathBuf};

use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;

/// Check if a file is a Java source file.
pub fn is_java_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("java")
}

/// Find all Java files under `root`, sorted by path.
///
/// `exclude_dirs` are applied as overrides and win over ignore files.
/// With `respect_gitignore`, `.gitignore`, `.ignore` and the global git
/// excludes are honored, in git repositories and plain directories alike.
pub fn find_java_files(
    root: &Path,
    exclude_dirs: &[&str],
    respect_gitignore: bool,
) -> std::io::Result<Vec<PathBuf>> {
    if !root.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", root.display()),
        ));
    }
    if root.is_file() {
        return Ok(if is_java_file(root) {
            vec![root.to_path_buf()]
        } else {
            Vec::new()
        });
    }

    let mut override_builder = OverrideBuilder::new(root);
    for dir in exclude_dirs {
        // !dir/ means "do not include this directory"
        let pattern = format!("!{}/", dir);
        if let Err(e) = override_builder.add(&pattern) {
            tracing::warn!("Invalid exclude pattern '{}': {}", pattern, e);
        }
    }
    let overrides = override_builder.build().unwrap_or_else(|e| {
        tracing::warn!("Failed to build overrides: {}", e);
        Override::empty()
    });

    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(true)
        .git_ignore(respect_gitignore)
        .git_global(respect_gitignore)
        .git_exclude(respect_gitignore)
        .require_git(false)
        .ignore(respect_gitignore)
        .parents(respect_gitignore)
        .overrides(overrides);

    let mut files = Vec::new();
    for entry in builder.build() {
        match entry {
            Ok(entry) => {
                let path = entry.path();
                if path.is_file() && is_java_file(path) {
                    files.push(path.to_path_buf());
                }
            }
            Err(err) => {
                tracing::warn!("Error walking directory: {}", err);
            }
        }
    }
    files.sort();

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "class X {}").unwrap();
    }

    #[test]
    fn test_is_java_file() {
        assert!(is_java_file(Path::new("src/Main.java")));
        assert!(!is_java_file(Path::new("src/Main.kt")));
        assert!(!is_java_file(Path::new("Makefile")));
    }

    #[test]
    fn test_finds_java_files_and_skips_excluded_dirs() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "src/main/java/a/Movies.java");
        touch(temp.path(), "src/main/java/a/notes.txt");
        touch(temp.path(), "target/generated/Gen.java");

        let files = find_java_files(temp.path(), &["target"], true).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("Movies.java"));
    }

    #[test]
    fn test_respects_gitignore() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "src/Keep.java");
        touch(temp.path(), "legacy/Old.java");
        fs::write(temp.path().join(".gitignore"), "legacy/\n").unwrap();

        let files = find_java_files(temp.path(), &[], true).unwrap();
        assert_eq!(files.len(), 1);

        let all = find_java_files(temp.path(), &[], false).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_single_file_root() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "Only.java");
        let files = find_java_files(&temp.path().join("Only.java"), &[], true).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp = TempDir::new().unwrap();
        assert!(find_java_files(&temp.path().join("nope"), &[], true).is_err());
    }
}
