//! Run log files: `<prefix>_<YYYYmmdd_HHMMSS>.txt` in the log directory.

use chrono::NaiveDateTime;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const ARTIFACT_EXT: &str = "txt";

/// Path for a new artifact. A name already taken in `dir` gets a `_<n>` suffix.
pub fn artifact_path(dir: &Path, prefix: &str, started: NaiveDateTime) -> PathBuf {
    let stem = format!("{}_{}", sanitize_name(prefix), started.format("%Y%m%d_%H%M%S"));
    let mut path = dir.join(format!("{}.{}", stem, ARTIFACT_EXT));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{}_{}.{}", stem, n, ARTIFACT_EXT));
        n += 1;
    }
    path
}

/// Write the rendered log, creating the directory if needed
pub fn write_artifact(
    dir: &Path,
    prefix: &str,
    started: NaiveDateTime,
    text: &str,
) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = artifact_path(dir, prefix, started);
    fs::write(&path, text)?;
    Ok(path)
}

/// Run logs in `dir`, oldest first by name within a prefix
pub fn list_artifacts(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut artifacts = Vec::new();
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == ARTIFACT_EXT) {
                artifacts.push(path);
            }
        }
    }
    artifacts.sort();
    Ok(artifacts)
}

/// Most recently modified run log in `dir`
pub fn latest_artifact(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for path in list_artifacts(dir)? {
        let modified = fs::metadata(&path)?.modified()?;
        if newest.as_ref().is_none_or(|(t, _)| modified >= *t) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, p)| p))
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn started() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(9, 3, 7)
            .unwrap()
    }

    #[test]
    fn test_artifact_naming() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(dir.path(), "logacceptance", started(), "x").unwrap();
        assert!(path.ends_with("logacceptance_20240501_090307.txt"));

        let second = write_artifact(dir.path(), "logacceptance", started(), "y").unwrap();
        assert!(second.ends_with("logacceptance_20240501_090307_1.txt"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "x");
    }

    #[test]
    fn test_list_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_artifact(dir.path()).unwrap().is_none());

        write_artifact(dir.path(), "Regression", started(), "a").unwrap();
        fs::write(dir.path().join("notes.md"), "ignored").unwrap();
        let artifacts = list_artifacts(dir.path()).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(latest_artifact(dir.path()).unwrap(), Some(artifacts[0].clone()));
    }

    #[test]
    fn test_missing_dir_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_artifacts(&dir.path().join("absent")).unwrap().is_empty());
    }
}
