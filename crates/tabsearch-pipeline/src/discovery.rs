//! Input file discovery
//!
//! Walks the input directory, keeps files with a recognized extension, and
//! orders them by size ascending so small files surface failures early. A
//! file whose name is already recorded as ingested is skipped without looking
//! at its content: reprocessing requires deleting its ingestion record.

use crate::error::{PipelineError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Parser strategy for an input file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Delimited text with a header row
    Delimited,
    /// MediaWiki XML export
    WikiXml,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(SourceFormat::Delimited),
            "xml" => Some(SourceFormat::WikiXml),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceFormat::Delimited => f.write_str("delimited"),
            SourceFormat::WikiXml => f.write_str("wiki-xml"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Base name, the dedup identity of the file
    pub file_name: String,
    pub size: u64,
    pub format: SourceFormat,
    /// Position in the size-ordered list of all candidates, used in item names
    pub index: usize,
}

impl SourceFile {
    pub fn stem(&self) -> &str {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.file_name)
    }
}

#[derive(Debug, Default)]
pub struct Discovery {
    /// Files still to ingest, ascending by size
    pub pending: Vec<SourceFile>,
    /// Names skipped because they were already ingested
    pub skipped: Vec<String>,
    /// Files that could not be inspected, with the reason
    pub unreadable: Vec<(PathBuf, String)>,
}

/// Scan `root` recursively for input files not yet in `ingested`.
pub fn discover(root: &Path, ingested: &HashSet<String>) -> Result<Discovery> {
    if !root.is_dir() {
        return Err(PipelineError::NotFound(format!(
            "input directory {}",
            root.display()
        )));
    }

    let mut discovery = Discovery::default();
    let mut candidates = Vec::new();

    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                discovery.unreadable.push((path, e.to_string()));
                continue;
            },
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(format) = SourceFormat::from_path(entry.path()) else {
            continue;
        };
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            warn!(path = %entry.path().display(), "Skipping file with non UTF-8 name");
            discovery
                .unreadable
                .push((entry.path().to_path_buf(), "file name is not UTF-8".to_string()));
            continue;
        };

        // Metadata alone does not prove we can read the file
        let checked = entry
            .metadata()
            .map_err(|e| e.to_string())
            .and_then(|m| {
                std::fs::File::open(entry.path())
                    .map(|_| m.len())
                    .map_err(|e| e.to_string())
            });
        match checked {
            Ok(size) => candidates.push((entry.into_path(), file_name, size, format)),
            Err(reason) => {
                warn!(path = %entry.path().display(), error = %reason, "Skipping unreadable file");
                discovery.unreadable.push((entry.path().to_path_buf(), reason));
            },
        }
    }

    candidates.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

    for (index, (path, file_name, size, format)) in candidates.into_iter().enumerate() {
        if ingested.contains(&file_name) {
            debug!(file = %file_name, "Already ingested, skipping");
            discovery.skipped.push(file_name);
            continue;
        }
        discovery.pending.push(SourceFile {
            path,
            file_name,
            size,
            format,
            index,
        });
    }

    Ok(discovery)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, bytes: usize) {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![b'x'; bytes]).unwrap();
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(SourceFormat::from_path(Path::new("a/b.CSV")), Some(SourceFormat::Delimited));
        assert_eq!(SourceFormat::from_path(Path::new("dump.xml")), Some(SourceFormat::WikiXml));
        assert_eq!(SourceFormat::from_path(Path::new("notes.txt")), None);
        assert_eq!(SourceFormat::from_path(Path::new("README")), None);
    }

    #[test]
    fn test_discover_orders_by_size_and_recurses() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "big.csv", 300);
        write(dir.path(), "nested/deeper/small.csv", 10);
        write(dir.path(), "mid.xml", 100);
        write(dir.path(), "ignored.txt", 1);

        let found = discover(dir.path(), &HashSet::new()).unwrap();
        let names: Vec<&str> = found.pending.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["small.csv", "mid.xml", "big.csv"]);
        assert_eq!(found.pending[1].format, SourceFormat::WikiXml);
        assert_eq!(found.pending[2].size, 300);
        assert_eq!(found.pending[0].stem(), "small");
    }

    #[test]
    fn test_discover_skips_ingested_names_but_keeps_positions() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.csv", 1);
        write(dir.path(), "b.csv", 2);
        write(dir.path(), "c.csv", 3);

        let ingested: HashSet<String> = ["b.csv".to_string()].into_iter().collect();
        let found = discover(dir.path(), &ingested).unwrap();

        assert_eq!(found.skipped, vec!["b.csv"]);
        let indexed: Vec<(&str, usize)> = found
            .pending
            .iter()
            .map(|f| (f.file_name.as_str(), f.index))
            .collect();
        assert_eq!(indexed, vec![("a.csv", 0), ("c.csv", 2)]);
    }

    #[test]
    fn test_discover_same_name_in_other_directory_is_skipped() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "2023/report.csv", 5);
        let ingested: HashSet<String> = ["report.csv".to_string()].into_iter().collect();

        let found = discover(dir.path(), &ingested).unwrap();
        assert!(found.pending.is_empty());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            discover(&missing, &HashSet::new()),
            Err(PipelineError::NotFound(_))
        ));
    }
}
