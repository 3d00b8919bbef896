//! # Git Snapshot Provider
//!
//! Reads snapshots from a bare or non-bare git repository by driving the
//! `git` command line. Commits are the snapshot ids; blob object ids are
//! the blob handles.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use super::errors::{SnapshotError, SnapshotResult};
use super::{BlobRef, ContentStream, EntryIter, SnapshotId, SnapshotProvider, TreeEntry};

/// `git rev-parse --verify --quiet` exit status for a missing reference
const REV_PARSE_NOT_FOUND: i32 = 1;

/// Snapshot provider backed by the `git` executable
#[derive(Debug, Clone)]
pub struct GitCliProvider {
    git_dir: PathBuf,
    git_binary: PathBuf,
}

impl GitCliProvider {
    /// Open the repository whose git directory is `git_dir`
    pub fn new(git_dir: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
            git_binary: PathBuf::from("git"),
        }
    }

    /// Use a specific git executable
    pub fn with_binary(mut self, git_binary: impl Into<PathBuf>) -> Self {
        self.git_binary = git_binary.into();
        self
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    fn run(&self, args: &[&str]) -> SnapshotResult<Output> {
        let output = Command::new(&self.git_binary)
            .arg("--git-dir")
            .arg(&self.git_dir)
            .args(args)
            .output()?;
        Ok(output)
    }

    fn run_checked(&self, args: &[&str]) -> SnapshotResult<Vec<u8>> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(git_failure(args, &output));
        }
        Ok(output.stdout)
    }
}

fn git_failure(args: &[&str], output: &Output) -> SnapshotError {
    SnapshotError::Git {
        command: args.join(" "),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

impl SnapshotProvider for GitCliProvider {
    fn resolve(&self, reference: &str) -> SnapshotResult<Option<SnapshotId>> {
        let revision = format!("{}^{{commit}}", reference);
        let args = ["rev-parse", "--verify", "--quiet", revision.as_str()];
        let output = self.run(&args)?;

        if output.status.code() == Some(REV_PARSE_NOT_FOUND) {
            return Ok(None);
        }
        if !output.status.success() {
            return Err(git_failure(&args, &output));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Ok(None);
        }
        Ok(Some(SnapshotId::new(id)))
    }

    fn entries(&self, snapshot: &SnapshotId) -> SnapshotResult<EntryIter<'_>> {
        let listing = self.run_checked(&["ls-tree", "-r", "-z", "--full-tree", snapshot.as_str()])?;
        Ok(Box::new(LsTreeRecords::new(listing)))
    }

    fn open_blob(&self, blob: &BlobRef) -> SnapshotResult<ContentStream> {
        let bytes = self.run_checked(&["cat-file", "blob", blob.as_str()])?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn name(&self) -> &'static str {
        "git"
    }
}

/// Iterator over the NUL-terminated records of `git ls-tree -z`.
///
/// Each record reads `<mode> SP <type> SP <object> TAB <path>`. Only
/// `blob` records are yielded; submodule commits and trees are skipped.
pub struct LsTreeRecords {
    listing: Vec<u8>,
    pos: usize,
}

impl LsTreeRecords {
    pub fn new(listing: Vec<u8>) -> Self {
        Self { listing, pos: 0 }
    }

    fn next_record(&mut self) -> Option<&[u8]> {
        while self.pos < self.listing.len() {
            let rest = &self.listing[self.pos..];
            let len = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
            let start = self.pos;
            self.pos += len + 1;
            if len > 0 {
                return Some(&self.listing[start..start + len]);
            }
        }
        None
    }
}

fn parse_record(record: &[u8]) -> SnapshotResult<Option<TreeEntry>> {
    let malformed = || SnapshotError::MalformedListing(String::from_utf8_lossy(record).into_owned());

    let tab = record.iter().position(|b| *b == b'\t').ok_or_else(malformed)?;
    let header = std::str::from_utf8(&record[..tab]).map_err(|_| malformed())?;
    let path = std::str::from_utf8(&record[tab + 1..]).map_err(|_| malformed())?;

    let mut fields = header.split(' ');
    let (_mode, kind, object) = match (fields.next(), fields.next(), fields.next()) {
        (Some(mode), Some(kind), Some(object)) => (mode, kind, object),
        _ => return Err(malformed()),
    };

    if kind != "blob" {
        return Ok(None);
    }
    Ok(Some(TreeEntry::new(path, BlobRef::new(object))))
}

impl Iterator for LsTreeRecords {
    type Item = SnapshotResult<TreeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = self.next_record()?;
            match parse_record(record) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(records: &[&str]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for record in records {
            bytes.extend_from_slice(record.as_bytes());
            bytes.push(0);
        }
        bytes
    }

    #[test]
    fn test_parse_blobs() {
        let entries: Vec<_> = LsTreeRecords::new(listing(&[
            "100644 blob 3b18e512dba79e4c8300dd08aeb37f8e728b8dad\tindex.html",
            "100644 blob 8baef1b4abc478178b004d62031cf7fe6db6f903\tdocs/read me.txt",
        ]))
        .collect::<SnapshotResult<_>>()
        .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "index.html");
        assert_eq!(entries[1].path, "docs/read me.txt");
        assert_eq!(
            entries[1].blob.as_str(),
            "8baef1b4abc478178b004d62031cf7fe6db6f903"
        );
    }

    #[test]
    fn test_skips_submodules() {
        let entries: Vec<_> = LsTreeRecords::new(listing(&[
            "160000 commit 0f3c1a2b9f1e8d7c6b5a4f3e2d1c0b9a8f7e6d5c\tvendor/lib",
            "100644 blob 3b18e512dba79e4c8300dd08aeb37f8e728b8dad\ta.txt",
        ]))
        .collect::<SnapshotResult<_>>()
        .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "a.txt");
    }

    #[test]
    fn test_malformed_record() {
        let mut records = LsTreeRecords::new(listing(&["garbage without tab"]));
        assert!(matches!(
            records.next(),
            Some(Err(SnapshotError::MalformedListing(_)))
        ));
    }

    #[test]
    fn test_empty_listing() {
        assert_eq!(LsTreeRecords::new(Vec::new()).count(), 0);
    }

    #[test]
    fn test_missing_git_binary_is_io_error() {
        let provider =
            GitCliProvider::new("/nonexistent/repo.git").with_binary("/nonexistent/git-binary");
        assert!(matches!(provider.resolve("HEAD"), Err(SnapshotError::Io(_))));
    }
}
