//! Snapshot files.
//!
//! A snapshot at base path `b` is stored as two `;`-separated text files:
//!
//! ```text
//! b.snapshot.state          b.snapshot.meta
//! <address hex>;<balance>   <hash hex>
//! ...                       <index>
//!                           <timestamp>
//!                           <solid entry point count>
//!                           <seen round count>
//!                           <hash hex>;<index>           (solid entry points)
//!                           <index>;<hash hex>;...       (seen rounds)
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tangle_types::{Hash, Snapshot, SnapshotMetaData, SnapshotState};

use crate::error::SnapshotError;

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

pub fn state_path(base: &Path) -> PathBuf {
    with_suffix(base, ".snapshot.state")
}

pub fn meta_path(base: &Path) -> PathBuf {
    with_suffix(base, ".snapshot.meta")
}

/// Whether both files of the snapshot at `base` exist.
pub fn exists(base: &Path) -> bool {
    state_path(base).is_file() && meta_path(base).is_file()
}

pub fn read_snapshot(base: &Path) -> Result<Snapshot, SnapshotError> {
    let state = read_state(&state_path(base))?;
    let metadata = read_meta(&meta_path(base))?;
    Ok(Snapshot::new(state, metadata))
}

/// Write both files. The metadata's `initial_*` fields are not persisted;
/// a snapshot read back is its own initial snapshot.
pub fn write_snapshot(snapshot: &Snapshot, base: &Path) -> Result<(), SnapshotError> {
    if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| SnapshotError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    write_file(&state_path(base), &render_state(&snapshot.state))?;
    write_file(&meta_path(base), &render_meta(&snapshot.metadata))
}

fn write_file(path: &Path, contents: &str) -> Result<(), SnapshotError> {
    fs::write(path, contents).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_file(path: &Path) -> Result<String, SnapshotError> {
    fs::read_to_string(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn render_state(state: &SnapshotState) -> String {
    let mut balances: Vec<_> = state.balances().iter().collect();
    balances.sort();
    balances
        .into_iter()
        .map(|(address, balance)| format!("{address};{balance}\n"))
        .collect()
}

fn render_meta(metadata: &SnapshotMetaData) -> String {
    let mut out = format!(
        "{}\n{}\n{}\n{}\n{}\n",
        metadata.hash,
        metadata.index,
        metadata.timestamp,
        metadata.solid_entry_points.len(),
        metadata.seen_rounds.len()
    );
    let mut entry_points: Vec<_> = metadata.solid_entry_points.iter().collect();
    entry_points.sort();
    for (hash, index) in entry_points {
        out.push_str(&format!("{hash};{index}\n"));
    }
    let mut seen: Vec<_> = metadata.seen_rounds.iter().collect();
    seen.sort();
    for (index, hashes) in seen {
        out.push_str(&index.to_string());
        for hash in hashes {
            out.push(';');
            out.push_str(&hash.to_hex());
        }
        out.push('\n');
    }
    out
}

struct Lines<'a> {
    path: &'a Path,
    inner: std::str::Lines<'a>,
    consumed: usize,
}

impl<'a> Lines<'a> {
    fn new(path: &'a Path, contents: &'a str) -> Self {
        Self {
            path,
            inner: contents.lines(),
            consumed: 0,
        }
    }

    fn error(&self, line: usize, reason: impl Into<String>) -> SnapshotError {
        SnapshotError::Parse {
            path: self.path.to_path_buf(),
            line: line + 1,
            reason: reason.into(),
        }
    }

    /// Next line with its zero-based number.
    fn next_line(&mut self) -> Result<(usize, &'a str), SnapshotError> {
        let line = self.consumed;
        match self.inner.next() {
            Some(text) => {
                self.consumed += 1;
                Ok((line, text))
            }
            None => Err(self.error(line, "unexpected end of file")),
        }
    }

    fn hash(&self, line: usize, field: &str) -> Result<Hash, SnapshotError> {
        Hash::from_hex(field.trim()).map_err(|e| self.error(line, e.to_string()))
    }

    fn number<T: std::str::FromStr>(&self, line: usize, field: &str) -> Result<T, SnapshotError>
    where
        T::Err: std::fmt::Display,
    {
        field
            .trim()
            .parse()
            .map_err(|e: T::Err| self.error(line, e.to_string()))
    }
}

fn read_state(path: &Path) -> Result<SnapshotState, SnapshotError> {
    let contents = read_file(path)?;
    let lines = Lines::new(path, &contents);
    let mut balances = HashMap::new();
    for (line, text) in contents.lines().enumerate() {
        if text.trim().is_empty() {
            continue;
        }
        let Some((address, balance)) = text.split_once(';') else {
            return Err(lines.error(line, "expected <address>;<balance>"));
        };
        balances.insert(lines.hash(line, address)?, lines.number(line, balance)?);
    }
    let state = SnapshotState::new(balances);
    if !state.is_consistent() {
        return Err(SnapshotError::InconsistentState(0));
    }
    if !state.has_correct_supply() {
        return Err(SnapshotError::IncorrectSupply);
    }
    Ok(state)
}

fn read_meta(path: &Path) -> Result<SnapshotMetaData, SnapshotError> {
    let contents = read_file(path)?;
    let mut lines = Lines::new(path, &contents);

    let (n, text) = lines.next_line()?;
    let hash = lines.hash(n, text)?;
    let (n, text) = lines.next_line()?;
    let index = lines.number(n, text)?;
    let (n, text) = lines.next_line()?;
    let timestamp = lines.number(n, text)?;
    let (n, text) = lines.next_line()?;
    let entry_point_count: usize = lines.number(n, text)?;
    let (n, text) = lines.next_line()?;
    let seen_count: usize = lines.number(n, text)?;

    let mut metadata = SnapshotMetaData::new(hash, index, timestamp);
    for _ in 0..entry_point_count {
        let (n, text) = lines.next_line()?;
        let Some((hash, index)) = text.split_once(';') else {
            return Err(lines.error(n, "expected <hash>;<index>"));
        };
        metadata
            .solid_entry_points
            .insert(lines.hash(n, hash)?, lines.number(n, index)?);
    }
    for _ in 0..seen_count {
        let (n, text) = lines.next_line()?;
        let mut fields = text.split(';');
        let index = lines.number(n, fields.next().unwrap_or_default())?;
        let hashes = fields
            .map(|field| lines.hash(n, field))
            .collect::<Result<Vec<_>, _>>()?;
        metadata.seen_rounds.insert(index, hashes);
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangle_types::SUPPLY;

    fn snapshot() -> Snapshot {
        let state = SnapshotState::new(
            [(Hash::new([1; 32]), SUPPLY - 10), (Hash::new([2; 32]), 10)].into(),
        );
        let mut metadata = SnapshotMetaData::new(Hash::new([9; 32]), 42, 1_600_000_000);
        metadata.solid_entry_points.insert(Hash::NULL, 42);
        metadata.solid_entry_points.insert(Hash::new([3; 32]), 40);
        metadata
            .seen_rounds
            .insert(43, vec![Hash::new([4; 32]), Hash::new([5; 32])]);
        metadata.seen_rounds.insert(44, Vec::new());
        Snapshot::new(state, metadata)
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("nested").join("local");
        let original = snapshot();

        assert!(!exists(&base));
        write_snapshot(&original, &base).unwrap();
        assert!(exists(&base));
        assert!(state_path(&base).ends_with("local.snapshot.state"));

        let loaded = read_snapshot(&base).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_wrong_supply_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("s");
        let mut bad = snapshot();
        bad.state = SnapshotState::new([(Hash::new([1; 32]), 5)].into());
        write_snapshot(&bad, &base).unwrap();
        assert!(matches!(
            read_snapshot(&base),
            Err(SnapshotError::IncorrectSupply)
        ));
    }

    #[test]
    fn test_parse_error_names_line() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("s");
        write_snapshot(&snapshot(), &base).unwrap();
        fs::write(meta_path(&base), "zz\n1\n").unwrap();
        match read_snapshot(&base) {
            Err(SnapshotError::Parse { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_snapshot(&dir.path().join("absent")),
            Err(SnapshotError::Io { .. })
        ));
    }
}
