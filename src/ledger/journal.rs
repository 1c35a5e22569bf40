//! Append-only JSONL journal files backing the ledger store.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{LedgerError, Result};

pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Open (creating if needed) a journal for appending
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        create_parent(&path)?;
        let file = open_append(&path)?;
        Ok(Self { path, file })
    }

    /// Open a journal for appending after cutting it back to `valid_len`,
    /// the end of its last well-formed line as reported by [`replay`].
    ///
    /// A final entry that parsed but lost its newline gets one back, so the
    /// next append starts on a fresh line.
    pub fn recover(path: impl Into<PathBuf>, valid_len: u64) -> Result<Self> {
        let path = path.into();
        create_parent(&path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                LedgerError::Journal(format!("Failed to open journal {}: {}", path.display(), e))
            })?;

        let len = file.metadata()?.len();
        if len > valid_len {
            warn!(
                "Truncating {} from {} to {} bytes to drop a torn tail",
                path.display(),
                len,
                valid_len
            );
            file.set_len(valid_len)?;
        }
        if valid_len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(valid_len - 1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                file.seek(SeekFrom::End(0))?;
                file.write_all(b"\n")?;
            }
        }
        file.sync_all()?;

        let file = open_append(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size in bytes
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Write one line and make it durable before returning.
    ///
    /// On failure the file is cut back to its previous length so a partial
    /// line never precedes later entries.
    pub fn append<T: Serialize>(&mut self, item: &T) -> Result<()> {
        let mut line = serde_json::to_vec(item)?;
        line.push(b'\n');

        let offset = self.file.metadata()?.len();
        let written = self
            .file
            .write_all(&line)
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_data());

        if let Err(e) = written {
            if let Err(trunc_err) = self.file.set_len(offset) {
                warn!(
                    "Failed to roll back partial write to {}: {}",
                    self.path.display(),
                    trunc_err
                );
            }
            return Err(LedgerError::Journal(format!(
                "Failed to write journal line: {}",
                e
            )));
        }
        Ok(())
    }

    /// Swap a finished [`Rewrite`] in for this journal (rename over the
    /// live file) and keep appending to the new contents.
    pub fn install(&mut self, rewrite: Rewrite) -> Result<()> {
        let Rewrite {
            tmp_path,
            mut file,
            entries,
        } = rewrite;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        self.file = open_append(&self.path)?;
        debug!(
            "Rewrote journal {} ({} entries)",
            self.path.display(),
            entries
        );
        Ok(())
    }

    /// Drop everything before byte `offset`, keeping the entries written
    /// after it. `offset` must sit on a line boundary.
    pub fn retain_from(&mut self, offset: u64) -> Result<()> {
        let mut kept = Vec::new();
        {
            let mut file = File::open(&self.path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.read_to_end(&mut kept)?;
        }

        let tmp_path = tmp_path_for(&self.path);
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&kept)?;
            tmp.flush()?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.file = open_append(&self.path)?;
        debug!(
            "Trimmed journal {} to {} bytes",
            self.path.display(),
            kept.len()
        );
        Ok(())
    }
}

/// Replacement contents for a journal, written beside it while the live
/// file keeps taking appends. Nothing is visible until [`Journal::install`].
pub struct Rewrite {
    tmp_path: PathBuf,
    file: File,
    entries: usize,
}

impl Rewrite {
    pub fn create(path: &Path) -> Result<Self> {
        create_parent(path)?;
        let tmp_path = tmp_path_for(path);
        let file = File::create(&tmp_path).map_err(|e| {
            LedgerError::Journal(format!(
                "Failed to create {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        Ok(Self {
            tmp_path,
            file,
            entries: 0,
        })
    }

    pub fn write<T: Serialize>(&mut self, item: &T) -> Result<()> {
        let mut line = serde_json::to_vec(item)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.entries += 1;
        Ok(())
    }

    pub fn entries(&self) -> usize {
        self.entries
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    path.with_extension("jsonl.tmp")
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            LedgerError::Journal(format!("Failed to create journal directory: {}", e))
        })?;
    }
    Ok(())
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LedgerError::Journal(format!("Failed to open journal {}: {}", path.display(), e)))
}

/// Entries read back from a journal
#[derive(Debug)]
pub struct Replay<T> {
    pub items: Vec<T>,
    /// Bytes covered by well-formed lines; anything past this is a torn write
    pub valid_len: u64,
    pub torn: bool,
}

/// Read every entry of a journal.
///
/// A final line that fails to parse is treated as a write torn by a crash
/// and dropped; `valid_len` then stops where that line begins. A malformed
/// line anywhere else is an error.
pub fn replay<T: DeserializeOwned>(path: &Path) -> Result<Replay<T>> {
    if !path.exists() {
        return Ok(Replay {
            items: Vec::new(),
            valid_len: 0,
            torn: false,
        });
    }

    let bytes = fs::read(path)
        .map_err(|e| LedgerError::Journal(format!("Failed to read journal: {}", e)))?;

    // (start, end, has_newline) per line
    let mut lines = Vec::new();
    let mut start = 0usize;
    while start < bytes.len() {
        match bytes[start..].iter().position(|b| *b == b'\n') {
            Some(i) => {
                lines.push((start, start + i, true));
                start += i + 1;
            }
            None => {
                lines.push((start, bytes.len(), false));
                start = bytes.len();
            }
        }
    }

    let is_blank = |&(start, end, _): &(usize, usize, bool)| {
        bytes[start..end].iter().all(u8::is_ascii_whitespace)
    };
    let last_content = lines.iter().rposition(|line| !is_blank(line));

    let mut items = Vec::with_capacity(lines.len());
    let mut valid_len = 0usize;
    let mut torn = false;

    for (line_num, line) in lines.iter().enumerate() {
        let (start, end, has_newline) = *line;
        let line_end = if has_newline { end + 1 } else { end };
        if is_blank(line) {
            if !torn {
                valid_len = line_end;
            }
            continue;
        }
        match serde_json::from_slice(&bytes[start..end]) {
            Ok(item) => {
                items.push(item);
                valid_len = line_end;
            }
            Err(e) if Some(line_num) == last_content => {
                warn!(
                    "Dropping torn final line {} of {}: {}",
                    line_num + 1,
                    path.display(),
                    e
                );
                torn = true;
            }
            Err(e) => {
                return Err(LedgerError::Journal(format!(
                    "Failed to parse {} line {}: {}",
                    path.display(),
                    line_num + 1,
                    e
                )))
            }
        }
    }

    Ok(Replay {
        items,
        valid_len: valid_len as u64,
        torn,
    })
}

/// Read every entry of a journal, dropping a torn final line
pub fn read_all<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    Ok(replay(path)?.items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        let mut journal = Journal::open(&path).unwrap();
        journal.append(&vec![1u32, 2]).unwrap();
        journal.append(&vec![3u32]).unwrap();

        let items: Vec<Vec<u32>> = read_all(&path).unwrap();
        assert_eq!(items, vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_torn_final_line_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        fs::write(&path, "[1]\n[2]\n[3,").unwrap();

        let replay: Replay<Vec<u32>> = replay(&path).unwrap();
        assert_eq!(replay.items, vec![vec![1], vec![2]]);
        assert!(replay.torn);
        assert_eq!(replay.valid_len, 8);
    }

    #[test]
    fn test_recover_cuts_torn_tail_before_appending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        fs::write(&path, "[1]\n[2]\n[3,").unwrap();

        let replay: Replay<Vec<u32>> = replay(&path).unwrap();
        let mut journal = Journal::recover(&path, replay.valid_len).unwrap();
        journal.append(&vec![4u32]).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "[1]\n[2]\n[4]\n");
        let items: Vec<Vec<u32>> = read_all(&path).unwrap();
        assert_eq!(items, vec![vec![1], vec![2], vec![4]]);
    }

    #[test]
    fn test_recover_restores_missing_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        fs::write(&path, "[1]\n[2]").unwrap();

        let replay: Replay<Vec<u32>> = replay(&path).unwrap();
        assert!(!replay.torn);
        assert_eq!(replay.items.len(), 2);

        let mut journal = Journal::recover(&path, replay.valid_len).unwrap();
        journal.append(&vec![3u32]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[1]\n[2]\n[3]\n");
    }

    #[test]
    fn test_malformed_middle_line_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        fs::write(&path, "[1]\nnot json\n[3]\n").unwrap();

        assert!(read_all::<Vec<u32>>(&path).is_err());
    }

    #[test]
    fn test_install_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        let mut journal = Journal::open(&path).unwrap();
        journal.append(&1u32).unwrap();

        let mut rewrite = Rewrite::create(&path).unwrap();
        rewrite.write(&7u32).unwrap();
        rewrite.write(&8u32).unwrap();
        assert_eq!(rewrite.entries(), 2);
        // Live journal is untouched until the swap
        assert_eq!(read_all::<u32>(&path).unwrap(), vec![1]);

        journal.install(rewrite).unwrap();
        journal.append(&9u32).unwrap();

        let items: Vec<u32> = read_all(&path).unwrap();
        assert_eq!(items, vec![7, 8, 9]);
    }

    #[test]
    fn test_retain_from_keeps_later_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        let mut journal = Journal::open(&path).unwrap();
        journal.append(&1u32).unwrap();
        journal.append(&2u32).unwrap();
        let mark = journal.len().unwrap();
        journal.append(&3u32).unwrap();

        journal.retain_from(mark).unwrap();
        journal.append(&4u32).unwrap();
        assert_eq!(read_all::<u32>(&path).unwrap(), vec![3, 4]);

        let end = journal.len().unwrap();
        journal.retain_from(end).unwrap();
        assert!(journal.is_empty().unwrap());
    }
}
