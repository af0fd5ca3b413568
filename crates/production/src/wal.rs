//! File-backed write-ahead log.
//!
//! Records are length-prefixed bincode encodings of
//! [`beacon_core::WalMessage`]. `write` buffers through the OS; `write_sync`
//! additionally fsyncs, which the router uses for self-generated messages
//! and the consensus core uses for the `EndHeight` marker. A torn final
//! record (crash mid-append) is tolerated on read and dropped.

use beacon_core::{Wal, WalMessage};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Append-only log file.
pub struct FileWal {
    path: PathBuf,
    file: File,
}

impl FileWal {
    /// Open (or create) the log at `path` for appending.
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "opened write-ahead log");
        Ok(FileWal { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every complete record in the log.
    ///
    /// Stops at the first torn or undecodable record: everything before it
    /// is durable, everything after it never fully hit the disk.
    pub fn read_entries<P: AsRef<Path>>(path: P) -> std::io::Result<Vec<WalMessage>> {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut payload = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut payload) {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    warn!("dropping torn record at the end of the WAL");
                    break;
                }
                return Err(e);
            }
            match bincode::deserialize::<WalMessage>(&payload) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!("dropping undecodable WAL record: {e}");
                    break;
                }
            }
        }
        debug!(entries = entries.len(), "read WAL");
        Ok(entries)
    }

    fn append(&mut self, msg: &WalMessage) -> std::io::Result<()> {
        let payload =
            bincode::serialize(msg).map_err(|e| std::io::Error::other(e.to_string()))?;
        let len = (payload.len() as u32).to_le_bytes();
        self.file.write_all(&len)?;
        self.file.write_all(&payload)?;
        Ok(())
    }
}

impl Wal for FileWal {
    fn write(&mut self, msg: &WalMessage) -> std::io::Result<()> {
        self.append(msg)
    }

    fn write_sync(&mut self, msg: &WalMessage) -> std::io::Result<()> {
        self.append(msg)?;
        self.file.sync_data()
    }

    fn flush_and_sync(&mut self) -> std::io::Result<()> {
        self.file.sync_data()
    }
}

/// The index of the entry after the last `EndHeight` marker (the replay
/// starting point), and the height that marker recorded.
pub fn replay_start(entries: &[WalMessage]) -> (usize, Option<u64>) {
    let mut start = 0;
    let mut height = None;
    for (idx, entry) in entries.iter().enumerate() {
        if let WalMessage::EndHeight { height: h } = entry {
            start = idx + 1;
            height = Some(*h);
        }
    }
    (start, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::TimeoutInfo;
    use beacon_core::{Step, WalMessage};
    use std::time::Duration;

    fn timeout_entry(height: u64) -> WalMessage {
        WalMessage::Timeout(TimeoutInfo {
            duration: Duration::from_millis(10),
            height,
            round: 0,
            step: Step::Propose,
        })
    }

    #[test]
    fn roundtrip_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cs.wal");
        {
            let mut wal = FileWal::open(&path).unwrap();
            wal.write(&timeout_entry(1)).unwrap();
            wal.write_sync(&WalMessage::EndHeight { height: 1 }).unwrap();
            wal.write(&timeout_entry(2)).unwrap();
        }
        let entries = FileWal::read_entries(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1], WalMessage::EndHeight { height: 1 });

        let (start, height) = replay_start(&entries);
        assert_eq!(start, 2);
        assert_eq!(height, Some(1));
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cs.wal");
        {
            let mut wal = FileWal::open(&path).unwrap();
            wal.write_sync(&timeout_entry(1)).unwrap();
        }
        // Simulate a crash mid-append: a length prefix with half a payload.
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(&[0xab; 10]).unwrap();
        }
        let entries = FileWal::read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entries = FileWal::read_entries(dir.path().join("nope.wal")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn replay_start_with_no_marker() {
        let entries = vec![timeout_entry(1), timeout_entry(1)];
        let (start, height) = replay_start(&entries);
        assert_eq!(start, 0);
        assert_eq!(height, None);
    }
}
