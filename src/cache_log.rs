use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

use crate::cache::{CacheBackend, CacheRow};
use crate::model::CacheKey;
use crate::store::SourceError;

/// Written once, when the log file is first used.
const HEADER: &[u8; 8] = b"SLOTDC01";

/// Encode a single row to [len][bincode][crc32] format.
fn encode_row(writer: &mut impl Write, row: &CacheRow) -> io::Result<()> {
    let payload =
        bincode::serialize(row).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only log of cache row upserts.
///
/// Format: `HEADER` then per row `[u32: len][bincode: CacheRow][u32: crc32]`.
/// The last record for a key wins on replay. A truncated or corrupt tail is
/// discarded.
pub struct CacheLog {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl CacheLog {
    /// Open (or create) the log at `path`, writing the header if the file is empty.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let empty = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if empty {
            writer.write_all(HEADER)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append one row and fsync.
    pub fn append(&mut self, row: &CacheRow) -> io::Result<()> {
        encode_row(&mut self.writer, row)?;
        self.appends_since_compact += 1;
        self.flush_sync()
    }

    fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as exactly `rows`: temp file, fsync, atomic rename.
    pub fn compact(&mut self, rows: &[CacheRow]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("log.tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(HEADER)?;
            for row in rows {
                encode_row(&mut writer, row)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replay the log from disk, returning every valid row in write order.
    pub fn replay(path: &Path) -> io::Result<Vec<CacheRow>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 8];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        if &header != HEADER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a cache log", path.display()),
            ));
        }

        let mut rows = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<CacheRow>(&payload) {
                Ok(row) => rows.push(row),
                Err(_) => break,
            }
        }

        Ok(rows)
    }
}

/// File-backed [`CacheBackend`]: reads from an in-memory index rebuilt by
/// replay, writes through to the [`CacheLog`].
pub struct LogBackend {
    index: DashMap<CacheKey, CacheRow>,
    log: Mutex<CacheLog>,
    compact_threshold: u64,
}

impl LogBackend {
    pub fn open(path: &Path, compact_threshold: u64) -> io::Result<Self> {
        let rows = CacheLog::replay(path)?;
        let replayed = rows.len();
        let mut latest: HashMap<CacheKey, CacheRow> = HashMap::new();
        for row in rows {
            latest.insert(row.key(), row);
        }
        let index: DashMap<CacheKey, CacheRow> = latest.into_iter().collect();
        info!("cache log {}: {replayed} records, {} keys", path.display(), index.len());
        Ok(Self {
            index,
            log: Mutex::new(CacheLog::open(path)?),
            compact_threshold,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[async_trait]
impl CacheBackend for LogBackend {
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheRow>, SourceError> {
        Ok(self.index.get(key).map(|r| r.value().clone()))
    }

    async fn upsert(&self, row: CacheRow) -> Result<(), SourceError> {
        let mut log = self.log.lock().await;
        log.append(&row)?;
        self.index.insert(row.key(), row);

        if self.compact_threshold > 0 && log.appends_since_compact() >= self.compact_threshold {
            let snapshot: Vec<CacheRow> = self.index.iter().map(|r| r.value().clone()).collect();
            log.compact(&snapshot)?;
            info!("compacted cache log {} to {} records", log.path().display(), snapshot.len());
        }
        Ok(())
    }

    async fn rows(&self) -> Result<Vec<CacheRow>, SourceError> {
        Ok(self.index.iter().map(|r| r.value().clone()).collect())
    }
}
