use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Events committed together. Replay yields whole records or nothing.
pub type Record = Vec<Event>;

fn encode_record(writer: &mut impl Write, record: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Transaction log. Each frame is `[u32 len][bincode Vec<Event>][u32 crc32]`,
/// little endian, where `len` counts only the payload.
///
/// A frame carries every event of one transaction: a bulk chunk, a removal
/// cascade or an operation row update. A frame cut short by a crash fails its
/// length or CRC check and the transaction is dropped as a unit.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Opens `path` for appending, creating it if missing.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append a single record and fsync. Used by tests only; the writer task
    /// uses `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, record: &[Event]) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Append a single record to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit all buffered records.
    pub fn append_buffered(&mut self, record: &[Event]) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Makes every buffered frame durable.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Bytes already handed to the file. Equals the durable length right after
    /// `flush_sync`, when nothing is buffered.
    pub fn file_len(&self) -> io::Result<u64> {
        self.writer.get_ref().metadata().map(|m| m.len())
    }

    /// Throw away every frame past `len`, buffered or already written, and
    /// forget `records` appends. Used when a batch failed to become durable.
    pub fn truncate_to(&mut self, len: u64, records: u64) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let failed = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it on drop.
        let (failed_file, _unwritten) = failed.into_parts();
        drop(failed_file);

        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(len)?;
        file.sync_all()?;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(records);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a compacted snapshot to a temp file and fsync. Each snapshot
    /// event becomes its own record.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_record(&mut writer, std::slice::from_ref(event))?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Renames the snapshot written by `write_compact_file` over the log and
    /// resumes appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact record in commit order. Reading stops at the first short
    /// or CRC-mismatched frame.
    pub fn replay(path: &Path) -> io::Result<Vec<Record>> {
        read_records(path).map(|(records, _)| records)
    }

    /// Replay, then cut a torn tail off the file so later appends are not
    /// stranded behind bytes replay can never get past.
    pub fn recover(path: &Path) -> io::Result<Vec<Record>> {
        let (records, valid_len) = read_records(path)?;
        let file_len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e),
        };
        if file_len > valid_len {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = file_len - valid_len,
                "truncating torn WAL tail"
            );
            OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
        }
        Ok(records)
    }
}

/// Largest payload replay will allocate for; anything bigger is corruption.
const MAX_RECORD_LEN: usize = 256 * 1024 * 1024;

/// Valid records plus the byte offset just past the last one.
fn read_records(path: &Path) -> io::Result<(Vec<Record>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        if !fill(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_RECORD_LEN {
            break;
        }
        let mut payload = vec![0u8; len];
        let mut crc_buf = [0u8; 4];
        if !fill(&mut reader, &mut payload)? || !fill(&mut reader, &mut crc_buf)? {
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            break;
        }
        let Ok(record) = bincode::deserialize::<Record>(&payload) else {
            break;
        };
        records.push(record);
        valid_len += 8 + len as u64;
    }

    Ok((records, valid_len))
}

/// `read_exact` that reports a short read as `false` instead of an error.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
