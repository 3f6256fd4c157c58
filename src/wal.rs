use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Records larger than this are treated as corruption rather than allocated.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Write one record: `[u32 le: len][bincode: Event][u32 le: crc32(payload)]`.
/// Returns the number of bytes written.
fn write_record(out: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(payload.len() as u64 + 8)
}

enum Record {
    Event { event: Event, size: u64 },
    End,
    /// The file stops partway through a record.
    Torn,
    Corrupt(String),
}

/// Fill `buf`, or report how far we got. `Ok(false)` means end of file first.
fn fill(input: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(input: &mut impl Read) -> io::Result<Record> {
    let mut len_buf = [0u8; 4];
    if !fill(input, &mut len_buf)? {
        return Ok(Record::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Record::Corrupt(format!("record length {len} out of bounds")));
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !fill(input, &mut payload)? || !fill(input, &mut crc_buf)? {
        return Ok(Record::Torn);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Record::Corrupt("checksum mismatch".into()));
    }
    match bincode::deserialize(&payload) {
        Ok(event) => Ok(Record::Event { event, size: len as u64 + 8 }),
        Err(e) => Ok(Record::Corrupt(format!("undecodable event: {e}"))),
    }
}

/// What a replay recovered, and why it stopped early if it did.
#[derive(Debug, Default)]
pub struct ReplayReport {
    pub events: Vec<Event>,
    /// Byte length of the intact prefix.
    pub valid_len: u64,
    pub discarded_tail: Option<String>,
}

/// Append-only ledger log. The engine's writer task buffers a batch, then
/// writes and fsyncs it in one go. A batch that fails to sync is cut back off
/// the file, so a later record never lands behind a partial one.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Encoded records not yet written.
    pending: Vec<u8>,
    pending_appends: u64,
    /// File length covered by the last successful sync.
    synced_len: u64,
    appends_since_compact: u64,
    /// Set when a failed batch could not be cut back off the file.
    broken: bool,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn truncate_to(path: &Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_appends: 0,
            synced_len,
            appends_since_compact: 0,
            broken: false,
        })
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event. Durable only after [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::other("ledger log has an unremovable partial batch"));
        }
        write_record(&mut self.pending, event)?;
        self.pending_appends += 1;
        Ok(())
    }

    /// Write and fsync everything buffered. On error call [`Wal::rollback`].
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file.write_all(&self.pending)?;
        self.file.sync_all()?;
        self.synced_len += self.pending.len() as u64;
        self.appends_since_compact += self.pending_appends;
        self.pending.clear();
        self.pending_appends = 0;
        Ok(())
    }

    /// Drop the unsynced batch, and any part of it that reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.pending_appends = 0;
        let result = self.file.set_len(self.synced_len).and_then(|()| self.file.sync_all());
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn snapshot_path(path: &Path) -> PathBuf {
        path.with_extension("wal.snapshot")
    }

    /// Write a full snapshot next to the log and fsync it. The live log is untouched.
    pub fn write_snapshot(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(Self::snapshot_path(path))?);
        for event in events {
            write_record(&mut out, event)?;
        }
        out.flush()?;
        out.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and continue appending to it.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        fs::rename(Self::snapshot_path(&self.path), &self.path)?;
        *self = Self::open(&self.path)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_snapshot(&self.path, events)?;
        self.install_snapshot()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact record, stopping at the first torn or corrupt one.
    /// A missing file is an empty ledger.
    pub fn replay(path: &Path) -> io::Result<ReplayReport> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReplayReport::default()),
            Err(e) => return Err(e),
        };
        let mut input = BufReader::new(file);
        let mut report = ReplayReport::default();
        loop {
            match read_record(&mut input)? {
                Record::Event { event, size } => {
                    report.events.push(event);
                    report.valid_len += size;
                }
                Record::End => break,
                Record::Torn => {
                    report.discarded_tail = Some("torn record".into());
                    break;
                }
                Record::Corrupt(why) => {
                    report.discarded_tail = Some(why);
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Replay, then cut a damaged tail off the file so new records follow
    /// the last intact one.
    pub fn recover(path: &Path) -> io::Result<ReplayReport> {
        let report = Self::replay(path)?;
        if report.discarded_tail.is_some() {
            truncate_to(path, report.valid_len)?;
        }
        Ok(report)
    }
}
