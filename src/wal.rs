use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Bytes of framing around each payload: length prefix + CRC trailer.
const FRAME_OVERHEAD: u64 = 8;

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one frame. `Ok(None)` means a clean end, a torn write, or a corrupt frame:
/// anything after the last good frame is not trusted.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    for buf in [&mut payload[..], &mut crc_buf[..]] {
        match reader.read_exact(buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, len as u64 + FRAME_OVERHEAD))),
        Err(_) => Ok(None),
    }
}

/// Result of reading a journal back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the trusted prefix.
    pub valid_len: u64,
    /// Bytes after the trusted prefix (torn or corrupt tail).
    pub discarded: u64,
}

/// Append-only write-ahead log of store events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`.
/// A torn or corrupt tail is cut off when the log is opened, so new
/// appends always follow the last good frame.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path`, trimming any untrusted tail.
    pub fn open(path: &Path) -> io::Result<Self> {
        let replay = Self::replay(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if replay.discarded > 0 {
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: replay.events.len() as u64,
        })
    }

    /// Append and fsync a single event. Production code goes through the
    /// group-commit writer (`append_buffered` + `flush_sync`).
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without syncing.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush buffered frames and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events`: write a synced temp file, then rename it over the log.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                write_frame(&mut writer, event)?;
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

    /// Read every trusted event from `path`. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        while let Some((event, frame_len)) = read_frame(&mut reader)? {
            replay.events.push(event);
            replay.valid_len += frame_len;
        }
        replay.discarded = total_len - replay.valid_len;
        Ok(replay)
    }
}
