use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame a single event as `[u32 len][bincode payload][u32 crc32]`.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

enum Record {
    /// An intact event and its framed size in bytes.
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Partial, checksum-mismatched or undecodable record.
    Damaged,
}

/// Fill `buf` completely. Returns `Ok(false)` if the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut len_buf = [0u8; 4];
    match reader.read(&mut len_buf[..1])? {
        0 => return Ok(Record::End),
        _ => {
            if !read_full(reader, &mut len_buf[1..])? {
                return Ok(Record::Damaged);
            }
        }
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(Record::Damaged);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(Record::Damaged);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Record::Damaged);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Record::Event(event, 8 + len as u64)),
        Err(_) => Ok(Record::Damaged),
    }
}

/// Result of reading a log back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// A damaged tail (crash mid-write) was found and ignored.
    pub discarded_tail: bool,
    /// Byte length of the intact prefix.
    pub valid_len: u64,
}

/// Append-only write-ahead log of booking events.
///
/// A crash can leave at most one partial record at the end of the file; replay
/// stops at the first record whose length, checksum or payload does not check out.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// Appends buffered since the last successful `flush_sync`.
    pending_appends: u64,
    /// File length after the last successful `flush_sync`.
    committed_len: u64,
    /// Set when a rollback could not restore `committed_len`; every later
    /// append fails rather than landing behind unknown bytes.
    poisoned: bool,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            pending_appends: 0,
            committed_len,
            poisoned: false,
        })
    }

    /// Cut the log back to `valid_len` bytes and fsync. Used after replay
    /// stopped at a damaged tail, so new appends follow the last intact record.
    pub fn truncate(path: &Path, valid_len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len)?;
        file.sync_all()
    }

    /// Append + fsync in one step. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing. Durable only after `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL poisoned by a failed rollback"));
        }
        encode_record(&mut self.writer, event)?;
        self.pending_appends += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.committed_len = self.writer.get_ref().metadata()?.len();
        self.appends_since_compact += self.pending_appends;
        self.pending_appends = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`:
    /// the unflushed buffer is discarded and any bytes that already reached
    /// the file are truncated away.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.pending_appends = 0;
        let result = self.reset_writer();
        self.poisoned = result.is_err();
        result
    }

    fn reset_writer(&mut self) -> io::Result<()> {
        let fresh = open_append(&self.path)?;
        // into_parts hands back the file without flushing the stale buffer.
        let (old, _discarded) = std::mem::replace(&mut self.writer, BufWriter::new(fresh)).into_parts();
        drop(old);
        Self::truncate(&self.path, self.committed_len)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact + self.pending_appends
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Phase one of compaction: write the snapshot to a temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Phase two: rename the snapshot over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = open_append(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.pending_appends = 0;
        self.poisoned = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact event. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        loop {
            match read_record(&mut reader)? {
                Record::Event(event, size) => {
                    replay.events.push(event);
                    replay.valid_len += size;
                }
                Record::End => break,
                Record::Damaged => {
                    replay.discarded_tail = true;
                    break;
                }
            }
        }
        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewBooking, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(resource: &str, start: i64, end: i64) -> Event {
        let booking = NewBooking::pending(resource.into(), "u1".into(), "o1".into(), Span::new(start, end))
            .into_booking(Ulid::new(), 42);
        Event::BookingCreated { booking }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let first = created("R1", 1000, 2000);
        let removed = match &first {
            Event::BookingCreated { booking } => Event::BookingRemoved {
                id: booking.id,
                resource_id: booking.resource_id.clone(),
            },
            _ => unreachable!(),
        };
        let events = vec![first, removed];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert!(!replay.discarded_tail);
    }

    #[test]
    fn replay_discards_truncated_tail() {
        let path = tmp_path("truncated_tail.wal");
        let event = created("R1", 0, 10);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![event]);
        assert!(replay.discarded_tail);
    }

    #[test]
    fn truncate_to_intact_prefix_lets_appends_replay() {
        let path = tmp_path("truncate_tail.wal");
        let first = created("R1", 0, 10);
        let second = created("R1", 20, 30);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert!(replay.discarded_tail);
        assert_eq!(replay.valid_len, intact);

        Wal::truncate(&path, replay.valid_len).unwrap();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![first, second]);
        assert!(!replay.discarded_tail);
    }

    #[test]
    fn rollback_drops_uncommitted_bytes() {
        let path = tmp_path("rollback.wal");
        let committed = created("R1", 0, 10);
        let failed = created("R1", 20, 30);
        let later = created("R2", 0, 10);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&committed).unwrap();
        let committed_len = fs::metadata(&path).unwrap().len();

        // Bytes reach the file but the batch never syncs.
        wal.append_buffered(&failed).unwrap();
        wal.writer.flush().unwrap();
        assert!(fs::metadata(&path).unwrap().len() > committed_len);

        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), committed_len);
        assert_eq!(wal.appends_since_compact(), 1);

        // A rollback with bytes still only in the buffer drops them too.
        wal.append_buffered(&failed).unwrap();
        wal.rollback().unwrap();

        wal.append(&later).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap().events, vec![committed, later]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert!(!replay.discarded_tail);
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let good = created("R1", 0, 10);
        let bad = created("R2", 0, 10);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![good]);
        assert!(replay.discarded_tail);
    }

    #[test]
    fn compaction_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let keep = created("R1", 0, 1000);
        let after = created("R1", 5000, 6000);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&keep).unwrap();
        for i in 0..10 {
            let churn = created("R9", i * 10, i * 10 + 5);
            wal.append(&churn).unwrap();
            if let Event::BookingCreated { booking } = churn {
                wal.append(&Event::BookingRemoved { id: booking.id, resource_id: booking.resource_id })
                    .unwrap();
            }
        }
        assert_eq!(wal.appends_since_compact(), 21);
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let compacted = fs::metadata(&path).unwrap().len();
        assert!(compacted < before, "compacted WAL should be smaller: {compacted} < {before}");

        wal.append(&after).unwrap();
        drop(wal);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![keep, after]);
    }

    #[test]
    fn buffered_appends_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| created("R1", i * 100, i * 100 + 50)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }
}
