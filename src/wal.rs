use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one event as `[u32 len][bincode payload][u32 crc32]`, little endian.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the log ended
/// (cleanly or mid-entry).
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next entry and its encoded size. `Ok(None)` on end of log, a
/// torn tail, a CRC mismatch or an undecodable payload; replay stops there.
fn decode_event(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_chunk(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_chunk(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_chunk(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    let size = 8 + payload.len() as u64;
    Ok(bincode::deserialize::<Event>(&payload).ok().map(|e| (e, size)))
}

/// Valid events on disk and the byte length they occupy.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0;
    while let Some((event, size)) = decode_event(&mut reader)? {
        events.push(event);
        valid_len += size;
    }
    Ok((events, valid_len))
}

/// Append-only reservation log.
///
/// Appends are staged in memory and reach the file only through
/// `flush_sync`. The file never holds more than the committed prefix plus,
/// after a failed flush, bytes that `rollback` cuts off again.
pub struct Wal {
    file: File,
    path: PathBuf,
    pending: Vec<u8>,
    pending_events: u64,
    committed_len: u64,
    appends_since_compact: u64,
    /// Set when a rollback could not restore the committed length.
    poisoned: Option<String>,
    #[cfg(test)]
    fail_next_write: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`, cutting any torn tail so new
    /// entries follow the last valid one.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (_, valid_len) = scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(Self::with_file(file, path, valid_len))
    }

    fn with_file(file: File, path: &Path, committed_len: u64) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_events: 0,
            committed_len,
            appends_since_compact: 0,
            poisoned: None,
            #[cfg(test)]
            fail_next_write: false,
        }
    }

    fn check_usable(&self) -> io::Result<()> {
        match &self.poisoned {
            Some(reason) => Err(io::Error::other(format!("WAL unusable: {reason}"))),
            None => Ok(()),
        }
    }

    /// Append and fsync a single event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Stage an event; `flush_sync` commits the batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.check_usable()?;
        encode_event(&mut self.pending, event)?;
        self.pending_events += 1;
        Ok(())
    }

    /// Write and fsync every staged event. On error the staged events stay
    /// pending and the file may hold part of them; call `rollback`.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.check_usable()?;
        self.write_pending()?;
        self.committed_len += self.pending.len() as u64;
        self.appends_since_compact += self.pending_events;
        self.pending.clear();
        self.pending_events = 0;
        Ok(())
    }

    fn write_pending(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_write) {
            // Half the batch reaches the disk before the device gives up.
            self.file.write_all(&self.pending[..self.pending.len() / 2])?;
            return Err(io::Error::new(io::ErrorKind::StorageFull, "no space left on device"));
        }
        self.file.write_all(&self.pending)?;
        self.file.sync_all()
    }

    /// Drop staged events and cut the file back to the last committed
    /// length. If that fails the log refuses all further writes until the
    /// next compaction replaces the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.pending_events = 0;
        let result = self
            .file
            .set_len(self.committed_len)
            .and_then(|()| self.file.sync_all());
        if let Err(e) = &result {
            self.poisoned = Some(e.to_string());
        }
        result
    }

    #[cfg(test)]
    pub fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write compacted events to a side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let len = file.metadata()?.len();
        *self = Self::with_file(file, &self.path.clone(), len);
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

    /// Every valid event on disk, in append order. A missing file is an
    /// empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|(events, _)| events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DateRange;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("daybook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn range(day: u32, len: u32) -> DateRange {
        let start = NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        DateRange::new(start, start + chrono::Days::new(u64::from(len)))
    }

    fn booking(item_id: i64, day: u32) -> Event {
        Event::BookingConfirmed {
            id: Ulid::new(),
            item_id,
            holder_id: 42,
            range: range(day, 1),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            booking(1, 10),
            Event::HoldPlaced {
                id: Ulid::new(),
                item_id: 1,
                range: range(20, 3),
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = booking(1, 10);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap(); // length says 9, only 2 bytes follow
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = booking(1, 10);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&booking(1, 15)).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_keeps_final_state() {
        let path = tmp_path("compact_shrinks.wal");
        let keep = booking(1, 10);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&keep).unwrap();
            for day in 12..28 {
                let ev = booking(1, day);
                let id = match &ev {
                    Event::BookingConfirmed { id, .. } => *id,
                    _ => unreachable!(),
                };
                wal.append(&ev).unwrap();
                wal.append(&Event::ReservationCancelled { id, item_id: 1 }).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_after_compact_lands_in_new_file() {
        let path = tmp_path("compact_then_append.wal");
        let first = booking(3, 1);
        let second = booking(3, 5);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.compact(std::slice::from_ref(&first)).unwrap();
            wal.append(&second).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_commit_on_flush() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (1..=5).map(|day| booking(2, day)).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 0);
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_failed_batch() {
        let path = tmp_path("rollback.wal");
        let kept = booking(1, 10);
        let rejected = booking(1, 12);
        let later = booking(1, 12);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();
            let committed = fs::metadata(&path).unwrap().len();

            wal.append_buffered(&rejected).unwrap();
            wal.fail_next_write();
            assert!(wal.flush_sync().is_err());
            assert!(fs::metadata(&path).unwrap().len() > committed);

            wal.rollback().unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), committed);
            assert_eq!(wal.appends_since_compact(), 1);

            // The failed bytes must not resurface with the next commit.
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn open_cuts_torn_tail_before_appending() {
        let path = tmp_path("open_cuts_tail.wal");
        let first = booking(1, 10);
        let second = booking(1, 20);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[40u8, 0, 0, 0, 7, 7, 7]).unwrap();
        }
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }
}
