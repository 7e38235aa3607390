//! Built-in Zip32 encoder.
//!
//! Writes local headers followed by streamed deflate data and a data
//! descriptor, then the central directory and end record. Needs nothing
//! beyond `flate2`, so it is always available.
//!
//! # Not Supported
//! - Zip64: members or archives over 4 GiB, more than 65535 members.
//! - Encryption, comments, extra fields.

use crate::archive::{discard_partial, is_vanished_link, DEFAULT_COMPRESSION_LEVEL};
use crate::executor::collector::{ErrorCollector, ErrorPhase};
use crate::fs::walker::FileEntry;
use chrono::{DateTime, Datelike, Local, Timelike};
use flate2::write::DeflateEncoder;
use flate2::{Compression, CrcReader};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SIG_LFH: u32 = 0x0403_4b50;
const SIG_CDFH: u32 = 0x0201_4b50;
const SIG_EOCD: u32 = 0x0605_4b50;
const SIG_DATA_DESCRIPTOR: u32 = 0x0807_4b50;

const VERSION_NEEDED: u16 = 20;
/// Upper byte 3 = unix, so external attributes carry the mode
const VERSION_MADE_BY: u16 = (3 << 8) | 20;

const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const FLAG_UTF8: u16 = 1 << 11;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

const S_IFREG: u32 = 0o100_000;
const S_IFDIR: u32 = 0o040_000;
const DOS_DIRECTORY: u32 = 0x10;

const MAX_MEMBERS: usize = u16::MAX as usize;
const ZIP32_LIMIT: u64 = u32::MAX as u64;

/// Writer that tracks how many bytes passed through it
struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Central directory data kept for each member
struct CentralRecord {
    name: String,
    flags: u16,
    method: u16,
    time: u16,
    date: u16,
    crc: u32,
    compressed: u32,
    uncompressed: u32,
    external_attr: u32,
    offset: u32,
}

/// Streaming zip encoder over any writer
pub struct ZipEncoder<W: Write> {
    out: CountingWriter<W>,
    records: Vec<CentralRecord>,
    level: Compression,
}

impl<W: Write> ZipEncoder<W> {
    pub fn new(inner: W, level: u32) -> Self {
        Self {
            out: CountingWriter { inner, count: 0 },
            records: Vec::new(),
            level: Compression::new(level.min(9)),
        }
    }

    /// Number of members written so far
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Add a directory member; `name` should end with `/`
    pub fn add_directory(&mut self, name: &str, mode: u32, modified: SystemTime) -> io::Result<()> {
        let offset = self.next_offset()?;
        let (time, date) = dos_datetime(modified);
        let flags = FLAG_UTF8;

        self.write_local_header(name, flags, METHOD_STORED, time, date)?;

        self.records.push(CentralRecord {
            name: name.to_string(),
            flags,
            method: METHOD_STORED,
            time,
            date,
            crc: 0,
            compressed: 0,
            uncompressed: 0,
            external_attr: ((S_IFDIR | mode) << 16) | DOS_DIRECTORY,
            offset,
        });
        Ok(())
    }

    /// Add a file member, deflating everything `reader` yields
    pub fn add_file<R: Read>(
        &mut self,
        name: &str,
        mode: u32,
        modified: SystemTime,
        reader: R,
    ) -> io::Result<()> {
        let offset = self.next_offset()?;
        let (time, date) = dos_datetime(modified);
        let flags = FLAG_DATA_DESCRIPTOR | FLAG_UTF8;

        self.write_local_header(name, flags, METHOD_DEFLATED, time, date)?;

        let mut reader = CrcReader::new(reader);
        let start = self.out.count;
        let uncompressed = {
            let mut encoder = DeflateEncoder::new(&mut self.out, self.level);
            let copied = io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?;
            copied
        };
        let compressed = self.out.count - start;
        let crc = reader.crc().sum();

        let compressed = zip32(compressed, "compressed member")?;
        let uncompressed = zip32(uncompressed, "member")?;

        write_u32(&mut self.out, SIG_DATA_DESCRIPTOR)?;
        write_u32(&mut self.out, crc)?;
        write_u32(&mut self.out, compressed)?;
        write_u32(&mut self.out, uncompressed)?;

        self.records.push(CentralRecord {
            name: name.to_string(),
            flags,
            method: METHOD_DEFLATED,
            time,
            date,
            crc,
            compressed,
            uncompressed,
            external_attr: (S_IFREG | mode) << 16,
            offset,
        });
        Ok(())
    }

    /// Write the central directory and end record, returning the inner writer
    pub fn finish(mut self) -> io::Result<W> {
        let cd_start = zip32(self.out.count, "archive")?;

        for record in &self.records {
            let name = record.name.as_bytes();
            write_u32(&mut self.out, SIG_CDFH)?;
            write_u16(&mut self.out, VERSION_MADE_BY)?;
            write_u16(&mut self.out, VERSION_NEEDED)?;
            write_u16(&mut self.out, record.flags)?;
            write_u16(&mut self.out, record.method)?;
            write_u16(&mut self.out, record.time)?;
            write_u16(&mut self.out, record.date)?;
            write_u32(&mut self.out, record.crc)?;
            write_u32(&mut self.out, record.compressed)?;
            write_u32(&mut self.out, record.uncompressed)?;
            write_u16(&mut self.out, name.len() as u16)?;
            write_u16(&mut self.out, 0)?; // extra
            write_u16(&mut self.out, 0)?; // comment
            write_u16(&mut self.out, 0)?; // disk number
            write_u16(&mut self.out, 0)?; // internal attributes
            write_u32(&mut self.out, record.external_attr)?;
            write_u32(&mut self.out, record.offset)?;
            self.out.write_all(name)?;
        }

        let cd_size = zip32(self.out.count, "archive")? - cd_start;
        let members = self.records.len() as u16;

        write_u32(&mut self.out, SIG_EOCD)?;
        write_u16(&mut self.out, 0)?; // this disk
        write_u16(&mut self.out, 0)?; // disk with central directory
        write_u16(&mut self.out, members)?;
        write_u16(&mut self.out, members)?;
        write_u32(&mut self.out, cd_size)?;
        write_u32(&mut self.out, cd_start)?;
        write_u16(&mut self.out, 0)?; // comment length

        self.out.flush()?;
        Ok(self.out.inner)
    }

    fn next_offset(&self) -> io::Result<u32> {
        if self.records.len() >= MAX_MEMBERS {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("more than {} members needs Zip64, which is not supported", MAX_MEMBERS),
            ));
        }
        zip32(self.out.count, "archive")
    }

    fn write_local_header(&mut self, name: &str, flags: u16, method: u16, time: u16, date: u16) -> io::Result<()> {
        let name = name.as_bytes();
        if name.len() > u16::MAX as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "member name too long"));
        }

        write_u32(&mut self.out, SIG_LFH)?;
        write_u16(&mut self.out, VERSION_NEEDED)?;
        write_u16(&mut self.out, flags)?;
        write_u16(&mut self.out, method)?;
        write_u16(&mut self.out, time)?;
        write_u16(&mut self.out, date)?;
        // crc and sizes follow in the data descriptor (or are zero for directories)
        write_u32(&mut self.out, 0)?;
        write_u32(&mut self.out, 0)?;
        write_u32(&mut self.out, 0)?;
        write_u16(&mut self.out, name.len() as u16)?;
        write_u16(&mut self.out, 0)?;
        self.out.write_all(name)
    }
}

fn write_u16<W: Write>(w: &mut W, value: u16) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

fn write_u32<W: Write>(w: &mut W, value: u32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

fn zip32(value: u64, what: &str) -> io::Result<u32> {
    if value > ZIP32_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{} exceeds 4 GiB, Zip64 is not supported", what),
        ));
    }
    Ok(value as u32)
}

/// MS-DOS (time, date) pair in local time; clamped to the 1980-2107 range
pub fn dos_datetime(modified: SystemTime) -> (u16, u16) {
    let local: DateTime<Local> = modified.into();

    if local.year() < 1980 {
        return (0, (1 << 5) | 1);
    }
    if local.year() > 2107 {
        return ((23 << 11) | (59 << 5) | 29, (127 << 9) | (12 << 5) | 31);
    }

    let time = ((local.hour() as u16) << 11) | ((local.minute() as u16) << 5) | (local.second() as u16 / 2);
    let date = (((local.year() - 1980) as u16) << 9) | ((local.month() as u16) << 5) | local.day() as u16;
    (time, date)
}

/// In-process archive backend built on [`ZipEncoder`]
#[derive(Debug, Clone)]
pub struct InProcessZip {
    pub compression_level: u32,
}

impl Default for InProcessZip {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl InProcessZip {
    pub fn new(compression_level: u32) -> Self {
        Self { compression_level }
    }

    /// Write all entries to `archive_path`; returns whether the archive was produced
    pub fn write(
        &self,
        entries: &[FileEntry],
        archive_path: &Path,
        errors: &mut ErrorCollector,
        cancel: &CancellationToken,
    ) -> bool {
        let file = match File::create(archive_path) {
            Ok(f) => f,
            Err(e) => {
                errors.push_path(ErrorPhase::Write, archive_path, format!("cannot create archive: {}", e));
                return false;
            }
        };

        let mut encoder = ZipEncoder::new(BufWriter::new(file), self.compression_level);

        for entry in entries {
            if cancel.is_cancelled() {
                errors.push(ErrorPhase::Write, "archive cancelled");
                drop(encoder);
                discard_partial(archive_path);
                return false;
            }

            if is_vanished_link(entry) {
                continue;
            }

            let result = if entry.is_dir() {
                encoder.add_directory(&entry.member_name(), entry.mode, entry.modified)
            } else {
                match File::open(&entry.path) {
                    Ok(source) => encoder.add_file(&entry.archive_name, entry.mode, entry.modified, source),
                    Err(e) => {
                        errors.push_path(ErrorPhase::Write, &entry.path, format!("cannot read file: {}", e));
                        continue;
                    }
                }
            };

            if let Err(e) = result {
                errors.push_path(ErrorPhase::Write, &entry.path, format!("cannot add to archive: {}", e));
            }
        }

        let members = encoder.len();
        match encoder.finish().and_then(|mut w| w.flush()) {
            Ok(()) => {
                info!("Wrote {} members to {}", members, archive_path.display());
                true
            }
            Err(e) => {
                errors.push_path(ErrorPhase::Write, archive_path, format!("cannot finalize archive: {}", e));
                discard_partial(archive_path);
                false
            }
        }
    }
}

/// Write a valid archive with no members
pub fn write_empty_archive(archive_path: &Path) -> io::Result<()> {
    let file = File::create(archive_path)?;
    let mut out = ZipEncoder::new(BufWriter::new(file), DEFAULT_COMPRESSION_LEVEL).finish()?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    fn read_back(bytes: Vec<u8>) -> zip::ZipArchive<Cursor<Vec<u8>>> {
        zip::ZipArchive::new(Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn test_empty_archive_is_readable() {
        let bytes = ZipEncoder::new(Vec::new(), 6).finish().unwrap();
        assert_eq!(bytes.len(), 22);
        let archive = read_back(bytes);
        assert_eq!(archive.len(), 0);
    }

    #[test]
    fn test_members_round_trip_through_zip_reader() {
        let mtime = SystemTime::now();
        let mut encoder = ZipEncoder::new(Vec::new(), 6);
        encoder.add_directory("docs/", 0o755, mtime).unwrap();
        encoder
            .add_file("docs/readme.txt", 0o644, mtime, &b"hello hello hello hello"[..])
            .unwrap();
        encoder.add_file("empty.txt", 0o600, mtime, &b""[..]).unwrap();
        assert_eq!(encoder.len(), 3);

        let mut archive = read_back(encoder.finish().unwrap());
        assert_eq!(archive.len(), 3);

        let names: Vec<String> = archive.file_names().map(String::from).collect();
        assert!(names.contains(&"docs/".to_string()));
        assert!(names.contains(&"docs/readme.txt".to_string()));

        let mut contents = String::new();
        archive
            .by_name("docs/readme.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "hello hello hello hello");

        assert!(archive.by_name("docs/").unwrap().is_dir());
        assert_eq!(archive.by_name("empty.txt").unwrap().unix_mode(), Some(S_IFREG | 0o600));
    }

    #[test]
    fn test_dos_datetime_encoding() {
        // 2001-09-09T01:46:40Z, checked in local time
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        let local: DateTime<Local> = t.into();
        let (time, date) = dos_datetime(t);

        assert_eq!((date >> 9) as i32 + 1980, local.year());
        assert_eq!(((date >> 5) & 0x0f) as u32, local.month());
        assert_eq!((date & 0x1f) as u32, local.day());
        assert_eq!((time >> 11) as u32, local.hour());
        assert_eq!(((time >> 5) & 0x3f) as u32, local.minute());
    }

    #[test]
    fn test_dos_datetime_clamps_before_1980() {
        assert_eq!(dos_datetime(SystemTime::UNIX_EPOCH + Duration::from_secs(86_400 * 30)), (0, 33));
    }

    #[test]
    fn test_write_empty_archive_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.zip");
        write_empty_archive(&path).unwrap();

        let archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 0);
    }
}
