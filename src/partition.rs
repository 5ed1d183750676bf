//! Day-partitioned, append-only scan logs.
//!
//! Each `(line, date)` pair maps to one CSV file under the data directory:
//!
//! ```text
//! data/
//!   2024-05-01_Line-1.csv
//!   2024-05-02_Line-1.csv
//! ```
//!
//! There is exactly one writer per line and any number of readers, with no
//! locking between them. Writers emit whole terminated lines in a single
//! write; readers drop anything after the last terminator and skip rows that
//! fail to parse, so a reader racing a writer sees a consistent prefix.

use chrono::NaiveDateTime;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::error::{TallyError, TallyResult};
use crate::models::{PartitionKey, ScanRecord, ScanToken, TIMESTAMP_FORMAT};

/// Column names written as the first row of every partition.
pub const HEADER: [&str; 3] = ["Line Name", "Time Scanned", "Barcode"];

const TAIL_CHUNK: usize = 512;

/// Change marker for a partition file.
///
/// Opaque: only compared for equality against the last observed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionVersion {
    Absent,
    Present { modified: SystemTime, len: u64 },
}

#[derive(Debug, Clone)]
pub struct PartitionStore {
    data_dir: PathBuf,
}

impl PartitionStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path(&self, key: &PartitionKey) -> PathBuf {
        self.data_dir.join(key.file_name())
    }

    /// Ensures the partition file exists and starts with the header row.
    ///
    /// Idempotent. Creation uses `create_new`, so a concurrent creator
    /// losing the race simply finds the file already there.
    pub fn open_or_create(&self, key: &PartitionKey) -> TallyResult<PathBuf> {
        fs::create_dir_all(&self.data_dir)
            .map_err(|e| TallyError::storage(&self.data_dir, e))?;

        let path = self.path(key);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                write_header(&mut file).map_err(|e| TallyError::storage(&path, e))?;
                debug!(path = %path.display(), "created partition");
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let len = fs::metadata(&path)
                    .map_err(|e| TallyError::storage(&path, e))?
                    .len();
                if len == 0 {
                    OpenOptions::new()
                        .append(true)
                        .open(&path)
                        .and_then(|mut file| write_header(&mut file))
                        .map_err(|e| TallyError::storage(&path, e))?;
                }
            }
            Err(e) => return Err(TallyError::storage(&path, e)),
        }
        Ok(path)
    }

    /// Appends one record as a single terminated line and syncs it to disk
    /// before returning.
    ///
    /// If the file does not end in a terminator (an earlier write was torn),
    /// the unterminated fragment is cut off first. It was never acknowledged,
    /// so it must not become a row.
    pub fn append(&self, record: &ScanRecord) -> TallyResult<()> {
        let key = PartitionKey::new(record.line_id.clone(), record.timestamp.date());
        let path = self.open_or_create(&key)?;

        let timestamp = record.timestamp.format(TIMESTAMP_FORMAT).to_string();
        let row = [
            record.line_id.as_str(),
            timestamp.as_str(),
            record.token.as_str(),
        ];
        let bytes = encode_row(&row).map_err(|e| TallyError::storage(&path, e))?;

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| TallyError::storage(&path, e))?;
        drop_torn_tail(&path, &mut file).map_err(|e| TallyError::storage(&path, e))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_data())
            .map_err(|e| TallyError::storage(&path, e))?;
        Ok(())
    }

    /// Reads every well-formed record of a partition in append order.
    ///
    /// A missing or zero-length file yields an empty sequence. An
    /// unterminated trailing row and rows that fail to parse are skipped
    /// and logged.
    pub fn read_all(&self, key: &PartitionKey) -> TallyResult<Vec<ScanRecord>> {
        let path = self.path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TallyError::storage(&path, e)),
        };
        Ok(parse_records(&path, &bytes))
    }

    /// Cheap change marker for the partition (modification time plus size).
    pub fn version(&self, key: &PartitionKey) -> TallyResult<PartitionVersion> {
        let path = self.path(key);
        match fs::metadata(&path) {
            Ok(meta) => Ok(PartitionVersion::Present {
                modified: meta.modified().map_err(|e| TallyError::storage(&path, e))?,
                len: meta.len(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PartitionVersion::Absent),
            Err(e) => Err(TallyError::storage(&path, e)),
        }
    }
}

fn encode_row(fields: &[&str]) -> io::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer
        .write_record(fields)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer
        .into_inner()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

fn write_header(file: &mut fs::File) -> io::Result<()> {
    file.write_all(&encode_row(&HEADER)?)?;
    file.sync_data()
}

/// Truncates the file to just after its last terminator. A file left with
/// no complete line at all gets its header back.
fn drop_torn_tail(path: &Path, file: &mut fs::File) -> io::Result<()> {
    let len = file.metadata()?.len();
    let complete = terminated_len(file, len)?;
    if complete == len {
        return Ok(());
    }
    warn!(
        path = %path.display(),
        dropped_bytes = len - complete,
        "discarding torn trailing row"
    );
    file.set_len(complete)?;
    if complete == 0 {
        write_header(file)?;
    }
    Ok(())
}

/// Length of the prefix that ends in a terminator, scanning back from `len`.
fn terminated_len(file: &mut fs::File, len: u64) -> io::Result<u64> {
    let mut chunk = [0u8; TAIL_CHUNK];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK as u64);
        let buf = &mut chunk[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(buf)?;
        if let Some(pos) = buf.iter().rposition(|b| *b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

fn parse_records(path: &Path, bytes: &[u8]) -> Vec<ScanRecord> {
    let complete_len = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |last| last + 1);
    if complete_len < bytes.len() {
        let row = bytes[..complete_len].iter().filter(|b| **b == b'\n').count() + 1;
        warn!(
            error = %malformed(path, row, "unterminated trailing row".to_string()),
            "skipping partial row"
        );
    }
    let complete = &bytes[..complete_len];

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(complete);

    let mut records = Vec::new();
    for result in reader.records() {
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                let row = e.position().map(|p| p.line() as usize).unwrap_or(0);
                warn!(error = %malformed(path, row, e.to_string()), "skipping row");
                continue;
            }
        };
        let line_no = row.position().map(|p| p.line() as usize).unwrap_or(0);
        match parse_row(&row) {
            Ok(record) => records.push(record),
            Err(reason) => {
                warn!(error = %malformed(path, line_no, reason), "skipping row");
            }
        }
    }
    records
}

fn parse_row(row: &csv::StringRecord) -> Result<ScanRecord, String> {
    if row.len() != HEADER.len() {
        return Err(format!("expected {} fields, found {}", HEADER.len(), row.len()));
    }
    let timestamp = NaiveDateTime::parse_from_str(row[1].trim(), TIMESTAMP_FORMAT)
        .map_err(|e| format!("bad timestamp '{}': {}", &row[1], e))?;
    let token = ScanToken::normalize(&row[2]).ok_or_else(|| "empty barcode".to_string())?;
    Ok(ScanRecord {
        line_id: row[0].to_string(),
        timestamp,
        token,
    })
}

fn malformed(path: &Path, row: usize, reason: String) -> TallyError {
    TallyError::Malformed {
        path: path.to_path_buf(),
        row,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn key() -> PartitionKey {
        PartitionKey::new("L1", NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())
    }

    fn record(token: &str, h: u32, m: u32) -> ScanRecord {
        ScanRecord {
            line_id: "L1".to_string(),
            timestamp: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(h, m, 0)
                .unwrap(),
            token: ScanToken::normalize(token).unwrap(),
        }
    }

    #[test]
    fn create_is_idempotent_and_writes_header_once() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path().join("data"));
        let path = store.open_or_create(&key()).unwrap();
        store.open_or_create(&key()).unwrap();
        let content = fs::read_to_string(path).unwrap();
        assert_eq!(content, "Line Name,Time Scanned,Barcode\n");
    }

    #[test]
    fn append_then_read_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path());
        store.append(&record("A1", 8, 0)).unwrap();
        store.append(&record("B2", 8, 5)).unwrap();

        let records = store.read_all(&key()).unwrap();
        let tokens: Vec<_> = records.iter().map(|r| r.token.as_str()).collect();
        assert_eq!(tokens, vec!["A1", "B2"]);
        assert_eq!(records[1], record("B2", 8, 5));
    }

    #[test]
    fn absent_and_empty_files_read_as_empty() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path());
        assert!(store.read_all(&key()).unwrap().is_empty());
        assert_eq!(store.version(&key()).unwrap(), PartitionVersion::Absent);

        fs::write(store.path(&key()), b"").unwrap();
        assert!(store.read_all(&key()).unwrap().is_empty());
    }

    #[test]
    fn zero_length_file_gets_header_on_create() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path());
        fs::write(store.path(&key()), b"").unwrap();
        store.open_or_create(&key()).unwrap();
        let content = fs::read_to_string(store.path(&key())).unwrap();
        assert!(content.starts_with("Line Name,"));
    }

    #[test]
    fn truncated_trailing_row_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path());
        store.append(&record("A1", 8, 0)).unwrap();
        store.append(&record("B2", 8, 1)).unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(store.path(&key()))
            .unwrap();
        file.write_all(b"L1,2024-05-01 08:0").unwrap();

        let records = store.read_all(&key()).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn append_after_torn_row_keeps_new_record_intact() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path());
        store.append(&record("A1", 8, 0)).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.path(&key()))
            .unwrap();
        file.write_all(b"L1,2024-05-01 08:0").unwrap();

        store.append(&record("C3", 9, 0)).unwrap();
        let tokens: Vec<_> = store
            .read_all(&key())
            .unwrap()
            .into_iter()
            .map(|r| r.token.to_string())
            .collect();
        assert_eq!(tokens, vec!["A1", "C3"]);
    }

    #[test]
    fn parseable_torn_row_is_discarded_on_append() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path());
        fs::write(
            store.path(&key()),
            "Line Name,Time Scanned,Barcode\nL1,2024-05-01 08:00:00,ABC1",
        )
        .unwrap();
        assert!(store.read_all(&key()).unwrap().is_empty());

        store.append(&record("Z9", 9, 0)).unwrap();
        let tokens: Vec<_> = store
            .read_all(&key())
            .unwrap()
            .into_iter()
            .map(|r| r.token.to_string())
            .collect();
        assert_eq!(tokens, vec!["Z9"]);
        let content = fs::read_to_string(store.path(&key())).unwrap();
        assert_eq!(
            content,
            "Line Name,Time Scanned,Barcode\nL1,2024-05-01 09:00:00,Z9\n"
        );
    }

    #[test]
    fn torn_header_is_rewritten_on_append() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path());
        fs::write(store.path(&key()), "Line Name,Time Sc").unwrap();

        store.append(&record("A1", 8, 0)).unwrap();
        let content = fs::read_to_string(store.path(&key())).unwrap();
        assert_eq!(
            content,
            "Line Name,Time Scanned,Barcode\nL1,2024-05-01 08:00:00,A1\n"
        );
    }

    #[test]
    fn malformed_middle_rows_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path());
        fs::write(
            store.path(&key()),
            "Line Name,Time Scanned,Barcode\n\
             L1,2024-05-01 08:00:00,A1\n\
             L1,not-a-time,B2\n\
             L1,2024-05-01 08:02:00\n\
             L1,2024-05-01 08:03:00,C3\n",
        )
        .unwrap();
        let tokens: Vec<_> = store
            .read_all(&key())
            .unwrap()
            .into_iter()
            .map(|r| r.token.to_string())
            .collect();
        assert_eq!(tokens, vec!["A1", "C3"]);
    }

    #[test]
    fn version_changes_after_append() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path());
        store.open_or_create(&key()).unwrap();
        let before = store.version(&key()).unwrap();
        store.append(&record("A1", 8, 0)).unwrap();
        assert_ne!(store.version(&key()).unwrap(), before);
    }
}
