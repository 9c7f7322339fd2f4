use crate::entry::{self, Header, HEADER_SIZE, MAX_PAYLOAD};
use crate::error::BrokerError;
use crate::keyset::KeySet;
use crate::slab::Slab;

use slog::Logger;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

pub type Uuid = [u8; 16];

const INITIAL_INDEX_CAPACITY: usize = 512;

/// A single open, append-only ledger file plus its in-memory projection: the byte
/// offset of every entry and the set of keys already seen.
pub struct Ledger {
    uuid: Uuid,
    ref_count: u32,
    file: File,
    index: Vec<u32>,
    size: u64,
    keys: KeySet,
    log: Logger,
}

impl Ledger {
    pub fn count(&self) -> usize {
        self.index.len()
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    fn offset(&self, i: usize) -> u32 {
        self.index[i]
    }

    /// Reads entry `i`'s header and payload into `buf`, returning the header and the
    /// number of bytes written (`HEADER_SIZE + payload size`, never including padding).
    pub fn read_entry(
        &self,
        i: usize,
        buf: &mut [u8; HEADER_SIZE + MAX_PAYLOAD],
    ) -> io::Result<(Header, usize)> {
        let offset = self.offset(i) as u64;
        let mut header_bytes = [0u8; HEADER_SIZE];
        self.file.read_exact_at(&mut header_bytes, offset)?;
        let header = Header::decode(&header_bytes);

        buf[..HEADER_SIZE].copy_from_slice(&header_bytes);
        let payload_len = header.size as usize;
        if payload_len > 0 {
            self.file
                .read_exact_at(&mut buf[HEADER_SIZE..HEADER_SIZE + payload_len], offset + HEADER_SIZE as u64)?;
        }

        Ok((header, HEADER_SIZE + payload_len))
    }
}

/// Owns every open ledger, keyed by slab index. Ledger ids are what clients carry as
/// their `ledgerId`, a weak reference, never used to mutate lifetime except via the
/// refcount decrement on disconnect.
pub struct LedgerStore {
    root: PathBuf,
    ledgers: Slab<Ledger>,
    log: Logger,
}

impl LedgerStore {
    pub fn new(data_dir: &Path, log: Logger) -> Result<LedgerStore, BrokerError> {
        let root = data_dir.join("ledgers");
        fs::create_dir_all(&root)?;
        set_mode(&root, 0o755)?;
        Ok(LedgerStore { root, ledgers: Slab::with_capacity(4), log })
    }

    pub fn get(&self, id: usize) -> Option<&Ledger> {
        self.ledgers.get(id)
    }

    fn path_for(&self, uuid: &Uuid) -> PathBuf {
        let top = hex_byte(uuid[0]);
        let full = hex_bytes(uuid);
        self.root.join(top).join(full).join("data")
    }

    /// Opens (or references) the ledger for `uuid`. Scans the slab linearly for an
    /// existing slot with a matching UUID and bumps its refcount; otherwise opens the
    /// data file and rebuilds the index by scanning it header-by-header.
    pub fn open(&mut self, uuid: Uuid) -> Result<usize, BrokerError> {
        if let Some(id) = self.ledgers.find(|l| l.uuid == uuid) {
            self.ledgers.get_mut(id).expect("id from find must exist").ref_count += 1;
            return Ok(id);
        }

        let path = self.path_for(&uuid);
        let dir = path.parent().expect("path_for always yields a parent dir");
        fs::create_dir_all(dir)?;
        set_mode(dir, 0o755)?;
        if let Some(top) = dir.parent() {
            set_mode(top, 0o755)?;
        }

        let file = OpenOptions::new().create(true).read(true).write(true).append(true).open(&path)?;
        let file_len = file.metadata()?.len();

        let log = self.log.new(slog::o!("ledger_uuid" => hex_bytes(&uuid)));
        let mut ledger = Ledger {
            uuid,
            ref_count: 1,
            file,
            index: Vec::with_capacity(INITIAL_INDEX_CAPACITY),
            size: 0,
            keys: KeySet::new(),
            log,
        };

        rebuild(&mut ledger, file_len)?;

        slog::debug!(
            ledger.log,
            "loaded";
            "entries" => ledger.count(),
            "bytes" => ledger.size,
        );

        Ok(self.ledgers.insert(ledger))
    }

    /// Appends `payload` under `key` unless it's a duplicate, in which case this is a
    /// silent no-op. On I/O failure the ledger is closed immediately and the error is
    /// returned so the caller can disconnect every client still referencing `id`.
    pub fn write(&mut self, id: usize, key: u64, payload: &[u8]) -> Result<(), LedgerWriteError> {
        let ledger = self.ledgers.get_mut(id).expect("write called on unknown ledger id");

        if ledger.keys.contains(key) {
            return Ok(());
        }

        if let Err(err) = append(ledger, key, payload) {
            slog::error!(ledger.log, "write failed"; "error" => %err);
            self.close(id);
            return Err(LedgerWriteError(err));
        }

        Ok(())
    }

    /// Drops refcount by one, closing the underlying file once it reaches zero.
    pub fn release(&mut self, id: usize) {
        if let Some(ledger) = self.ledgers.get_mut(id) {
            ledger.ref_count = ledger.ref_count.saturating_sub(1);
            if ledger.ref_count == 0 {
                self.close(id);
            }
        }
    }

    /// Forcibly closes and invalidates a ledger slot, regardless of refcount. Used both
    /// for normal zero-refcount teardown and for fatal I/O errors.
    pub fn close(&mut self, id: usize) {
        if let Some(ledger) = self.ledgers.remove(id) {
            slog::debug!(ledger.log, "closed"; "entries" => ledger.count());
        }
    }

    pub fn close_all(&mut self) {
        let ids: Vec<usize> = self.ledgers.iter().map(|(i, _)| i).collect();
        for id in ids {
            self.close(id);
        }
    }
}

#[derive(Debug)]
pub struct LedgerWriteError(io::Error);

impl std::fmt::Display for LedgerWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ledger write failed: {}", self.0)
    }
}

fn append(ledger: &mut Ledger, key: u64, payload: &[u8]) -> io::Result<()> {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    debug_assert_ne!(key, 0, "KeySet cannot represent the sentinel key 0");

    let header = Header::new(key, payload.len() as u8);
    let padding = entry::padding(payload.len());

    let mut record = Vec::with_capacity(HEADER_SIZE + payload.len() + padding);
    header.write(&mut record)?;
    record.extend_from_slice(payload);
    record.resize(record.len() + padding, 0);

    ledger.file.write_all_at(&record, ledger.size)?;
    ledger.file.sync_all()?;

    ledger.index.push(ledger.size as u32);
    ledger.size += record.len() as u64;
    ledger.keys.add(key);

    Ok(())
}

/// Scans a ledger file header-by-header, rebuilding `index` and `keys`. A header whose
/// declared size would overrun the file length means a corrupt file, refused outright.
fn rebuild(ledger: &mut Ledger, file_len: u64) -> Result<(), BrokerError> {
    let mut offset = 0u64;
    let mut header_bytes = [0u8; HEADER_SIZE];

    while offset < file_len {
        if file_len - offset < HEADER_SIZE as u64 {
            return Err(BrokerError::Config(format!(
                "ledger file truncated: {} bytes left, header needs {}",
                file_len - offset,
                HEADER_SIZE
            )));
        }

        ledger.file.read_exact_at(&mut header_bytes, offset).map_err(BrokerError::Io)?;
        let header = Header::decode(&header_bytes);
        let stored = entry::stored_len(header.size as usize) as u64;

        if offset + stored > file_len {
            return Err(BrokerError::Config(format!(
                "ledger file corrupt: entry at offset {} overruns file length {}",
                offset, file_len
            )));
        }

        ledger.index.push(offset as u32);
        if header.key != 0 {
            ledger.keys.add(header.key);
        }
        offset += stored;
    }

    ledger.size = offset;
    Ok(())
}

fn hex_byte(b: u8) -> String {
    format!("{:02x}", b)
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
