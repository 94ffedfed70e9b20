//! CRC-guarded persistent storage for protocol parameters.
//!
//! Every entry is one named blob: `len` payload bytes followed by a 16 bit
//! CRC, little endian, in a single file. A file holding exactly `-\n` is a
//! sentinel meaning "use the compiled-in defaults on next start". Commanded
//! stores replace the file atomically via a `.tmp`/`.old` rename dance;
//! auto-storable entries keep their file open and are rewritten from the
//! mainline tick whenever the CRC of the in-memory region changed.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use crate::err::DriverError;

/// Sentinel file content produced by a restore command.
pub const RESTORE_SENTINEL: [u8; 2] = *b"-\n";

bitflags::bitflags! {
    /// What a storage entry participates in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StorageAttr: u8 {
        /// Written on an explicit store command.
        const CMD = 0x01;
        /// Saved periodically when the region content changed.
        const AUTO = 0x02;
        /// May be reset to defaults with a restore command.
        const RESTORE = 0x04;
    }
}

/// A storable memory region, shared with the protocol stack. Holding the
/// lock while reading or writing the bytes is the object-dictionary lock
/// discipline required around storage accesses.
pub type Region = Arc<Mutex<Vec<u8>>>;

/// Convenience constructor for a [`Region`].
pub fn region(data: Vec<u8>) -> Region {
    Arc::new(Mutex::new(data))
}

/// CRC16-CCITT (XMODEM), polynomial 0x1021, as used for all persisted
/// payloads. `crc` is the initial value, 0 for a fresh computation.
pub fn crc16_ccitt(data: &[u8], mut crc: u16) -> u16 {
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// One named persistent blob.
pub struct StorageEntry {
    filename: PathBuf,
    region: Region,
    /// Object-dictionary sub-index used as this entry's bit position in
    /// error bitmaps. Must be >= 2.
    sub_index: u8,
    attr: StorageAttr,
    crc: u16,
    file: Option<File>,
}

impl StorageEntry {
    pub fn new(filename: &str, region: Region, sub_index: u8, attr: StorageAttr) -> Self {
        Self {
            filename: PathBuf::from(filename),
            region,
            sub_index,
            attr,
            crc: 0,
            file: None,
        }
    }

    pub fn filename(&self) -> &PathBuf {
        &self.filename
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn sub_index(&self) -> u8 {
        self.sub_index
    }

    fn error_bit(&self) -> u32 {
        1u32 << self.sub_index.min(31)
    }

    fn tmp_name(&self) -> PathBuf {
        let mut s = self.filename.as_os_str().to_os_string();
        s.push(".tmp");
        PathBuf::from(s)
    }

    fn old_name(&self) -> PathBuf {
        let mut s = self.filename.as_os_str().to_os_string();
        s.push(".old");
        PathBuf::from(s)
    }
}

/// The set of persistent entries of one node.
pub struct Storage {
    entries: Vec<StorageEntry>,
    enabled: bool,
}

impl Storage {
    pub fn new(entries: Vec<StorageEntry>) -> Self {
        Self {
            entries,
            enabled: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[StorageEntry] {
        &self.entries
    }

    /// Prepend a path/filename prefix to every entry, as selected on the
    /// command line.
    pub fn apply_prefix(&mut self, prefix: &str) {
        for entry in &mut self.entries {
            let mut s = std::ffi::OsString::from(prefix);
            s.push(entry.filename.as_os_str());
            entry.filename = PathBuf::from(s);
        }
    }

    /// Load every entry from its file. Entries whose file is missing,
    /// holds the restore sentinel or fails length/CRC verification keep
    /// their in-memory defaults and set their sub-index bit in the
    /// returned bitmap. Only argument errors and auto-file creation
    /// failures are hard errors.
    pub fn load(&mut self) -> Result<u32, DriverError> {
        if self.entries.is_empty() {
            return Err(DriverError::IllegalArgument);
        }

        let mut degraded = 0u32;
        for entry in &mut self.entries {
            let len = entry.region.lock().unwrap().len();
            if len == 0 || entry.sub_index < 2 || entry.filename.as_os_str().is_empty() {
                return Err(DriverError::IllegalArgument);
            }

            let mut loaded = false;
            match File::open(&entry.filename) {
                Ok(mut f) => {
                    let mut buf = Vec::with_capacity(len + 2);
                    match f.read_to_end(&mut buf) {
                        Ok(_) if buf == RESTORE_SENTINEL => {
                            debug!("{}: defaults requested", entry.filename.display());
                        }
                        Ok(n) if n == len + 2 => {
                            let crc = crc16_ccitt(&buf[..len], 0);
                            let stored = (&buf[len..]).read_u16::<LittleEndian>().unwrap_or(!crc);
                            if crc == stored {
                                entry.region.lock().unwrap().copy_from_slice(&buf[..len]);
                                entry.crc = crc;
                                loaded = true;
                            } else {
                                warn!("{}: CRC mismatch, using defaults", entry.filename.display());
                            }
                        }
                        Ok(n) => {
                            warn!(
                                "{}: unexpected size {} (want {}), using defaults",
                                entry.filename.display(),
                                n,
                                len + 2
                            );
                        }
                        Err(e) => {
                            warn!("{}: read failed: {}", entry.filename.display(), e);
                        }
                    }
                }
                Err(e) => {
                    debug!("{}: not loaded: {}", entry.filename.display(), e);
                }
            }

            if !loaded {
                degraded |= entry.error_bit();
            }

            // keep the file open for auto storage
            if entry.attr.contains(StorageAttr::AUTO) {
                let file = if loaded {
                    OpenOptions::new().read(true).write(true).open(&entry.filename)
                } else {
                    OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(&entry.filename)
                };
                entry.file = Some(file.map_err(DriverError::Syscall)?);
            }
        }

        self.enabled = true;
        Ok(degraded)
    }

    /// Commanded store: write payload and CRC to `<name>.tmp`, verify by
    /// reading back, then swap the file in with the previous one kept as
    /// `<name>.old`. Any failure leaves the existing file untouched.
    pub fn store(&mut self, index: usize) -> Result<(), DriverError> {
        let entry = self.entries.get_mut(index).ok_or(DriverError::IllegalArgument)?;

        let tmp = entry.tmp_name();
        let crc;
        {
            let data = entry.region.lock().unwrap();
            crc = crc16_ccitt(&data, 0);
            let mut f = File::create(&tmp)?;
            f.write_all(&data)?;
            f.write_u16::<LittleEndian>(crc)?;
        }

        // read back and verify before replacing anything
        {
            let mut buf = Vec::new();
            File::open(&tmp)?.read_to_end(&mut buf)?;
            let data = entry.region.lock().unwrap();
            let ok = buf.len() == data.len() + 2
                && crc16_ccitt(&buf[..data.len()], 0) == crc
                && (&buf[data.len()..]).read_u16::<LittleEndian>().unwrap_or(!crc) == crc;
            if !ok {
                warn!("{}: store verification failed", entry.filename.display());
                return Err(DriverError::DataCorrupt);
            }
        }

        let _ = std::fs::rename(&entry.filename, entry.old_name());
        std::fs::rename(&tmp, &entry.filename)?;
        entry.crc = crc;

        // a retained auto-save handle still points at the old inode
        if entry.file.is_some() {
            entry.file = Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&entry.filename)
                    .map_err(DriverError::Syscall)?,
            );
        }
        Ok(())
    }

    /// Commanded restore: park the current file as `<name>.old` and leave
    /// the sentinel behind so the next start uses defaults.
    pub fn restore(&mut self, index: usize) -> Result<(), DriverError> {
        let entry = self.entries.get_mut(index).ok_or(DriverError::IllegalArgument)?;
        if !entry.attr.contains(StorageAttr::RESTORE) {
            return Err(DriverError::IllegalArgument);
        }

        entry.file = None;
        let _ = std::fs::rename(&entry.filename, entry.old_name());
        let mut f = File::create(&entry.filename)?;
        f.write_all(&RESTORE_SENTINEL)?;
        Ok(())
    }

    /// Auto-save tick: rewrite every auto-storable entry whose region CRC
    /// differs from the last written one. Returns a bitmap of failed
    /// entries by sub-index. With `close_files` the retained handles are
    /// dropped afterwards (final flush on shutdown).
    pub fn auto_process(&mut self, close_files: bool) -> u32 {
        let mut failed = 0u32;

        for entry in &mut self.entries {
            if !entry.attr.contains(StorageAttr::AUTO) || entry.file.is_none() {
                continue;
            }

            let data = entry.region.lock().unwrap();
            let crc = crc16_ccitt(&data, 0);
            if crc != entry.crc {
                let file = entry.file.as_mut().unwrap();
                let written = file
                    .seek(SeekFrom::Start(0))
                    .and_then(|_| file.write_all(&data))
                    .and_then(|_| file.write_u16::<LittleEndian>(crc))
                    .and_then(|_| file.flush());
                match written {
                    Ok(()) => entry.crc = crc,
                    Err(e) => {
                        warn!("{}: auto save failed: {}", entry.filename.display(), e);
                        failed |= 1u32 << entry.sub_index.min(31);
                    }
                }
            }
            drop(data);

            if close_files {
                entry.file = None;
            }
        }

        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> String {
        let path = std::env::temp_dir().join(format!("canopend-{}-{}", std::process::id(), name));
        let s = path.to_string_lossy().into_owned();
        let _ = std::fs::remove_file(&s);
        let _ = std::fs::remove_file(format!("{}.old", s));
        let _ = std::fs::remove_file(format!("{}.tmp", s));
        s
    }

    #[test]
    fn crc_known_vector() {
        assert_eq!(crc16_ccitt(b"123456789", 0), 0x31C3);
        assert_eq!(crc16_ccitt(&[], 0), 0);
    }

    #[test]
    fn store_then_load_round_trips() {
        let file = scratch("roundtrip");
        let data = region(vec![1, 2, 3, 4, 5, 6, 7, 8]);

        let mut storage = Storage::new(vec![StorageEntry::new(
            &file,
            Arc::clone(&data),
            2,
            StorageAttr::CMD | StorageAttr::RESTORE,
        )]);
        // nothing on disk yet: defaults stay, degraded bit reported
        assert_eq!(storage.load().unwrap(), 1 << 2);

        storage.store(0).unwrap();
        assert_eq!(std::fs::read(&file).unwrap().len(), 10);

        *data.lock().unwrap() = vec![9; 8];
        storage.store(0).unwrap();

        // previous content was parked as .old
        let old = std::fs::read(format!("{}.old", file)).unwrap();
        assert_eq!(&old[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);

        // a fresh process image picks the stored bytes up again
        let reloaded = region(vec![0; 8]);
        let mut storage = Storage::new(vec![StorageEntry::new(
            &file,
            Arc::clone(&reloaded),
            2,
            StorageAttr::CMD | StorageAttr::RESTORE,
        )]);
        assert_eq!(storage.load().unwrap(), 0);
        assert_eq!(*reloaded.lock().unwrap(), vec![9; 8]);
    }

    #[test]
    fn restore_writes_sentinel_and_reports_degraded() {
        let file = scratch("restore");
        let data = region(vec![7; 4]);

        let mut storage = Storage::new(vec![StorageEntry::new(
            &file,
            Arc::clone(&data),
            3,
            StorageAttr::CMD | StorageAttr::RESTORE,
        )]);
        let _ = storage.load().unwrap();
        storage.store(0).unwrap();

        storage.restore(0).unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"-\n");

        let fresh = region(vec![0xAB; 4]);
        let mut storage = Storage::new(vec![StorageEntry::new(
            &file,
            Arc::clone(&fresh),
            3,
            StorageAttr::CMD | StorageAttr::RESTORE,
        )]);
        assert_eq!(storage.load().unwrap(), 1 << 3);
        // defaults untouched
        assert_eq!(*fresh.lock().unwrap(), vec![0xAB; 4]);
    }

    #[test]
    fn corrupt_file_keeps_defaults() {
        let file = scratch("corrupt");
        std::fs::write(&file, b"garbage bytes").unwrap();

        let data = region(vec![1; 8]);
        let mut storage = Storage::new(vec![StorageEntry::new(
            &file,
            Arc::clone(&data),
            2,
            StorageAttr::CMD,
        )]);
        assert_eq!(storage.load().unwrap(), 1 << 2);
        assert_eq!(*data.lock().unwrap(), vec![1; 8]);

        // right length, wrong CRC
        let mut bad = vec![5u8; 8];
        bad.extend_from_slice(&[0x00, 0x00]);
        std::fs::write(&file, &bad).unwrap();
        let mut storage = Storage::new(vec![StorageEntry::new(
            &file,
            Arc::clone(&data),
            2,
            StorageAttr::CMD,
        )]);
        assert_eq!(storage.load().unwrap(), 1 << 2);
        assert_eq!(*data.lock().unwrap(), vec![1; 8]);
    }

    #[test]
    fn auto_process_saves_only_on_change() {
        let file = scratch("auto");
        let data = region(vec![0; 6]);

        let mut storage = Storage::new(vec![StorageEntry::new(
            &file,
            Arc::clone(&data),
            4,
            StorageAttr::AUTO,
        )]);
        let _ = storage.load().unwrap();

        // fresh file, region CRC (0-init vs entry.crc 0 over zeroes) differs
        data.lock().unwrap()[0] = 0x42;
        assert_eq!(storage.auto_process(false), 0);

        let on_disk = std::fs::read(&file).unwrap();
        assert_eq!(on_disk.len(), 8);
        assert_eq!(on_disk[0], 0x42);
        let crc = crc16_ccitt(&on_disk[..6], 0);
        assert_eq!(&on_disk[6..], &crc.to_le_bytes());

        // unchanged region: file stays identical
        assert_eq!(storage.auto_process(false), 0);
        assert_eq!(std::fs::read(&file).unwrap(), on_disk);

        // changed again, with close request
        data.lock().unwrap()[5] = 0x99;
        assert_eq!(storage.auto_process(true), 0);
        let on_disk = std::fs::read(&file).unwrap();
        assert_eq!(on_disk[5], 0x99);

        // reload sees the auto-saved content
        let fresh = region(vec![0; 6]);
        let mut storage = Storage::new(vec![StorageEntry::new(
            &file,
            Arc::clone(&fresh),
            4,
            StorageAttr::AUTO,
        )]);
        assert_eq!(storage.load().unwrap(), 0);
        assert_eq!(fresh.lock().unwrap()[5], 0x99);
    }

    #[test]
    fn prefix_is_prepended_verbatim() {
        let data = region(vec![0; 4]);
        let mut storage = Storage::new(vec![StorageEntry::new(
            "node.persist",
            data,
            2,
            StorageAttr::CMD,
        )]);
        storage.apply_prefix("/tmp/prefix-");
        assert_eq!(
            storage.entries()[0].filename().to_string_lossy(),
            "/tmp/prefix-node.persist"
        );
    }

    #[test]
    fn empty_storage_is_an_argument_error() {
        let mut storage = Storage::new(Vec::new());
        assert!(matches!(storage.load(), Err(DriverError::IllegalArgument)));
    }
}
