//! Station credentials and their flash record.
//!
//! One fixed-layout record lives at the start of a reserved sector:
//!
//! | offset | size | field                       |
//! |--------|------|-----------------------------|
//! | 0      | 4    | magic, little endian        |
//! | 4      | 1    | ssid length                 |
//! | 5      | 1    | password length             |
//! | 6      | 2    | padding                     |
//! | 8      | 32   | ssid                        |
//! | 40     | 64   | password                    |
//! | 104    | 4    | CRC-32 of bytes 0..104, LE  |
use arrayvec::ArrayVec;
use crc::{CRC_32_ISO_HDLC, Crc};
use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};
use thiserror::Error;

pub const SSID_MAX: usize = 32;
pub const PASSWORD_MAX: usize = 64;
pub const RECORD_LEN: usize = 108;

const RECORD_MAGIC: u32 = 0x4842_4643;
const SSID_AT: usize = 8;
const PASSWORD_AT: usize = SSID_AT + SSID_MAX;
const CRC_AT: usize = PASSWORD_AT + PASSWORD_MAX;
const RECORD_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("flash access failed: {0:?}")]
    Flash(NorFlashErrorKind),
    #[error("ssid is longer than 32 bytes")]
    SsidTooLong,
    #[error("password is longer than 64 bytes")]
    PasswordTooLong,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StationCredentials {
    ssid: ArrayVec<u8, SSID_MAX>,
    password: ArrayVec<u8, PASSWORD_MAX>,
}

impl StationCredentials {
    pub fn new(ssid: &[u8], password: &[u8]) -> Result<Self, CredentialError> {
        let ssid = ArrayVec::try_from(ssid).map_err(|_| CredentialError::SsidTooLong)?;
        let password =
            ArrayVec::try_from(password).map_err(|_| CredentialError::PasswordTooLong)?;
        Ok(StationCredentials { ssid, password })
    }

    /// Builds credentials from decoded form fields, dropping whatever does not fit.
    pub fn from_parts(ssid: ArrayVec<u8, SSID_MAX>, password: ArrayVec<u8, PASSWORD_MAX>) -> Self {
        StationCredentials { ssid, password }
    }

    pub fn ssid(&self) -> &[u8] {
        &self.ssid
    }

    pub fn password(&self) -> &[u8] {
        &self.password
    }

    /// The SSID as text. Radio configuration needs UTF-8.
    pub fn ssid_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.ssid).ok()
    }

    pub fn password_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.password).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.ssid.is_empty()
    }

    pub fn to_record(&self) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        record[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        record[4] = self.ssid.len() as u8;
        record[5] = self.password.len() as u8;
        record[SSID_AT..SSID_AT + self.ssid.len()].copy_from_slice(&self.ssid);
        record[PASSWORD_AT..PASSWORD_AT + self.password.len()].copy_from_slice(&self.password);
        let crc = RECORD_CRC.checksum(&record[..CRC_AT]);
        record[CRC_AT..].copy_from_slice(&crc.to_le_bytes());
        record
    }

    /// Decodes a record. Erased, foreign or corrupted sectors yield `None`.
    pub fn from_record(record: &[u8; RECORD_LEN]) -> Option<Self> {
        let magic = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        if magic != RECORD_MAGIC {
            return None;
        }
        let stored_crc = u32::from_le_bytes([
            record[CRC_AT],
            record[CRC_AT + 1],
            record[CRC_AT + 2],
            record[CRC_AT + 3],
        ]);
        if RECORD_CRC.checksum(&record[..CRC_AT]) != stored_crc {
            return None;
        }

        let ssid_len = usize::from(record[4]);
        let password_len = usize::from(record[5]);
        if ssid_len > SSID_MAX || password_len > PASSWORD_MAX {
            return None;
        }
        StationCredentials::new(
            &record[SSID_AT..SSID_AT + ssid_len],
            &record[PASSWORD_AT..PASSWORD_AT + password_len],
        )
        .ok()
    }
}

/// The credential sector on NOR flash.
pub struct CredentialStore<F> {
    flash: F,
    offset: u32,
}

impl<F: NorFlash> CredentialStore<F> {
    /// `offset` must be the start of an erase sector.
    pub fn new(flash: F, offset: u32) -> Self {
        CredentialStore { flash, offset }
    }

    pub fn load(&mut self) -> Result<Option<StationCredentials>, CredentialError> {
        let mut record = [0u8; RECORD_LEN];
        self.flash
            .read(self.offset, &mut record)
            .map_err(|err| CredentialError::Flash(err.kind()))?;
        Ok(StationCredentials::from_record(&record))
    }

    /// Erases the sector, then writes the record.
    pub fn store(&mut self, credentials: &StationCredentials) -> Result<(), CredentialError> {
        self.erase()?;
        self.flash
            .write(self.offset, &credentials.to_record())
            .map_err(|err| CredentialError::Flash(err.kind()))
    }

    pub fn erase(&mut self) -> Result<(), CredentialError> {
        self.flash
            .erase(self.offset, self.offset + F::ERASE_SIZE as u32)
            .map_err(|err| CredentialError::Flash(err.kind()))
    }

    pub fn into_inner(self) -> F {
        self.flash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_storage::nor_flash::{ErrorType, ReadNorFlash};

    const SECTOR: usize = 4096;

    /// NOR semantics: erase sets bits, writes can only clear them.
    struct MemFlash {
        bytes: std::vec::Vec<u8>,
        erases: usize,
    }

    impl MemFlash {
        fn new() -> Self {
            MemFlash {
                bytes: std::vec![0xFF; SECTOR * 2],
                erases: 0,
            }
        }
    }

    impl ErrorType for MemFlash {
        type Error = NorFlashErrorKind;
    }

    impl ReadNorFlash for MemFlash {
        const READ_SIZE: usize = 1;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start + bytes.len();
            if end > self.bytes.len() {
                return Err(NorFlashErrorKind::OutOfBounds);
            }
            bytes.copy_from_slice(&self.bytes[start..end]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.bytes.len()
        }
    }

    impl NorFlash for MemFlash {
        const WRITE_SIZE: usize = 4;
        const ERASE_SIZE: usize = SECTOR;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            if from as usize % SECTOR != 0 || to as usize % SECTOR != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            self.bytes[from as usize..to as usize].fill(0xFF);
            self.erases += 1;
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            let start = offset as usize;
            for (cell, byte) in self.bytes[start..start + bytes.len()].iter_mut().zip(bytes) {
                *cell &= *byte;
            }
            Ok(())
        }
    }

    #[test]
    fn record_round_trips_through_flash() {
        let mut store = CredentialStore::new(MemFlash::new(), SECTOR as u32);
        let credentials = StationCredentials::new(b"net", b"pw").unwrap();

        store.store(&credentials).unwrap();
        let loaded = store.load().unwrap().unwrap();

        assert_eq!(loaded.ssid(), b"net");
        assert_eq!(loaded.password(), b"pw");
        assert_eq!(loaded.ssid_str(), Some("net"));
    }

    #[test]
    fn overwriting_erases_first() {
        let mut store = CredentialStore::new(MemFlash::new(), 0);
        store
            .store(&StationCredentials::new(b"first-network", b"a long password").unwrap())
            .unwrap();
        store
            .store(&StationCredentials::new(b"second", b"pw2").unwrap())
            .unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, StationCredentials::new(b"second", b"pw2").unwrap());
        assert_eq!(store.into_inner().erases, 2);
    }

    #[test]
    fn erased_sector_reads_as_empty() {
        let mut store = CredentialStore::new(MemFlash::new(), 0);
        assert_eq!(store.load(), Ok(None));

        store
            .store(&StationCredentials::new(b"net", b"pw").unwrap())
            .unwrap();
        store.erase().unwrap();
        assert_eq!(store.load(), Ok(None));
    }

    #[test]
    fn corrupted_record_is_rejected() {
        let mut record = StationCredentials::new(b"net", b"pw").unwrap().to_record();
        record[SSID_AT] ^= 0x01;
        assert_eq!(StationCredentials::from_record(&record), None);
    }

    #[test]
    fn oversized_fields_are_refused() {
        assert_eq!(
            StationCredentials::new(&[b'a'; 33], b""),
            Err(CredentialError::SsidTooLong)
        );
        assert_eq!(
            StationCredentials::new(b"net", &[b'p'; 65]),
            Err(CredentialError::PasswordTooLong)
        );
        let longest = StationCredentials::new(&[b's'; 32], &[b'p'; 64]).unwrap();
        assert_eq!(StationCredentials::from_record(&longest.to_record()), Some(longest));
    }

    #[test]
    fn misaligned_offset_surfaces_a_flash_error() {
        let mut store = CredentialStore::new(MemFlash::new(), 100);
        assert_eq!(
            store.erase(),
            Err(CredentialError::Flash(NorFlashErrorKind::NotAligned))
        );
    }
}
