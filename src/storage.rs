//! The credential sector on the SPI flash, shared between tasks.
use alloc::boxed::Box;
use core::cell::RefCell;
use embassy_sync::blocking_mutex::{Mutex, raw::NoopRawMutex};
use esp_storage::FlashStorage;
use hbfc_core::credentials::{CredentialError, CredentialStore, StationCredentials};

use crate::config::CREDENTIALS_OFFSET;

pub type SharedCredentials = &'static Credentials;

pub struct Credentials {
    store: Mutex<NoopRawMutex, RefCell<CredentialStore<FlashStorage>>>,
}

pub fn init() -> SharedCredentials {
    let store = CredentialStore::new(FlashStorage::new(), CREDENTIALS_OFFSET);
    Box::leak(Box::new(Credentials {
        store: Mutex::new(RefCell::new(store)),
    }))
}

impl Credentials {
    /// `Ok(None)` when the sector holds no valid record.
    pub fn load(&self) -> Result<Option<StationCredentials>, CredentialError> {
        self.store.lock(|store| store.borrow_mut().load())
    }

    pub fn store(&self, credentials: &StationCredentials) -> Result<(), CredentialError> {
        self.store.lock(|store| store.borrow_mut().store(credentials))
    }

    pub fn erase(&self) -> Result<(), CredentialError> {
        self.store.lock(|store| store.borrow_mut().erase())
    }
}
