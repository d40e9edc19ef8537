//! Debuggee thread records.

use crate::port::RawHandle;

/// One live thread in the debuggee.
#[derive(Debug, Clone)]
pub struct Thread {
    pub handle: RawHandle,
    pub id: u32,
    pub start_address: u64,
    /// Thread environment block / thread-local storage base.
    pub teb_base: u64,
}

impl Thread {
    pub fn new(handle: RawHandle, id: u32, start_address: u64, teb_base: u64) -> Self {
        Thread {
            handle,
            id,
            start_address,
            teb_base,
        }
    }
}
