// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared-memory zones.
//!
//! Declared at cycle init and mapped `MAP_SHARED | MAP_ANONYMOUS` before
//! any worker forks, so the whole process tree sees one mapping. The core
//! only owns the mapping lifecycle; zone-internal locking belongs to
//! whatever lives in the zone.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;

use nix::errno::Errno;
use nix::libc::c_void;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use quay_conf::ZoneConf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("zone \"{name}\" mmap of {size} bytes failed: {source}")]
    Map {
        name: String,
        size: usize,
        #[source]
        source: Errno,
    },

    #[error("zone \"{0}\" size must be positive")]
    EmptySize(String),
}

#[derive(Debug)]
struct Mapping {
    ptr: NonNull<c_void>,
    len: NonZeroUsize,
}

// The mapping is plain shared memory; the pointer itself is freely
// movable between threads.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len.get());
        }
    }
}

/// One mapped zone. Clones share the mapping; a reload carries zones with
/// an unchanged (name, size) into the next cycle instead of remapping.
#[derive(Debug, Clone)]
pub struct SharedZone {
    name: String,
    mapping: Arc<Mapping>,
}

impl SharedZone {
    pub fn map(conf: &ZoneConf) -> Result<Self, ZoneError> {
        let len = NonZeroUsize::new(conf.size).ok_or_else(|| ZoneError::EmptySize(conf.name.clone()))?;
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|source| ZoneError::Map { name: conf.name.clone(), size: conf.size, source })?;

        Ok(Self { name: conf.name.clone(), mapping: Arc::new(Mapping { ptr, len }) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.mapping.len.get()
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.mapping.ptr.as_ptr()
    }
}

#[cfg(test)]
#[path = "zone_tests.rs"]
mod tests;
