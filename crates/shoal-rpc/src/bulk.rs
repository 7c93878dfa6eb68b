use bytes::Bytes;
use proto_shoal::messages::BulkRef;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Buffers this endpoint has registered for the peer to pull from or push
/// into. A registration yields a [`BulkHandle`] whose wire form ([`BulkRef`])
/// the peer echoes back in pull/push frames. The registration must outlive
/// the transfer; `once` registrations drop themselves when fully pulled.
pub struct BulkRegistry {
    next: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
}

enum Entry {
    ReadOnly { data: Bytes, once: bool },
    Writable { data: Vec<u8> },
}

#[derive(Debug, Clone, Copy)]
pub struct BulkHandle {
    pub region: u64,
    pub len: u64,
}

impl BulkHandle {
    pub fn as_ref(&self) -> BulkRef {
        BulkRef {
            region: self.region,
            len: self.len,
        }
    }
}

impl BulkRegistry {
    pub fn new() -> BulkRegistry {
        BulkRegistry {
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a read-only buffer the peer may pull.
    pub fn register_ro(&self, data: Bytes) -> BulkHandle {
        self.insert_ro(data, false)
    }

    /// Register a read-only buffer released automatically once the peer has
    /// pulled its last byte. Used when the handler responds before the pull
    /// happens, so nobody is left around to unregister.
    pub fn register_ro_once(&self, data: Bytes) -> BulkHandle {
        self.insert_ro(data, true)
    }

    fn insert_ro(&self, data: Bytes, once: bool) -> BulkHandle {
        let region = self.next.fetch_add(1, Ordering::Relaxed);
        let len = data.len() as u64;
        self.entries
            .lock()
            .unwrap()
            .insert(region, Entry::ReadOnly { data, once });
        BulkHandle { region, len }
    }

    /// Register a zeroed writable buffer of `len` bytes the peer may push
    /// into. Retrieve it with [`Self::take`] after the peer's response.
    pub fn register_rw(&self, len: usize) -> BulkHandle {
        let region = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap()
            .insert(region, Entry::Writable { data: vec![0; len] });
        BulkHandle {
            region,
            len: len as u64,
        }
    }

    /// Remove a writable registration and hand back its contents.
    pub fn take(&self, handle: BulkHandle) -> Option<Vec<u8>> {
        match self.entries.lock().unwrap().remove(&handle.region)? {
            Entry::Writable { data } => Some(data),
            Entry::ReadOnly { .. } => None,
        }
    }

    pub fn unregister(&self, handle: BulkHandle) {
        self.entries.lock().unwrap().remove(&handle.region);
    }

    /// Serve a peer's pull. Returns the requested slice, or `None` when the
    /// region is unknown or the range is out of bounds. Drops `once`
    /// registrations when the pull reaches their end.
    pub(crate) fn read(&self, region: u64, offset: u64, len: u64) -> Option<Bytes> {
        let mut entries = self.entries.lock().unwrap();
        let (data, once) = match entries.get(&region)? {
            Entry::ReadOnly { data, once } => (data.clone(), *once),
            Entry::Writable { .. } => return None,
        };

        let end = offset.checked_add(len)?;
        if end > data.len() as u64 {
            return None;
        }
        let slice = data.slice(offset as usize..end as usize);

        if once && end == data.len() as u64 {
            entries.remove(&region);
        }
        Some(slice)
    }

    /// Serve a peer's push. Returns false when the region is unknown, not
    /// writable, or the write would run past its end.
    pub(crate) fn write(&self, region: u64, offset: u64, chunk: &[u8]) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(Entry::Writable { data }) = entries.get_mut(&region) else {
            return false;
        };
        let Some(end) = (offset as usize).checked_add(chunk.len()) else {
            return false;
        };
        if end > data.len() {
            return false;
        }
        data[offset as usize..end].copy_from_slice(chunk);
        true
    }
}

impl Default for BulkRegistry {
    fn default() -> BulkRegistry {
        BulkRegistry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pull_serves_slices_and_once_unregisters() {
        let registry = BulkRegistry::new();
        let handle = registry.register_ro_once(Bytes::from_static(b"0123456789"));

        assert_eq!(registry.read(handle.region, 2, 3).unwrap().as_ref(), b"234");
        // Not yet pulled to the end, so the registration survives.
        assert!(registry.read(handle.region, 0, 1).is_some());
        assert_eq!(
            registry.read(handle.region, 5, 5).unwrap().as_ref(),
            b"56789"
        );
        assert!(registry.read(handle.region, 0, 1).is_none());
    }

    #[test]
    fn push_is_bounded_and_taken_once() {
        let registry = BulkRegistry::new();
        let handle = registry.register_rw(8);

        assert!(registry.write(handle.region, 0, b"abcd"));
        assert!(registry.write(handle.region, 4, b"efgh"));
        assert!(!registry.write(handle.region, 6, b"xyz"));

        assert_eq!(registry.take(handle).unwrap(), b"abcdefgh");
        assert!(registry.take(handle).is_none());
    }

    #[test]
    fn out_of_bounds_pull_is_refused() {
        let registry = BulkRegistry::new();
        let handle = registry.register_ro(Bytes::from_static(b"abc"));
        assert!(registry.read(handle.region, 2, 2).is_none());
        assert!(registry.read(999, 0, 1).is_none());
    }
}
