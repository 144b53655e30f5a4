//! Device buffers and their host-visible mirrors.
//!
//! Buffers are owned by a [`BufferRegistry`] for the lifetime of a run;
//! drivers and kernels hold borrows (cheap clones of the same allocation).
//! Host access goes through scoped maps which release the mapping on every
//! exit path. The platform does not guarantee zeroed memory elsewhere, so
//! buffers are zero-filled on creation here.

use crate::error::Error;
use crate::error::Result;
use std::any::Any;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

/// A device memory object holding `len` elements of `T`.
pub struct Buffer<T> {
    name: Arc<str>,
    data: Arc<RwLock<Vec<T>>>,
}

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            data: self.data.clone(),
        }
    }
}

impl<T: Copy + Default> Buffer<T> {
    fn new(name: &str, len: usize) -> Self {
        Self {
            name: Arc::from(name),
            data: Arc::new(RwLock::new(vec![T::default(); len])),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        match self.data.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Map for host reading. The mapping is released when the guard drops.
    pub fn map(&self) -> Result<MapRef<'_, T>> {
        self.data
            .read()
            .map(MapRef)
            .map_err(|_| Error::Library(format!("mapping buffer '{}' for reading", self.name)))
    }

    /// Map for host writing. The mapping is released when the guard drops.
    pub fn map_mut(&self) -> Result<MapMut<'_, T>> {
        self.data
            .write()
            .map(MapMut)
            .map_err(|_| Error::Library(format!("mapping buffer '{}' for writing", self.name)))
    }
}

/// Scoped read mapping.
pub struct MapRef<'a, T>(RwLockReadGuard<'a, Vec<T>>);

impl<T> Deref for MapRef<'_, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.0
    }
}

/// Scoped write mapping.
pub struct MapMut<'a, T>(RwLockWriteGuard<'a, Vec<T>>);

impl<T> Deref for MapMut<'_, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T> DerefMut for MapMut<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.0
    }
}

/// A single host-pinned record, mapped once and reused across ticks.
/// Device-side reads copy into it; the host copies out after the read
/// event completes.
pub struct Pinned<T> {
    slot: Arc<Mutex<T>>,
}

impl<T> Clone for Pinned<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Copy + Default> Pinned<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(T::default())),
        }
    }

    pub fn store(&self, value: T) {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = value;
    }

    pub fn load(&self) -> T {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl<T: Copy + Default> Default for Pinned<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct Entry {
    name: String,
    bytes: usize,
    hold: Box<dyn Any>,
}

/// Owns every device buffer of a run, in allocation order. Teardown
/// releases them in reverse.
#[derive(Default)]
pub struct BufferRegistry {
    entries: Vec<Entry>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zero-filled buffer and register it for teardown.
    pub fn create<T: Copy + Default + 'static>(&mut self, name: &str, len: usize) -> Buffer<T> {
        let buffer = Buffer::<T>::new(name, len);
        log::debug!(
            "buffer '{}': {} x {} bytes",
            name,
            len,
            std::mem::size_of::<T>()
        );
        self.entries.push(Entry {
            name: name.to_string(),
            bytes: len * std::mem::size_of::<T>(),
            hold: Box::new(buffer.clone()),
        });
        buffer
    }

    /// Total device memory held, in bytes.
    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.bytes).sum()
    }
}

impl Drop for BufferRegistry {
    fn drop(&mut self) {
        while let Some(entry) = self.entries.pop() {
            log::debug!("releasing buffer '{}' ({} bytes)", entry.name, entry.bytes);
            drop(entry.hold);
        }
    }
}
