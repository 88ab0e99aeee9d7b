//! Resource Table
//!
//! Per-process table of open resources addressed by small integer
//! handles. Tables are reference counted and shared only through
//! explicit duplication (fork) or by passing one to `create`.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::fs::OpenFile;
use crate::process::Process;
use crate::sync::Semaphore;

/// Index into a resource table.
pub type Handle = u32;

/// Something a process can hold open.
#[derive(Clone)]
pub enum Resource {
    File(Arc<OpenFile>),
    Semaphore(Arc<Semaphore>),
    Process(Arc<Process>),
}

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Resource::File(_) => "file",
            Resource::Semaphore(_) => "semaphore",
            Resource::Process(_) => "process",
        }
    }
}

/// Bounded table of open resources.
pub struct ResourceTable {
    slots: Mutex<Vec<Option<Resource>>>,
    capacity: usize,
}

impl ResourceTable {
    pub fn new(capacity: usize) -> Self {
        ResourceTable {
            slots: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store `resource` in the lowest free slot.
    pub fn open(&self, resource: Resource) -> KernelResult<Handle> {
        let mut slots = self.slots.lock();
        if let Some(free) = slots.iter().position(Option::is_none) {
            slots[free] = Some(resource);
            return Ok(free as Handle);
        }
        if slots.len() >= self.capacity {
            return Err(KernelError::TableFull);
        }
        slots.push(Some(resource));
        Ok((slots.len() - 1) as Handle)
    }

    pub fn get(&self, handle: Handle) -> KernelResult<Resource> {
        self.slots
            .lock()
            .get(handle as usize)
            .and_then(Option::clone)
            .ok_or(KernelError::InvalidId)
    }

    pub fn get_file(&self, handle: Handle) -> KernelResult<Arc<OpenFile>> {
        match self.get(handle)? {
            Resource::File(file) => Ok(file),
            _ => Err(KernelError::InvalidId),
        }
    }

    pub fn get_semaphore(&self, handle: Handle) -> KernelResult<Arc<Semaphore>> {
        match self.get(handle)? {
            Resource::Semaphore(sem) => Ok(sem),
            _ => Err(KernelError::InvalidId),
        }
    }

    pub fn get_process(&self, handle: Handle) -> KernelResult<Arc<Process>> {
        match self.get(handle)? {
            Resource::Process(p) => Ok(p),
            _ => Err(KernelError::InvalidId),
        }
    }

    /// Release one handle.
    pub fn close(&self, handle: Handle) -> KernelResult<()> {
        let released = {
            let mut slots = self.slots.lock();
            slots.get_mut(handle as usize).and_then(Option::take)
        };
        match released {
            Some(_) => Ok(()),
            None => Err(KernelError::InvalidId),
        }
    }

    /// Release every handle. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let released: Vec<Resource> = {
            let mut slots = self.slots.lock();
            core::mem::take(&mut *slots).into_iter().flatten().collect()
        };
        released.len()
    }

    /// New table holding the same resources under the same handles.
    pub fn duplicate(&self) -> ResourceTable {
        ResourceTable {
            slots: Mutex::new(self.slots.lock().clone()),
            capacity: self.capacity,
        }
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
