use std::collections::BTreeSet;

use crate::{Error, Result};

pub type ClientId = u16;

/// Hands out u16 client ids. The lowest released id is always reused first.
#[derive(Debug, Default)]
pub struct ClientIdAllocator {
    // Every id below this was handed out at some point.
    next: u32,
    free: BTreeSet<ClientId>,
}

impl ClientIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Result<ClientId> {
        if let Some(id) = self.free.pop_first() {
            return Ok(id);
        }
        let id = ClientId::try_from(self.next).map_err(|_| Error::Text("client ids exhausted"))?;
        self.next += 1;
        Ok(id)
    }

    /// Returns false if `id` wasn't allocated.
    pub fn release(&mut self, id: ClientId) -> bool {
        if u32::from(id) >= self.next || !self.free.insert(id) {
            return false;
        }
        // Shrink the high water mark so the free list stays small.
        while self.next > 0 {
            let top = (self.next - 1) as ClientId;
            if !self.free.remove(&top) {
                break;
            }
            self.next -= 1;
        }
        true
    }

    pub fn is_allocated(&self, id: ClientId) -> bool {
        u32::from(id) < self.next && !self.free.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.next as usize - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
