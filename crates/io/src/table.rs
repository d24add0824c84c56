use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::marker::PhantomData;

/// Errors returned by [`ResourceTable`] operations.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    #[error("table has no free keys")]
    Full,
    #[error("value not present")]
    NotPresent,
    #[error("value is of another type")]
    WrongType,
    #[error("borrowed handle cannot remove its resource")]
    NotOwned,
}

/// A typed handle to an entry of a [`ResourceTable`].
///
/// The `rep` is the opaque integer handed out to guests. Zero is never a
/// valid `rep`. Owned handles may remove their entry; borrowed handles may
/// only look at it.
pub struct Resource<T> {
    rep: u32,
    owned: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Resource<T> {
    pub fn new_own(rep: u32) -> Self {
        Resource {
            rep,
            owned: true,
            _marker: PhantomData,
        }
    }

    pub fn new_borrow(rep: u32) -> Self {
        Resource {
            rep,
            owned: false,
            _marker: PhantomData,
        }
    }

    pub fn rep(&self) -> u32 {
        self.rep
    }

    pub fn owned(&self) -> bool {
        self.owned
    }

    /// Returns a borrowed handle to the same entry.
    pub fn borrowed(&self) -> Resource<T> {
        Resource::new_borrow(self.rep)
    }
}

impl<T> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.owned { "own" } else { "borrow" };
        f.debug_struct("Resource")
            .field("rep", &self.rep)
            .field("kind", &kind)
            .finish()
    }
}

// Handles pack a slot index (plus one, so that zero stays invalid) into the
// low bits and the slot's generation into the high bits. A handle to a freed
// slot therefore never aliases whatever is stored there next.
const INDEX_BITS: u32 = 20;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = u32::MAX >> INDEX_BITS;
const MAX_ENTRIES: usize = INDEX_MASK as usize;

fn encode(index: usize, generation: u32) -> u32 {
    debug_assert!(index < MAX_ENTRIES);
    (generation << INDEX_BITS) | (index as u32 + 1)
}

fn decode(rep: u32) -> Option<(usize, u32)> {
    match rep & INDEX_MASK {
        0 => None,
        low => Some(((low - 1) as usize, rep >> INDEX_BITS)),
    }
}

enum Slot {
    Free {
        generation: u32,
        next_free: Option<usize>,
    },
    Occupied {
        generation: u32,
        entry: TableEntry,
    },
}

/// Parent and child links for a given table entry, by `rep`.
///
/// A parent can only be assigned when the entry is created and must exist at
/// that point. Deleting a parent detaches its children rather than deleting
/// them; a detached child keeps working until it needs its parent again.
struct TableEntry {
    entry: Box<dyn Any + Send>,
    parent: Option<u32>,
    children: BTreeSet<u32>,
}

impl TableEntry {
    fn new(entry: Box<dyn Any + Send>, parent: Option<u32>) -> Self {
        Self {
            entry,
            parent,
            children: BTreeSet::new(),
        }
    }
}

/// Maps `u32` handles to host resources of any type.
///
/// Slots of removed entries are recycled through a free list. Every access
/// validates the handle's generation, so stale handles fail with
/// [`TableError::NotPresent`] instead of reaching a recycled slot.
pub struct ResourceTable {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    occupied: usize,
}

impl ResourceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        ResourceTable {
            slots: Vec::new(),
            free_head: None,
            occupied: 0,
        }
    }

    /// Create an empty table with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        ResourceTable {
            slots: Vec::with_capacity(capacity.min(MAX_ENTRIES)),
            free_head: None,
            occupied: 0,
        }
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Inserts a new value `T` into this table, returning a corresponding
    /// owned `Resource<T>` which can be used to refer to it after it was
    /// inserted.
    pub fn push<T>(&mut self, entry: T) -> Result<Resource<T>, TableError>
    where
        T: Send + 'static,
    {
        let rep = self.push_(TableEntry::new(Box::new(entry), None))?;
        Ok(Resource::new_own(rep))
    }

    /// Insert a resource at the next available index, and track that it has
    /// a parent resource.
    ///
    /// The parent must exist to create a child. Children hold their parent
    /// by handle, which lets a child reach into its parent's table entry
    /// without shared ownership of the parent.
    pub fn push_child<T, U>(
        &mut self,
        entry: T,
        parent: &Resource<U>,
    ) -> Result<Resource<T>, TableError>
    where
        T: Send + 'static,
        U: 'static,
    {
        let parent = parent.rep();
        self.occupied_mut(parent)?;
        let child = self.push_(TableEntry::new(Box::new(entry), Some(parent)))?;
        self.occupied_mut(parent)?.children.insert(child);
        Ok(Resource::new_own(child))
    }

    fn push_(&mut self, entry: TableEntry) -> Result<u32, TableError> {
        if let Some(index) = self.free_head {
            let generation = match self.slots[index] {
                Slot::Free {
                    generation,
                    next_free,
                } => {
                    self.free_head = next_free;
                    generation
                }
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            self.slots[index] = Slot::Occupied { generation, entry };
            self.occupied += 1;
            return Ok(encode(index, generation));
        }
        let index = self.slots.len();
        if index >= MAX_ENTRIES {
            return Err(TableError::Full);
        }
        self.slots.push(Slot::Occupied {
            generation: 0,
            entry,
        });
        self.occupied += 1;
        Ok(encode(index, 0))
    }

    fn occupied_ref(&self, rep: u32) -> Result<&TableEntry, TableError> {
        let (index, generation) = decode(rep).ok_or(TableError::NotPresent)?;
        match self.slots.get(index) {
            Some(Slot::Occupied {
                generation: g,
                entry,
            }) if *g == generation => Ok(entry),
            _ => Err(TableError::NotPresent),
        }
    }

    fn occupied_mut(&mut self, rep: u32) -> Result<&mut TableEntry, TableError> {
        let (index, generation) = decode(rep).ok_or(TableError::NotPresent)?;
        match self.slots.get_mut(index) {
            Some(Slot::Occupied {
                generation: g,
                entry,
            }) if *g == generation => Ok(entry),
            _ => Err(TableError::NotPresent),
        }
    }

    /// Returns whether `rep` currently refers to a live entry.
    pub fn contains(&self, rep: u32) -> bool {
        self.occupied_ref(rep).is_ok()
    }

    /// Get an immutable reference to a resource of a given type at a given
    /// index.
    pub fn get<T: Any + Sized>(&self, key: &Resource<T>) -> Result<&T, TableError> {
        self.occupied_ref(key.rep())?
            .entry
            .downcast_ref()
            .ok_or(TableError::WrongType)
    }

    /// Get an mutable reference to a resource of a given type at a given
    /// index.
    pub fn get_mut<T: Any + Sized>(&mut self, key: &Resource<T>) -> Result<&mut T, TableError> {
        self.get_any_mut(key.rep())?
            .downcast_mut()
            .ok_or(TableError::WrongType)
    }

    /// Returns the raw `Any` at the `key` index provided.
    pub fn get_any_mut(&mut self, key: u32) -> Result<&mut dyn Any, TableError> {
        let entry = self.occupied_mut(key)?;
        Ok(&mut *entry.entry)
    }

    /// Removes the entry behind an owned handle, returning its payload so the
    /// caller can run any resource-specific teardown.
    pub fn delete<T>(&mut self, resource: Resource<T>) -> Result<T, TableError>
    where
        T: Any,
    {
        if !resource.owned() {
            return Err(TableError::NotOwned);
        }
        let rep = resource.rep();
        if !self.occupied_ref(rep)?.entry.is::<T>() {
            return Err(TableError::WrongType);
        }
        let entry = self.delete_entry(rep)?;
        match entry.entry.downcast() {
            Ok(t) => Ok(*t),
            Err(_) => Err(TableError::WrongType),
        }
    }

    /// Like [`delete`](Self::delete), except that a handle whose entry is
    /// already gone yields `Ok(None)`. Resource drops go through this so
    /// that dropping twice is harmless.
    pub fn delete_if_present<T>(&mut self, resource: Resource<T>) -> Result<Option<T>, TableError>
    where
        T: Any,
    {
        let rep = resource.rep();
        match self.delete(resource) {
            Ok(value) => Ok(Some(value)),
            Err(TableError::NotPresent) => {
                tracing::debug!(rep, "drop of a resource that is already gone");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn delete_entry(&mut self, rep: u32) -> Result<TableEntry, TableError> {
        self.occupied_ref(rep)?;
        let (index, generation) = decode(rep).ok_or(TableError::NotPresent)?;
        let freed = Slot::Free {
            generation: (generation + 1) & GENERATION_MASK,
            next_free: self.free_head,
        };
        let entry = match std::mem::replace(&mut self.slots[index], freed) {
            Slot::Occupied { entry, .. } => entry,
            Slot::Free { .. } => unreachable!("slot validated as occupied above"),
        };
        self.free_head = Some(index);
        self.occupied -= 1;

        if let Some(parent) = entry.parent {
            if let Ok(parent) = self.occupied_mut(parent) {
                parent.children.remove(&rep);
            }
        }
        for child in entry.children.iter() {
            if let Ok(child) = self.occupied_mut(*child) {
                tracing::debug!(parent = rep, "detaching child of deleted resource");
                child.parent = None;
            }
        }
        Ok(entry)
    }

    /// Zip the values of the map with mutable references to table entries
    /// corresponding to each key. As the keys in the [`HashMap`] are unique,
    /// this iterator can give mutable references with the same lifetime as
    /// the mutable reference to the [`ResourceTable`].
    pub fn iter_entries<'a, T>(
        &'a mut self,
        map: HashMap<u32, T>,
    ) -> impl Iterator<Item = (Result<&'a mut dyn Any, TableError>, T)> + 'a
    where
        T: 'a,
    {
        let mut wanted = BTreeMap::new();
        let mut missing = Vec::new();
        for (rep, value) in map {
            match decode(rep) {
                Some((index, _)) if self.contains(rep) => {
                    wanted.insert(index, value);
                }
                _ => missing.push(value),
            }
        }

        let mut found = Vec::with_capacity(wanted.len());
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(value) = wanted.remove(&index) else {
                continue;
            };
            match slot {
                Slot::Occupied { entry, .. } => {
                    let item: &'a mut dyn Any = &mut *entry.entry;
                    found.push((Ok(item), value));
                }
                Slot::Free { .. } => found.push((Err(TableError::NotPresent), value)),
            }
        }

        found
            .into_iter()
            .chain(missing.into_iter().map(|v| (Err(TableError::NotPresent), v)))
    }

    /// Iterate over all children belonging to the provided parent.
    pub fn iter_children<T>(
        &self,
        parent: &Resource<T>,
    ) -> Result<impl Iterator<Item = &(dyn Any + Send)>, TableError>
    where
        T: 'static,
    {
        let parent = self.occupied_ref(parent.rep())?;
        Ok(parent
            .children
            .iter()
            .filter_map(|child| self.occupied_ref(*child).ok())
            .map(|child| child.entry.as_ref()))
    }

    /// Returns the parent `rep` of an entry, if it still has one.
    pub fn parent_of<T>(&self, child: &Resource<T>) -> Result<Option<u32>, TableError> {
        Ok(self.occupied_ref(child.rep())?.parent)
    }
}

impl Default for ResourceTable {
    fn default() -> Self {
        ResourceTable::new()
    }
}

impl fmt::Debug for ResourceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTable")
            .field("len", &self.occupied)
            .field("slots", &self.slots.len())
            .finish()
    }
}
