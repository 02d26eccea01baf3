//! Memory regions the application asks to have embedded in every dump

/// A region of the dumped process' memory, copied verbatim into the memory
/// list. The application owns the memory, the dumper only reads it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppMemory {
    pub ptr: usize,
    pub length: usize,
}

/// The registered regions, keyed by their start address
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AppMemoryList(Vec<AppMemory>);

impl AppMemoryList {
    /// Registers `length` bytes at `ptr`. Registering an already known `ptr`
    /// again is a no-op, the first length wins.
    pub fn register(&mut self, ptr: usize, length: usize) {
        if self.0.iter().any(|am| am.ptr == ptr) {
            return;
        }
        self.0.push(AppMemory { ptr, length });
    }

    /// Forgets the region starting at `ptr`, returns whether it was known
    pub fn unregister(&mut self, ptr: usize) -> bool {
        match self.0.iter().position(|am| am.ptr == ptr) {
            Some(idx) => {
                self.0.remove(idx);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, AppMemory> {
        self.0.iter()
    }
}

impl From<Vec<AppMemory>> for AppMemoryList {
    fn from(regions: Vec<AppMemory>) -> Self {
        let mut list = Self::default();
        for region in regions {
            list.register(region.ptr, region.length);
        }
        list
    }
}

impl<'a> IntoIterator for &'a AppMemoryList {
    type Item = &'a AppMemory;
    type IntoIter = std::slice::Iter<'a, AppMemory>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let mut list = AppMemoryList::default();
        list.register(0x1000, 16);
        list.register(0x1000, 32);
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().next().unwrap().length, 16);

        assert!(list.unregister(0x1000));
        assert!(!list.unregister(0x1000));
        assert!(list.is_empty());

        list.register(0x1000, 64);
        list.register(0x1000, 64);
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().next().unwrap().length, 64);
    }

    #[test]
    fn from_vec_drops_duplicates() {
        let list = AppMemoryList::from(vec![
            AppMemory { ptr: 1, length: 1 },
            AppMemory { ptr: 2, length: 2 },
            AppMemory { ptr: 1, length: 3 },
        ]);
        assert_eq!(list.len(), 2);
    }
}
