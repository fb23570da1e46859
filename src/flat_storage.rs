/// FlatStorage works similar to a map. Each element is assigned an ID/key (index in Vec) of
/// usize type when inserting. The key is used to read/modify/remove the element, and doubles
/// as the poll-event key for the socket registered under it.
/// Freed slots are recycled through an intrusive free list.
pub struct FlatStorage<T> {
    data: Vec<AllocNode<T>>,
    free: usize,
}

const INVALID_ID: usize = usize::MAX;

enum AllocNode<T> {
    Vacant(usize), // next slot index
    Occupied(T),
}

impl<T> FlatStorage<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            free: INVALID_ID,
        }
    }
    /// return the key assigned to new added element.
    pub fn add(&mut self, val: T) -> usize {
        if self.free == INVALID_ID {
            self.data.push(AllocNode::<T>::Occupied(val));
            self.data.len() - 1
        } else {
            let key = self.free;
            match self.data[key] {
                AllocNode::<T>::Vacant(next) => {
                    self.free = next;
                }
                AllocNode::<T>::Occupied(_) => {
                    panic!("Expecting vacant slot pointed by free list.");
                }
            }
            self.data[key] = AllocNode::<T>::Occupied(val);
            key
        }
    }

    /// Remove and return the element at `key`, if occupied.
    pub fn take(&mut self, key: usize) -> Option<T> {
        if key < self.data.len() {
            if matches!(self.data[key], AllocNode::<T>::Occupied(_)) {
                let node = std::mem::replace(&mut self.data[key], AllocNode::<T>::Vacant(self.free));
                self.free = key;
                if let AllocNode::<T>::Occupied(val) = node {
                    return Some(val);
                }
            }
        }
        None
    }

    pub fn get(&self, key: usize) -> Option<&T> {
        if key < self.data.len() {
            if let AllocNode::<T>::Occupied(ref val) = self.data[key] {
                return Some(val);
            }
        }
        None
    }
    /// Keys of all occupied slots. Used to drain every live handler at shutdown.
    pub fn keys(&self) -> Vec<usize> {
        self.data
            .iter()
            .enumerate()
            .filter_map(|(i, node)| match node {
                AllocNode::<T>::Occupied(_) => Some(i),
                AllocNode::<T>::Vacant(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    #[test]
    pub fn test_flat_storage() {
        let mut storage = FlatStorage::<i32>::new();
        let a = storage.add(10);
        let b = storage.add(20);
        assert_eq!(storage.get(a), Some(&10));
        assert_eq!(storage.take(a), Some(10));
        assert_eq!(storage.get(a), None);
        // freed slot is recycled.
        let c = storage.add(30);
        assert_eq!(c, a);
        let mut keys = storage.keys();
        keys.sort();
        assert_eq!(keys, vec![a, b]);
        assert_eq!(storage.take(12345), None);
    }
}
