//! Arena-indexed intrusive doubly-linked list bounding a resource pool to a
//! fixed capacity. Deliberately not `Rc<RefCell<_>>` — nodes live in a single
//! `Vec`, linked by index, with a free-list so eviction doesn't leak slots.
//!
//! The list holds no opinion about what `owner` means; the caller (the
//! descriptor LRU in `engine::mod`) maps it back to a `FileItem`.

struct Node {
    prev: Option<usize>,
    next: Option<usize>,
    owner: usize,
}

pub struct Lru {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    cap: usize,
}

impl Lru {
    pub fn new(cap: usize) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            cap,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Inserts a new front node for `owner`, returning its handle.
    pub fn insert_front(&mut self, owner: usize) -> usize {
        let idx = match self.free.pop() {
            Some(i) => {
                self.nodes[i] = Node { prev: None, next: None, owner };
                i
            }
            None => {
                self.nodes.push(Node { prev: None, next: None, owner });
                self.nodes.len() - 1
            }
        };
        self.attach_front(idx);
        self.len += 1;
        idx
    }

    /// Moves an existing handle to the front (most-recently-used position).
    pub fn touch(&mut self, handle: usize) {
        self.detach(handle);
        self.attach_front(handle);
    }

    /// Evicts the least-recently-used node, returning its owner.
    pub fn pop_back(&mut self) -> Option<usize> {
        let idx = self.tail?;
        self.detach(idx);
        let owner = self.nodes[idx].owner;
        self.free.push(idx);
        self.len -= 1;
        Some(owner)
    }

    fn attach_front(&mut self, idx: usize) {
        self.nodes[idx].prev = None;
        self.nodes[idx].next = self.head;
        if let Some(h) = self.head {
            self.nodes[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_evict_respects_lru_order() {
        let mut lru = Lru::new(2);
        let a = lru.insert_front(1);
        let _b = lru.insert_front(2);
        assert_eq!(lru.len(), 2);
        lru.touch(a); // 1 becomes MRU, 2 becomes LRU
        let _c = lru.insert_front(3);
        assert_eq!(lru.len(), 3);
        // caller is responsible for popping back down to cap; verify order.
        assert_eq!(lru.pop_back(), Some(2));
        assert_eq!(lru.pop_back(), Some(1));
        assert_eq!(lru.pop_back(), Some(3));
        assert_eq!(lru.pop_back(), None);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut lru = Lru::new(1);
        let a = lru.insert_front(10);
        lru.touch(a);
        lru.pop_back();
        let b = lru.insert_front(20);
        assert_eq!(b, a, "freed node index should be recycled");
    }
}
