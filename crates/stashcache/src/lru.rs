//! Recency list for the memory cache
//!
//! Slab-backed doubly-linked list plus key lookup, O(1) touch/insert/remove.
//! Head is the most recently used node, tail the least.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

use ahash::RandomState;

/// Node in the recency list
struct Node<K, V> {
    key: K,
    value: V,
    cost: u64,
    time: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Unbounded LRU list; limits are enforced by the owner
pub(crate) struct LruList<K, V> {
    map: HashMap<K, usize, RandomState>,
    nodes: Vec<Option<Node<K, V>>>,
    head: Option<usize>,
    tail: Option<usize>,
    free_list: Vec<usize>,
    // Wide enough that summing caller-supplied u64 costs cannot overflow
    total_cost: u128,
}

impl<K, V> LruList<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            map: HashMap::with_hasher(RandomState::new()),
            nodes: Vec::new(),
            head: None,
            tail: None,
            free_list: Vec::new(),
            total_cost: 0,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Look up and move to the front
    pub fn get(&mut self, key: &K, now: Instant) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.move_to_front(idx);
        let node = self.nodes[idx].as_mut()?;
        node.time = now;
        Some(&node.value)
    }

    /// Insert at the front, returning the value it replaced
    pub fn insert(&mut self, key: K, value: V, cost: u64, now: Instant) -> Option<V> {
        if let Some(&idx) = self.map.get(&key) {
            let mut replaced = None;
            if let Some(node) = self.nodes[idx].as_mut() {
                self.total_cost = self.total_cost - u128::from(node.cost) + u128::from(cost);
                node.cost = cost;
                node.time = now;
                replaced = Some(std::mem::replace(&mut node.value, value));
            }
            self.move_to_front(idx);
            return replaced;
        }

        let idx = self.alloc_node();
        self.nodes[idx] = Some(Node {
            key: key.clone(),
            value,
            cost,
            time: now,
            prev: None,
            next: self.head,
        });

        if let Some(head_idx) = self.head {
            if let Some(head) = &mut self.nodes[head_idx] {
                head.prev = Some(idx);
            }
        }

        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }

        self.total_cost += u128::from(cost);
        self.map.insert(key, idx);
        None
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.map.remove(key)?;
        self.take(idx).map(|node| node.value)
    }

    /// Remove the least recently used node
    pub fn pop_tail(&mut self) -> Option<(K, V)> {
        let idx = self.tail?;
        let node = self.take(idx)?;
        self.map.remove(&node.key);
        Some((node.key, node.value))
    }

    /// Last touch time of the least recently used node
    pub fn tail_time(&self) -> Option<Instant> {
        let idx = self.tail?;
        self.nodes[idx].as_ref().map(|node| node.time)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Sum of node costs, saturating at `u64::MAX`
    pub fn total_cost(&self) -> u64 {
        u64::try_from(self.total_cost).unwrap_or(u64::MAX)
    }

    /// Empty the list, handing back every value
    pub fn clear(&mut self) -> Vec<V> {
        let values = self
            .nodes
            .drain(..)
            .flatten()
            .map(|node| node.value)
            .collect();
        self.map.clear();
        self.free_list.clear();
        self.head = None;
        self.tail = None;
        self.total_cost = 0;
        values
    }

    fn take(&mut self, idx: usize) -> Option<Node<K, V>> {
        self.unlink(idx);
        let node = self.nodes[idx].take()?;
        self.total_cost -= u128::from(node.cost);
        self.free_list.push(idx);
        Some(node)
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }

        self.unlink(idx);

        if let Some(node) = &mut self.nodes[idx] {
            node.prev = None;
            node.next = self.head;
        }

        if let Some(head_idx) = self.head {
            if let Some(head) = &mut self.nodes[head_idx] {
                head.prev = Some(idx);
            }
        }

        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = if let Some(node) = &self.nodes[idx] {
            (node.prev, node.next)
        } else {
            return;
        };

        match prev {
            Some(prev_idx) => {
                if let Some(prev_node) = &mut self.nodes[prev_idx] {
                    prev_node.next = next;
                }
            }
            None => {
                self.head = next;
            }
        }

        match next {
            Some(next_idx) => {
                if let Some(next_node) = &mut self.nodes[next_idx] {
                    next_node.prev = prev;
                }
            }
            None => {
                self.tail = prev;
            }
        }
    }

    fn alloc_node(&mut self) -> usize {
        if let Some(idx) = self.free_list.pop() {
            idx
        } else {
            let idx = self.nodes.len();
            self.nodes.push(None);
            idx
        }
    }
}
