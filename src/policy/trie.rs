//! 4-level, 256-way radix index over IPv4 addresses.
//!
//! Each level is indexed by one octet of the address, first octet at the
//! root. Levels 0-2 hold child nodes; the 4th level only ever holds
//! `Slot::Present`. Lookups walk at most four slots and never allocate, so
//! `contains` is safe to call from the packet path.

use std::fmt;
use std::mem;
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::error::FilterError;

/// Children per node, one per octet value.
pub const FANOUT: usize = 256;

/// Trie depth, one level per octet.
const LEVELS: usize = 4;

/// Memory held by a single node's slot array.
pub const NODE_BYTES: usize = FANOUT * mem::size_of::<Slot>();

enum Slot {
    Empty,
    Child(Node),
    Present,
}

struct Node {
    slots: Box<[Slot; FANOUT]>,
}

impl Node {
    /// Allocate an empty node, surfacing allocation failure instead of aborting.
    fn try_new() -> Result<Self, FilterError> {
        let mut slots = reserve_slots()?;
        slots.resize_with(FANOUT, || Slot::Empty);
        Self::from_slots(slots)
    }

    /// Deep copy with every node allocated fallibly.
    fn try_clone(&self) -> Result<Self, FilterError> {
        let mut slots = reserve_slots()?;
        for slot in self.slots.iter() {
            slots.push(match slot {
                Slot::Empty => Slot::Empty,
                Slot::Present => Slot::Present,
                Slot::Child(child) => Slot::Child(child.try_clone()?),
            });
        }
        Self::from_slots(slots)
    }

    fn from_slots(slots: Vec<Slot>) -> Result<Self, FilterError> {
        let slots: Box<[Slot; FANOUT]> = slots
            .into_boxed_slice()
            .try_into()
            .map_err(|_| FilterError::OutOfMemory("address trie"))?;
        Ok(Self { slots })
    }
}

fn reserve_slots() -> Result<Vec<Slot>, FilterError> {
    if !node_allocation_allowed() {
        return Err(FilterError::OutOfMemory("address trie"));
    }
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(FANOUT)
        .map_err(|_| FilterError::OutOfMemory("address trie"))?;
    Ok(slots)
}

#[cfg(not(test))]
#[inline(always)]
fn node_allocation_allowed() -> bool {
    true
}

#[cfg(test)]
thread_local! {
    static NODE_BUDGET: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

#[cfg(test)]
fn node_allocation_allowed() -> bool {
    NODE_BUDGET.with(|budget| match budget.get() {
        None => true,
        Some(0) => false,
        Some(n) => {
            budget.set(Some(n - 1));
            true
        }
    })
}

/// Let the current thread allocate at most `nodes` more trie nodes before
/// failing with `OutOfMemory`. `None` removes the limit.
#[cfg(test)]
pub(crate) fn limit_node_allocations(nodes: Option<usize>) {
    NODE_BUDGET.with(|budget| budget.set(nodes));
}

/// Counters describing the trie's footprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrieStats {
    /// Allocated nodes, root included.
    pub nodes: usize,
    /// Bytes held by node slot arrays.
    pub bytes: usize,
    /// Distinct addresses present.
    pub addresses: usize,
}

pub struct AddressTrie {
    root: Node,
    nodes: usize,
    addresses: usize,
}

impl AddressTrie {
    /// Create an empty trie holding only the root node.
    pub fn new() -> Result<Self, FilterError> {
        Ok(Self {
            root: Node::try_new()?,
            nodes: 1,
            addresses: 0,
        })
    }

    /// Deep copy of the trie. Allocation failure is reported, never fatal.
    pub fn try_clone(&self) -> Result<Self, FilterError> {
        Ok(Self {
            root: self.root.try_clone()?,
            nodes: self.nodes,
            addresses: self.addresses,
        })
    }

    /// Insert every address in `pool`.
    ///
    /// On `OutOfMemory` the addresses inserted before the failure stay in
    /// place; the trie should be discarded.
    pub fn insert_pool(&mut self, pool: &[Ipv4Addr]) -> Result<(), FilterError> {
        for addr in pool {
            self.insert(*addr)?;
        }
        Ok(())
    }

    /// Insert one address. Returns `true` if it was not already present.
    pub fn insert(&mut self, addr: Ipv4Addr) -> Result<bool, FilterError> {
        let Self {
            root,
            nodes,
            addresses,
        } = self;
        let octets = addr.octets();

        let mut node = root;
        for &octet in &octets[..LEVELS - 1] {
            let slot = &mut node.slots[octet as usize];
            if let Slot::Empty = slot {
                *slot = Slot::Child(Node::try_new()?);
                *nodes += 1;
            }
            node = match slot {
                Slot::Child(child) => child,
                Slot::Present | Slot::Empty => {
                    return Err(FilterError::corrupt("address trie marker above leaf level"))
                }
            };
        }

        let leaf = &mut node.slots[octets[LEVELS - 1] as usize];
        let fresh = !matches!(leaf, Slot::Present);
        *leaf = Slot::Present;
        if fresh {
            *addresses += 1;
        }
        Ok(fresh)
    }

    /// Membership test. Allocation-free, at most four slot reads.
    #[inline]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mut node = &self.root;
        for (level, &octet) in addr.octets().iter().enumerate() {
            match &node.slots[octet as usize] {
                Slot::Empty => return false,
                Slot::Present => return level == LEVELS - 1,
                Slot::Child(child) => node = child,
            }
        }
        false
    }

    /// Tear down every node below the root. Returns the number of nodes released.
    pub fn clear(&mut self) -> usize {
        let released = release(&mut self.root);
        self.nodes = 1;
        self.addresses = 0;
        released
    }

    pub fn len(&self) -> usize {
        self.addresses
    }

    pub fn is_empty(&self) -> bool {
        self.addresses == 0
    }

    pub fn stats(&self) -> TrieStats {
        TrieStats {
            nodes: self.nodes,
            bytes: self.nodes * NODE_BYTES,
            addresses: self.addresses,
        }
    }
}

/// Post-order teardown: children are emptied before their parent slot drops them.
fn release(node: &mut Node) -> usize {
    let mut released = 0;
    for slot in node.slots.iter_mut() {
        match mem::replace(slot, Slot::Empty) {
            Slot::Child(mut child) => {
                released += release(&mut child) + 1;
            }
            Slot::Present | Slot::Empty => {}
        }
    }
    released
}

impl fmt::Debug for AddressTrie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressTrie")
            .field("nodes", &self.nodes)
            .field("addresses", &self.addresses)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie_of(addrs: &[Ipv4Addr]) -> AddressTrie {
        let mut trie = AddressTrie::new().unwrap();
        trie.insert_pool(addrs).unwrap();
        trie
    }

    #[test]
    fn test_contains_exactly_inserted_set() {
        let set = [
            Ipv4Addr::new(10, 0, 2, 1),
            Ipv4Addr::new(10, 0, 2, 200),
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(255, 255, 255, 255),
            Ipv4Addr::new(1, 2, 3, 4),
        ];
        let trie = trie_of(&set);

        for addr in &set {
            assert!(trie.contains(*addr), "{} should be present", addr);
        }
        for candidate in [
            Ipv4Addr::new(10, 0, 2, 2),
            Ipv4Addr::new(10, 0, 3, 1),
            Ipv4Addr::new(192, 168, 1, 0),
            Ipv4Addr::new(1, 2, 3, 5),
            Ipv4Addr::new(4, 3, 2, 1),
        ] {
            assert!(!trie.contains(candidate), "{} should be absent", candidate);
        }
        assert_eq!(trie.len(), set.len());
    }

    #[test]
    fn test_isolation_of_single_address() {
        let trie = trie_of(&[Ipv4Addr::new(10, 0, 2, 1)]);

        assert!(trie.contains(Ipv4Addr::new(10, 0, 2, 1)));
        assert!(!trie.contains(Ipv4Addr::new(10, 0, 2, 2)));
        assert!(!trie.contains(Ipv4Addr::new(11, 0, 2, 1)));
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let mut addrs: Vec<Ipv4Addr> = (0..64u32)
            .map(|i| Ipv4Addr::from(0x0a00_0000 | i.wrapping_mul(0x0001_0203)))
            .collect();
        let forward = trie_of(&addrs);
        addrs.reverse();
        let backward = trie_of(&addrs);

        assert_eq!(forward.stats(), backward.stats());
        for i in 0..=255u8 {
            let candidate = Ipv4Addr::new(10, 0, i, i);
            assert_eq!(forward.contains(candidate), backward.contains(candidate));
        }
        for addr in &addrs {
            assert!(backward.contains(*addr));
        }
    }

    #[test]
    fn test_duplicate_insert_is_idempotent() {
        let addr = Ipv4Addr::new(8, 8, 8, 8);
        let mut trie = AddressTrie::new().unwrap();

        assert!(trie.insert(addr).unwrap());
        let before = trie.stats();
        assert!(!trie.insert(addr).unwrap());

        assert_eq!(trie.stats(), before);
        assert!(trie.contains(addr));
    }

    #[test]
    fn test_shared_prefix_shares_nodes() {
        let shared = trie_of(&[Ipv4Addr::new(10, 0, 2, 1), Ipv4Addr::new(10, 0, 2, 2)]);
        let disjoint = trie_of(&[Ipv4Addr::new(10, 0, 2, 1), Ipv4Addr::new(200, 1, 1, 1)]);

        // root + one node per inner level
        assert_eq!(shared.stats().nodes, 4);
        assert_eq!(disjoint.stats().nodes, 7);
        assert!(shared.stats().bytes < disjoint.stats().bytes);
    }

    #[test]
    fn test_empty_trie_contains_nothing() {
        let trie = AddressTrie::new().unwrap();

        assert!(trie.is_empty());
        assert!(!trie.contains(Ipv4Addr::UNSPECIFIED));
        assert!(!trie.contains(Ipv4Addr::BROADCAST));
        assert_eq!(trie.stats().nodes, 1);
    }

    #[test]
    fn test_clear_releases_all_nodes_below_root() {
        let mut trie = trie_of(&[Ipv4Addr::new(10, 0, 2, 1), Ipv4Addr::new(200, 1, 1, 1)]);

        assert_eq!(trie.clear(), 6);
        assert_eq!(trie.stats(), AddressTrie::new().unwrap().stats());
        assert!(!trie.contains(Ipv4Addr::new(10, 0, 2, 1)));

        trie.insert(Ipv4Addr::new(10, 0, 2, 1)).unwrap();
        assert!(trie.contains(Ipv4Addr::new(10, 0, 2, 1)));
    }

    #[test]
    fn test_clone_is_independent() {
        let original = trie_of(&[Ipv4Addr::new(10, 0, 2, 1)]);
        let mut copy = original.try_clone().unwrap();
        assert_eq!(copy.stats(), original.stats());
        copy.insert(Ipv4Addr::new(10, 0, 2, 2)).unwrap();

        assert!(!original.contains(Ipv4Addr::new(10, 0, 2, 2)));
        assert!(copy.contains(Ipv4Addr::new(10, 0, 2, 1)));
        assert!(copy.contains(Ipv4Addr::new(10, 0, 2, 2)));
    }

    #[test]
    fn test_clone_reports_out_of_memory() {
        let original = trie_of(&[Ipv4Addr::new(10, 0, 2, 1), Ipv4Addr::new(200, 1, 1, 1)]);

        limit_node_allocations(Some(3));
        let copy = original.try_clone();
        limit_node_allocations(None);

        assert!(matches!(copy, Err(FilterError::OutOfMemory(_))));
        assert!(original.contains(Ipv4Addr::new(200, 1, 1, 1)));
        assert_eq!(original.stats().nodes, 7);
    }

    #[test]
    fn test_insert_reports_out_of_memory() {
        let mut trie = AddressTrie::new().unwrap();

        limit_node_allocations(Some(1));
        let inserted = trie.insert(Ipv4Addr::new(10, 0, 2, 1));
        limit_node_allocations(None);

        assert!(matches!(inserted, Err(FilterError::OutOfMemory("address trie"))));
        assert!(!trie.contains(Ipv4Addr::new(10, 0, 2, 1)));
    }
}
