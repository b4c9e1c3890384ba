//! per file tree mapping logical chunk ids to physical chunks
//!
//! Level-0 nodes hold [NTNODES_LEVEL0] entries, internal nodes [NTNODES_INTERNAL]
//! children. An entry of 0 means "no chunk". The tree is only as tall as the
//! highest chunk id it has to address.
use smallvec::SmallVec;

pub const TNODES_LEVEL0_BITS: u32 = 4;
pub const NTNODES_LEVEL0: usize = 1 << TNODES_LEVEL0_BITS;
pub const TNODES_INTERNAL_BITS: u32 = 3;
pub const NTNODES_INTERNAL: usize = 1 << TNODES_INTERNAL_BITS;
pub const TNODES_MAX_LEVEL: u32 = 6;
const LEVEL0_MASK: u32 = NTNODES_LEVEL0 as u32 - 1;
const INTERNAL_MASK: u32 = NTNODES_INTERNAL as u32 - 1;

pub type Level0 = [u32; NTNODES_LEVEL0];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tnode {
    Internal([Option<Box<Tnode>>; NTNODES_INTERNAL]),
    Leaf(Level0),
}

impl Tnode {
    fn new(level: u32) -> Box<Tnode> {
        if level == 0 {
            Box::new(Tnode::Leaf([0; NTNODES_LEVEL0]))
        } else {
            Box::new(Tnode::Internal(Default::default()))
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Tnode::Internal(children) => children.iter().all(Option::is_none),
            Tnode::Leaf(entries) => entries.iter().all(|e| *e == 0),
        }
    }
}

/// tree levels needed to address `chunk_id`
fn required_level(chunk_id: u32) -> u32 {
    let mut x = chunk_id >> TNODES_LEVEL0_BITS;
    let mut level = 0;
    while x != 0 {
        x >>= TNODES_INTERNAL_BITS;
        level += 1;
    }
    level
}

/// child slot used by `chunk_id` in an internal node of `level`
fn internal_index(chunk_id: u32, level: u32) -> usize {
    ((chunk_id >> (TNODES_LEVEL0_BITS + (level - 1) * TNODES_INTERNAL_BITS)) & INTERNAL_MASK)
        as usize
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    top: Option<Box<Tnode>>,
    top_level: u32,
    n_tnodes: u32,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn top_level(&self) -> u32 {
        self.top_level
    }

    /// tnodes currently allocated by this tree
    pub fn n_tnodes(&self) -> u32 {
        self.n_tnodes
    }

    pub fn is_empty(&self) -> bool {
        self.top.as_deref().map_or(true, Tnode::is_empty)
    }

    /// drop every node
    pub fn clear(&mut self) {
        *self = FileTree::default();
    }

    /// find the level-0 node covering `chunk_id`
    pub fn find_level0(&self, chunk_id: u32) -> Option<&Level0> {
        if required_level(chunk_id) > self.top_level {
            return None;
        }
        let mut node = self.top.as_deref()?;
        let mut level = self.top_level;
        while level > 0 {
            node = match node {
                Tnode::Internal(children) => children[internal_index(chunk_id, level)].as_deref()?,
                Tnode::Leaf(_) => return None,
            };
            level -= 1;
        }
        match node {
            Tnode::Leaf(entries) => Some(entries),
            Tnode::Internal(_) => None,
        }
    }

    /// find the level-0 node covering `chunk_id`, growing the tree and
    /// creating missing nodes on the way
    /// # Return
    /// `None` when `chunk_id` is beyond what the tree can address
    pub fn add_or_find_level0(&mut self, chunk_id: u32) -> Option<&mut Level0> {
        let required = required_level(chunk_id);
        if required > TNODES_MAX_LEVEL {
            return None;
        }
        while self.top_level < required {
            if let Some(old_top) = self.top.take() {
                let mut children: [Option<Box<Tnode>>; NTNODES_INTERNAL] = Default::default();
                children[0] = Some(old_top);
                self.top = Some(Box::new(Tnode::Internal(children)));
                self.n_tnodes += 1;
            }
            self.top_level += 1;
        }

        let top_level = self.top_level;
        let mut created = 0;
        let mut node: &mut Box<Tnode> = self.top.get_or_insert_with(|| {
            created += 1;
            Tnode::new(top_level)
        });
        let mut level = top_level;
        while level > 0 {
            let current = node;
            node = match current.as_mut() {
                Tnode::Internal(children) => children[internal_index(chunk_id, level)]
                    .get_or_insert_with(|| {
                        created += 1;
                        Tnode::new(level - 1)
                    }),
                Tnode::Leaf(_) => return None,
            };
            level -= 1;
        }
        self.n_tnodes += created;
        match node.as_mut() {
            Tnode::Leaf(entries) => Some(entries),
            Tnode::Internal(_) => None,
        }
    }

    /// raw entry for `chunk_id`, 0 if unmapped
    pub fn get(&self, chunk_id: u32) -> u32 {
        self.find_level0(chunk_id)
            .map_or(0, |entries| entries[(chunk_id & LEVEL0_MASK) as usize])
    }

    /// store `value` as the entry of `chunk_id`
    /// # Return
    /// the previous entry, or `None` if the tree can't address `chunk_id`
    pub fn set(&mut self, chunk_id: u32, value: u32) -> Option<u32> {
        let entries = self.add_or_find_level0(chunk_id)?;
        let slot = &mut entries[(chunk_id & LEVEL0_MASK) as usize];
        Some(std::mem::replace(slot, value))
    }

    /// zero the entry of `chunk_id` without touching the tree shape
    /// # Return
    /// the previous entry
    pub fn clear_entry(&mut self, chunk_id: u32) -> u32 {
        if self.find_level0(chunk_id).is_none() {
            return 0;
        }
        self.set(chunk_id, 0).unwrap_or(0)
    }

    /// every non zero entry as `(chunk_id, entry)`, in chunk id order
    pub fn entries(&self) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let Some(top) = self.top.as_deref() else {
            return out;
        };
        // (node, level, first chunk id covered)
        let mut stack: SmallVec<[(&Tnode, u32, u32); 16]> = SmallVec::new();
        stack.push((top, self.top_level, 0));
        while let Some((node, level, base)) = stack.pop() {
            match node {
                Tnode::Leaf(entries) => {
                    for (i, entry) in entries.iter().enumerate() {
                        if *entry != 0 {
                            out.push((base + i as u32, *entry));
                        }
                    }
                }
                Tnode::Internal(children) => {
                    let span_bits = TNODES_LEVEL0_BITS + (level - 1) * TNODES_INTERNAL_BITS;
                    for (i, child) in children.iter().enumerate().rev() {
                        if let Some(child) = child.as_deref() {
                            stack.push((child, level - 1, base + ((i as u32) << span_bits)));
                        }
                    }
                }
            }
        }
        out
    }

    /// every level-0 node as `(base offset, entries)`, where the base offset is
    /// the chunk id of the first entry shifted right by [TNODES_LEVEL0_BITS]
    pub fn level0_nodes(&self) -> Vec<(u32, Level0)> {
        let mut out = Vec::new();
        let Some(top) = self.top.as_deref() else {
            return out;
        };
        let mut stack: SmallVec<[(&Tnode, u32, u32); 16]> = SmallVec::new();
        stack.push((top, self.top_level, 0));
        while let Some((node, level, base)) = stack.pop() {
            match node {
                Tnode::Leaf(entries) => out.push((base >> TNODES_LEVEL0_BITS, *entries)),
                Tnode::Internal(children) => {
                    let span_bits = TNODES_LEVEL0_BITS + (level - 1) * TNODES_INTERNAL_BITS;
                    for (i, child) in children.iter().enumerate().rev() {
                        if let Some(child) = child.as_deref() {
                            stack.push((child, level - 1, base + ((i as u32) << span_bits)));
                        }
                    }
                }
            }
        }
        out
    }

    /// install a level-0 node produced by [FileTree::level0_nodes]
    /// # Return
    /// `false` if the base offset can't be addressed
    pub fn insert_level0(&mut self, base_offset: u32, entries: &Level0) -> bool {
        match self.add_or_find_level0(base_offset << TNODES_LEVEL0_BITS) {
            Some(node) => {
                *node = *entries;
                true
            }
            None => false,
        }
    }

    /// free every subtree without a non zero entry, then lower the tree while
    /// only the first child of the top node is in use
    pub fn prune(&mut self) {
        // paths from the top to every internal node, parents before children
        let mut paths: Vec<SmallVec<[u8; 8]>> = Vec::new();
        if let Some(top) = self.top.as_deref() {
            let mut stack: SmallVec<[(&Tnode, SmallVec<[u8; 8]>); 16]> = SmallVec::new();
            stack.push((top, SmallVec::new()));
            while let Some((node, path)) = stack.pop() {
                if let Tnode::Internal(children) = node {
                    for (i, child) in children.iter().enumerate() {
                        if let Some(child) = child.as_deref() {
                            let mut child_path = path.clone();
                            child_path.push(i as u8);
                            stack.push((child, child_path));
                        }
                    }
                    paths.push(path);
                }
            }
        }

        let mut freed = 0;
        for path in paths.iter().rev() {
            if let Some(Tnode::Internal(children)) = self.node_at_mut(path) {
                for child in children.iter_mut() {
                    if child.as_deref().map_or(false, Tnode::is_empty) {
                        *child = None;
                        freed += 1;
                    }
                }
            }
        }

        if self.top.as_deref().map_or(false, Tnode::is_empty) {
            self.top = None;
            freed += 1;
        }
        while self.top_level > 0 {
            let collapsible = match self.top.as_deref() {
                Some(Tnode::Internal(children)) => children[1..].iter().all(Option::is_none),
                Some(Tnode::Leaf(_)) => false,
                None => true,
            };
            if !collapsible {
                break;
            }
            if let Some(mut top) = self.top.take() {
                if let Tnode::Internal(children) = top.as_mut() {
                    self.top = children[0].take();
                }
                freed += 1;
            }
            self.top_level -= 1;
        }
        self.n_tnodes -= freed.min(self.n_tnodes);
    }

    fn node_at_mut(&mut self, path: &[u8]) -> Option<&mut Tnode> {
        let mut node = self.top.as_deref_mut()?;
        for &i in path {
            node = match node {
                Tnode::Internal(children) => children[i as usize].as_deref_mut()?,
                Tnode::Leaf(_) => return None,
            };
        }
        Some(node)
    }
}
