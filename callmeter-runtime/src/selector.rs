//! Function selection: decide per call whether it is tracked, and under which
//! stat slot.
//!
//! A tracked function is identified by a `FunctionKey`: an optional owner
//! (type or namespace) and a bare name, joined by `SEPARATOR` in the
//! qualified form `Owner:name`. Slots are dense, assigned in first-seen order
//! from 1; slot 0 means "not tracked".
//!
//! Two interchangeable algorithms answer `resolve`:
//! - `HashSelector`: one probe into a map keyed by the qualified bytes.
//! - `TrieSelector`: a 127-way byte trie walked owner, separator, name.
//!
//! Neither allocates on the lookup path once built, and both cost depend only
//! on the length of the key being looked up.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Dense index into the stats table. `UNTRACKED` (0) is never assigned.
pub type Slot = u32;

pub const UNTRACKED: Slot = 0;

/// Byte joining owner and bare name in a qualified key.
pub const SEPARATOR: u8 = b':';

/// Which lookup structure a session builds for its tracked functions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Hash,
    #[default]
    Trie,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Hash => f.write_str("hash"),
            Algorithm::Trie => f.write_str("trie"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hash" => Ok(Algorithm::Hash),
            "trie" => Ok(Algorithm::Trie),
            other => Err(format!("unknown algorithm '{other}' (expected 'hash' or 'trie')")),
        }
    }
}

/// Owned identity of a trackable function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionKey {
    owner: Option<Box<str>>,
    name: Box<str>,
}

impl FunctionKey {
    pub fn new(owner: Option<&str>, name: &str) -> Result<Self, Error> {
        let invalid = |reason| Error::InvalidKey {
            key: match owner {
                Some(o) => format!("{o}:{name}"),
                None => name.to_owned(),
            },
            reason,
        };
        if name.is_empty() {
            return Err(invalid("empty function name"));
        }
        if name.as_bytes().contains(&SEPARATOR) {
            return Err(invalid("function name contains the separator"));
        }
        if let Some(owner) = owner {
            if owner.is_empty() {
                return Err(invalid("empty owner name"));
            }
            if owner.as_bytes().contains(&SEPARATOR) {
                return Err(invalid("owner name contains the separator"));
            }
        }
        Ok(Self {
            owner: owner.map(Into::into),
            name: name.into(),
        })
    }

    pub fn function(name: &str) -> Result<Self, Error> {
        Self::new(None, name)
    }

    pub fn method(owner: &str, name: &str) -> Result<Self, Error> {
        Self::new(Some(owner), name)
    }

    /// Parse `name` or `Owner:name`. Either part holding a second separator is an error.
    pub fn parse(qualified: &str) -> Result<Self, Error> {
        match qualified.split_once(SEPARATOR as char) {
            Some((owner, name)) => Self::new(Some(owner), name),
            None => Self::new(None, qualified),
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn to_ref(&self) -> FunctionRef<'_> {
        FunctionRef {
            owner: self.owner.as_deref(),
            name: &self.name,
        }
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_ref().fmt(f)
    }
}

impl FromStr for FunctionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Borrowed identity of the function at a call boundary, as the host's
/// dispatcher sees it. Never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionRef<'a> {
    pub owner: Option<&'a str>,
    pub name: &'a str,
}

impl<'a> FunctionRef<'a> {
    pub const fn function(name: &'a str) -> Self {
        Self { owner: None, name }
    }

    pub const fn method(owner: &'a str, name: &'a str) -> Self {
        Self {
            owner: Some(owner),
            name,
        }
    }

    /// A name holding the separator would alias an `Owner:name` key.
    #[inline]
    fn has_bare_name(&self) -> bool {
        !self.name.as_bytes().contains(&SEPARATOR)
    }

    /// Length of the qualified form in bytes.
    #[inline]
    pub fn qualified_len(&self) -> usize {
        match self.owner {
            Some(owner) => owner.len() + 1 + self.name.len(),
            None => self.name.len(),
        }
    }

    #[inline]
    fn write_qualified(&self, out: &mut Vec<u8>) {
        if let Some(owner) = self.owner {
            out.extend_from_slice(owner.as_bytes());
            out.push(SEPARATOR);
        }
        out.extend_from_slice(self.name.as_bytes());
    }

    /// Qualified bytes: owner, separator, name.
    #[inline]
    fn bytes(&self) -> impl Iterator<Item = u8> + 'a {
        let (owner, sep): (&[u8], &[u8]) = match self.owner {
            Some(owner) => (owner.as_bytes(), &[SEPARATOR]),
            None => (&[], &[]),
        };
        owner
            .iter()
            .chain(sep)
            .chain(self.name.as_bytes())
            .copied()
    }
}

impl fmt::Display for FunctionRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            Some(owner) => write!(f, "{owner}{}{}", SEPARATOR as char, self.name),
            None => f.write_str(self.name),
        }
    }
}

/// Outcome of adding a key to a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Inserted,
    /// The key was already tracked; the first slot is kept.
    AlreadyPresent(Slot),
}

/// Exact-match map from qualified key bytes to slot.
#[derive(Debug, Default)]
pub struct HashSelector {
    slots: HashMap<Box<[u8]>, Slot>,
    /// Reused buffer for building the qualified form of a lookup key.
    scratch: Vec<u8>,
    longest: usize,
}

impl HashSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &FunctionKey, slot: Slot) -> Insert {
        let r = key.to_ref();
        let mut qualified = Vec::with_capacity(r.qualified_len());
        r.write_qualified(&mut qualified);
        match self.slots.entry(qualified.into_boxed_slice()) {
            std::collections::hash_map::Entry::Occupied(e) => Insert::AlreadyPresent(*e.get()),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(slot);
                self.longest = self.longest.max(r.qualified_len());
                if self.scratch.capacity() < self.longest {
                    self.scratch.reserve(self.longest - self.scratch.len());
                }
                Insert::Inserted
            }
        }
    }

    #[inline]
    pub fn resolve(&mut self, key: FunctionRef<'_>) -> Slot {
        // Longer than every tracked key: cannot match, and skipping it keeps
        // the scratch buffer from growing.
        if key.qualified_len() > self.longest || !key.has_bare_name() {
            return UNTRACKED;
        }
        self.scratch.clear();
        key.write_qualified(&mut self.scratch);
        self.slots
            .get(self.scratch.as_slice())
            .copied()
            .unwrap_or(UNTRACKED)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Branching factor: one child per byte value 0x00-0x7e.
const ALPHABET: usize = 127;

/// Index 0 is the root, which is never anyone's child, so 0 also means
/// "no child" in `children`.
const NO_CHILD: u32 = 0;

#[derive(Clone)]
struct TrieNode {
    children: [u32; ALPHABET],
    /// Non-zero marks a terminal node.
    slot: Slot,
}

impl TrieNode {
    fn new() -> Self {
        Self {
            children: [NO_CHILD; ALPHABET],
            slot: UNTRACKED,
        }
    }
}

/// Byte trie over qualified keys. Nodes live in one arena and are freed
/// together, so teardown does not recurse.
pub struct TrieSelector {
    nodes: Vec<TrieNode>,
    len: usize,
}

impl Default for TrieSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TrieSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrieSelector")
            .field("keys", &self.len)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl TrieSelector {
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::new()],
            len: 0,
        }
    }

    /// Add `key` under `slot`. Keys with bytes outside 0x00-0x7e are
    /// rejected before the trie is touched.
    pub fn insert(&mut self, key: &FunctionKey, slot: Slot) -> Result<Insert, Error> {
        let r = key.to_ref();
        if let Some((offset, byte)) = r.bytes().enumerate().find(|&(_, b)| b as usize >= ALPHABET) {
            return Err(Error::UnsupportedByte {
                key: key.to_string(),
                byte,
                offset,
            });
        }

        let mut node = 0usize;
        for b in r.bytes() {
            let child = self.nodes[node].children[b as usize];
            node = if child == NO_CHILD {
                let idx = self.nodes.len();
                self.nodes.push(TrieNode::new());
                self.nodes[node].children[b as usize] = idx as u32;
                idx
            } else {
                child as usize
            };
        }

        let terminal = &mut self.nodes[node];
        if terminal.slot != UNTRACKED {
            return Ok(Insert::AlreadyPresent(terminal.slot));
        }
        terminal.slot = slot;
        self.len += 1;
        Ok(Insert::Inserted)
    }

    #[inline]
    pub fn resolve(&self, key: FunctionRef<'_>) -> Slot {
        if !key.has_bare_name() {
            return UNTRACKED;
        }
        let mut node = 0usize;
        for b in key.bytes() {
            if b as usize >= ALPHABET {
                return UNTRACKED;
            }
            let child = self.nodes[node].children[b as usize];
            if child == NO_CHILD {
                return UNTRACKED;
            }
            node = child as usize;
        }
        self.nodes[node].slot
    }

    /// Every tracked qualified key with its slot, in byte order.
    pub fn keys(&self) -> Vec<(String, Slot)> {
        let mut out = Vec::with_capacity(self.len);
        // (node, depth of node, byte leading to it)
        let mut worklist: Vec<(usize, usize, u8)> = vec![(0, 0, 0)];
        let mut path: Vec<u8> = Vec::new();
        while let Some((node, depth, byte)) = worklist.pop() {
            path.truncate(depth.saturating_sub(1));
            if depth > 0 {
                path.push(byte);
            }
            let n = &self.nodes[node];
            if n.slot != UNTRACKED {
                out.push((String::from_utf8_lossy(&path).into_owned(), n.slot));
            }
            // Push in reverse so the smallest byte is visited first.
            for b in (0..ALPHABET).rev() {
                let child = n.children[b];
                if child != NO_CHILD {
                    worklist.push((child as usize, depth + 1, b as u8));
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The lookup structure chosen for a session.
#[derive(Debug)]
pub enum FunctionSelector {
    Hash(HashSelector),
    Trie(TrieSelector),
}

impl FunctionSelector {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Hash => FunctionSelector::Hash(HashSelector::new()),
            Algorithm::Trie => FunctionSelector::Trie(TrieSelector::new()),
        }
    }

    /// Build a selector over `keys`, assigning slots 1..=N in first-seen
    /// order. Duplicates keep their first slot and are left out of the
    /// returned list, whose index `i` holds the key for slot `i + 1`.
    pub fn build(algorithm: Algorithm, keys: &[FunctionKey]) -> Result<(Self, Vec<FunctionKey>), Error> {
        let mut selector = Self::new(algorithm);
        let mut distinct = Vec::with_capacity(keys.len());
        for key in keys {
            let next = distinct.len() as Slot + 1;
            match selector.insert(key, next)? {
                Insert::Inserted => distinct.push(key.clone()),
                Insert::AlreadyPresent(slot) => {
                    tracing::debug!(key = %key, slot, "duplicate tracked function ignored");
                }
            }
        }
        Ok((selector, distinct))
    }

    pub fn insert(&mut self, key: &FunctionKey, slot: Slot) -> Result<Insert, Error> {
        match self {
            FunctionSelector::Hash(h) => Ok(h.insert(key, slot)),
            FunctionSelector::Trie(t) => t.insert(key, slot),
        }
    }

    /// Slot for `key`, or `UNTRACKED`. Absence is the common case.
    #[inline]
    pub fn resolve(&mut self, key: FunctionRef<'_>) -> Slot {
        match self {
            FunctionSelector::Hash(h) => h.resolve(key),
            FunctionSelector::Trie(t) => t.resolve(key),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            FunctionSelector::Hash(_) => Algorithm::Hash,
            FunctionSelector::Trie(_) => Algorithm::Trie,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FunctionSelector::Hash(h) => h.len(),
            FunctionSelector::Trie(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
