//! Entry multiplexer: longest-prefix dispatch among sub-stores.
//!
//! Handlers are installed on a compressed prefix trie. A lookup walks the
//! trie as far as the key allows, then dispatches to the handler bound to
//! the longest matching prefix; handlers installed at the same prefix are
//! tried in insertion order (`add_before` installs ahead of the existing
//! ones, `add_after` behind). A binding with the `exact` flag only matches
//! when the prefix is the whole key, and one with `cut_prefix` strips the
//! prefix from the key before forwarding. When the owning prefix has no
//! binding that can take the key, the default handler receives it
//! unmodified; shorter prefixes are not retried.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::Result;
use crate::ops::Hop;


struct Binding {
    id: i64,
    exact: bool,
    cut_prefix: bool,
    hop: Arc<dyn Hop>,
}

struct Node {
    prefix: String,
    bindings: Vec<Binding>,
    sub: Vec<Node>,
}

impl Node {
    fn leaf(prefix: &str, binding: Option<Binding>) -> Node {
        Node {
            prefix: prefix.to_string(),
            bindings: binding.into_iter().collect(),
            sub: Vec::new(),
        }
    }
}

struct Trie {
    root: Option<Node>,
    min_id: i64,
    max_id: i64,
}

/// Prefix-dispatching multiplexer. The trie is built at composition time
/// and read on every operation.
pub struct PrefixMux {
    dflt: Arc<dyn Hop>,
    trie: RwLock<Trie>,
}

impl PrefixMux {
    pub fn new(dflt: Arc<dyn Hop>) -> PrefixMux {
        PrefixMux {
            dflt,
            trie: RwLock::new(Trie {
                root: None,
                min_id: 0,
                max_id: 0,
            }),
        }
    }

    /// Installs `hop` at `pattern` ahead of handlers already there.
    pub fn add_before(&self, pattern: &str, exact: bool, cut_prefix: bool, hop: Arc<dyn Hop>) {
        let mut t = self.trie.write().expect("mux trie poisoned");
        t.min_id -= 1;
        let id = t.min_id;
        t.add(pattern, Binding { id, exact, cut_prefix, hop });
    }

    /// Installs `hop` at `pattern` behind handlers already there.
    pub fn add_after(&self, pattern: &str, exact: bool, cut_prefix: bool, hop: Arc<dyn Hop>) {
        let mut t = self.trie.write().expect("mux trie poisoned");
        t.max_id += 1;
        let id = t.max_id;
        t.add(pattern, Binding { id, exact, cut_prefix, hop });
    }

    /// Resolves a key to its handler and the (possibly prefix-stripped) key
    /// to forward.
    fn find(&self, key: &str) -> (Arc<dyn Hop>, String) {
        let t = self.trie.read().expect("mux trie poisoned");

        // collect the chain of matched nodes, longest last
        let mut chain: Vec<(&Node, usize)> = Vec::new();
        let mut node = t.root.as_ref();
        let mut matched = 0;
        while let Some(nd) = node {
            let rest = &key[matched..];
            if !rest.starts_with(nd.prefix.as_str()) {
                break;
            }

            matched += nd.prefix.len();
            chain.push((nd, matched));
            let next = key.as_bytes().get(matched).copied();
            node = nd
                .sub
                .iter()
                .find(|s| next.is_some() && s.prefix.as_bytes().first().copied() == next);
        }

        // the longest prefix carrying handlers owns the key; bindings there
        // are consulted in insertion order, and if none can take the key
        // (exact flag, shorter key) the default gets it. A shorter prefix
        // is never retried.
        if let Some((nd, n)) = chain.iter().rev().find(|(nd, _)| !nd.bindings.is_empty()) {
            let mut ordered: Vec<&Binding> = nd.bindings.iter().collect();
            ordered.sort_by_key(|b| b.id);
            for b in ordered {
                if b.exact && *n < key.len() {
                    continue;
                }

                let newkey = if b.cut_prefix { &key[*n..] } else { key };
                return (b.hop.clone(), newkey.to_string());
            }
        }

        (self.dflt.clone(), key.to_string())
    }
}

impl Trie {
    fn add(&mut self, pattern: &str, binding: Binding) {
        match self.root.take() {
            None => self.root = Some(Node::leaf(pattern, Some(binding))),
            Some(root) => self.root = Some(Trie::insert(root, pattern, binding)),
        }
    }

    fn insert(mut node: Node, pattern: &str, binding: Binding) -> Node {
        let mut common = node
            .prefix
            .bytes()
            .zip(pattern.bytes())
            .take_while(|(a, b)| a == b)
            .count();

        // never split inside a multi-byte character
        while common > 0
            && (!node.prefix.is_char_boundary(common) || !pattern.is_char_boundary(common))
        {
            common -= 1;
        }

        if common == 0 && !node.prefix.is_empty() && !pattern.is_empty() {
            // no shared prefix: introduce an empty root holding both
            let other = Node::leaf(pattern, Some(binding));
            return Node {
                prefix: String::new(),
                bindings: Vec::new(),
                sub: vec![node, other],
            };
        }

        if common == node.prefix.len() {
            let rest = &pattern[common..];
            if rest.is_empty() {
                // same prefix: stack the binding
                node.bindings.push(binding);
                return node;
            }

            // descend into the child sharing the next byte, or grow one
            let pos = node
                .sub
                .iter()
                .position(|s| s.prefix.as_bytes().first() == rest.as_bytes().first());
            match pos {
                Some(i) => {
                    let child = node.sub.remove(i);
                    node.sub.insert(i, Trie::insert(child, rest, binding));
                }
                None => node.sub.push(Node::leaf(rest, Some(binding))),
            }

            return node;
        }

        // partial match: split the node at the common point
        let tail = node.prefix[common..].to_string();
        let head = node.prefix[..common].to_string();
        node.prefix = tail;

        let mut split = Node {
            prefix: head,
            bindings: Vec::new(),
            sub: vec![node],
        };

        let rest = &pattern[common..];
        if rest.is_empty() {
            split.bindings.push(binding);
        } else {
            split.sub.push(Node::leaf(rest, Some(binding)));
        }

        split
    }
}

#[async_trait]
impl Hop for PrefixMux {
    async fn create(&self, key: &str, flags: &str, value: &[u8]) -> Result<u64> {
        let (hop, nkey) = self.find(key);
        hop.create(&nkey, flags, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let (hop, nkey) = self.find(key);
        hop.remove(&nkey).await
    }

    async fn get(&self, key: &str, version: u64) -> Result<(u64, Vec<u8>)> {
        let (hop, nkey) = self.find(key);
        hop.get(&nkey, version).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<u64> {
        let (hop, nkey) = self.find(key);
        hop.set(&nkey, value).await
    }

    async fn testset(
        &self,
        key: &str,
        oldversion: u64,
        oldvalue: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(u64, Vec<u8>)> {
        let (hop, nkey) = self.find(key);
        hop.testset(&nkey, oldversion, oldvalue, value).await
    }

    async fn atomic(&self, key: &str, op: u16, values: &[Vec<u8>]) -> Result<(u64, Vec<Vec<u8>>)> {
        let (hop, nkey) = self.find(key);
        hop.atomic(&nkey, op, values).await
    }
}
