use std::collections::HashMap;
use std::sync::RwLock;

/// Thread-safe topic trie with MQTT-style wildcards.
///
/// - `+` matches exactly one level
/// - `#` matches zero or more trailing levels (last segment only)
///
/// Used for view-state subscriptions (`feed/+`, `chat/#`) and for routing
/// real-time change events to channel subscriptions
/// (`comments/post_id/42`, `messages/#`).
pub struct Trie<T> {
    root: RwLock<Node<T>>,
}

struct Node<T> {
    children: HashMap<String, Node<T>>,
    single: Option<Box<Node<T>>>,
    /// Values registered with a trailing `#` at this level.
    rest: Vec<T>,
    /// Values whose pattern ends exactly here.
    values: Vec<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            single: None,
            rest: Vec::new(),
            values: Vec::new(),
        }
    }
}

impl<T: Clone> Trie<T> {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Node::default()),
        }
    }

    /// Register `value` under `pattern`.
    pub fn insert(&self, pattern: &str, value: T) {
        let mut root = self.root.write().unwrap_or_else(|e| e.into_inner());
        let mut node = &mut *root;
        for segment in pattern.split('/') {
            match segment {
                "#" => {
                    node.rest.push(value);
                    return;
                }
                "+" => node = &mut **node.single.get_or_insert_with(Default::default),
                exact => node = node.children.entry(exact.to_string()).or_default(),
            }
        }
        node.values.push(value);
    }

    /// All values whose pattern matches the concrete `topic`.
    pub fn match_topic(&self, topic: &str) -> Vec<T> {
        let root = self.root.read().unwrap_or_else(|e| e.into_inner());
        let segments: Vec<&str> = topic.split('/').collect();
        let mut out = Vec::new();
        root.collect(&segments, &mut out);
        out
    }

    /// Remove the values under `pattern` for which `predicate` holds.
    /// Returns whether anything was removed.
    pub fn remove<F>(&self, pattern: &str, predicate: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        let mut root = self.root.write().unwrap_or_else(|e| e.into_inner());
        let mut node = &mut *root;
        for segment in pattern.split('/') {
            let next = match segment {
                "#" => return retain_not(&mut node.rest, &predicate),
                "+" => node.single.as_deref_mut(),
                exact => node.children.get_mut(exact),
            };
            match next {
                Some(n) => node = n,
                None => return false,
            }
        }
        retain_not(&mut node.values, &predicate)
    }

    /// Whether any value is registered under exactly `pattern`.
    pub fn has_pattern(&self, pattern: &str) -> bool {
        let root = self.root.read().unwrap_or_else(|e| e.into_inner());
        let mut node = &*root;
        for segment in pattern.split('/') {
            let next = match segment {
                "#" => return !node.rest.is_empty(),
                "+" => node.single.as_deref(),
                exact => node.children.get(exact),
            };
            match next {
                Some(n) => node = n,
                None => return false,
            }
        }
        !node.values.is_empty()
    }
}

impl<T: Clone> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Node<T> {
    fn collect(&self, segments: &[&str], out: &mut Vec<T>) {
        // A trailing `#` matches the parent level as well as any depth below.
        out.extend(self.rest.iter().cloned());
        let Some((first, tail)) = segments.split_first() else {
            out.extend(self.values.iter().cloned());
            return;
        };
        if let Some(child) = self.children.get(*first) {
            child.collect(tail, out);
        }
        if let Some(single) = &self.single {
            single.collect(tail, out);
        }
    }
}

fn retain_not<T, F: Fn(&T) -> bool>(values: &mut Vec<T>, predicate: &F) -> bool {
    let before = values.len();
    values.retain(|v| !predicate(v));
    values.len() < before
}
