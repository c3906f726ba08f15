//! LIFO record of acquired resources
//!
//! Entries are pushed in acquisition order and popped in reverse, so
//! teardown mirrors startup exactly.

#[derive(Debug, Clone)]
pub struct ExitStack<T> {
    entries: Vec<T>,
}

impl<T> ExitStack<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Record an acquired resource
    pub fn push(&mut self, entry: T) {
        self.entries.push(entry);
    }

    /// Take the most recently acquired resource
    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in acquisition order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

impl<T> Default for ExitStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_in_reverse_order() {
        let mut stack = ExitStack::new();
        for name in ["head", "shard0", "shard1", "tail"] {
            stack.push(name);
        }
        assert_eq!(stack.iter().copied().collect::<Vec<_>>()[0], "head");

        let mut popped = Vec::new();
        while let Some(entry) = stack.pop() {
            popped.push(entry);
        }
        assert_eq!(popped, vec!["tail", "shard1", "shard0", "head"]);
        assert!(stack.is_empty());
    }
}
