//! Small-vector helpers for `name=value` string arrays (spec.md §11, the `russ_sarray0` family),
//! used for a request's attribute and argument vectors and for a service path component's
//! `?k=v` option list.

/// An ordered list of strings, typically `name=value` pairs, with the lookup/mutation helpers
/// the original C library exposes beyond plain encode/decode (`find`, `find_prefix`,
/// `get_suffix`, `insert`, `remove`, `update`, `append`).
///
/// `AttrList` and `ArgList` (see [`crate::wire::request`]) are both this type: the wire shapes
/// and manipulation semantics are identical, only the role differs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SArray(pub Vec<String>);

impl SArray {
    pub fn new() -> SArray {
        SArray(Vec::new())
    }

    pub fn from_vec(items: Vec<String>) -> SArray {
        SArray(items)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the value half of the first `name=value` entry whose name matches exactly.
    pub fn find(&self, name: &str) -> Option<&str> {
        self.0.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == name).then_some(v)
        })
    }

    /// Returns the remainder of the first entry that starts with `prefix`, with `prefix`
    /// stripped. Unlike [`find`](Self::find) this does not require a `=` separator, matching
    /// `russ_sarray0_find_prefix`'s use for bare-prefix options.
    pub fn find_prefix(&self, prefix: &str) -> Option<&str> {
        self.0
            .iter()
            .find_map(|entry| entry.strip_prefix(prefix))
    }

    /// Alias for [`find`](Self::find), named for parity with `russ_sarray0_get_suffix`, which
    /// the original library uses when it treats an entry as `name<sep>suffix` and wants just the
    /// suffix half.
    pub fn get_suffix(&self, name: &str) -> Option<&str> {
        self.find(name)
    }

    pub fn insert(&mut self, index: usize, entry: String) {
        self.0.insert(index, entry);
    }

    pub fn remove(&mut self, index: usize) -> String {
        self.0.remove(index)
    }

    pub fn append(&mut self, entry: String) {
        self.0.push(entry);
    }

    /// Replaces the value of an existing `name=value` entry, or appends a new one if `name` is
    /// not already present.
    pub fn update(&mut self, name: &str, value: &str) {
        for entry in self.0.iter_mut() {
            if let Some((k, _)) = entry.split_once('=') {
                if k == name {
                    *entry = format!("{name}={value}");
                    return;
                }
            }
        }
        self.append(format!("{name}={value}"));
    }
}

impl From<Vec<String>> for SArray {
    fn from(items: Vec<String>) -> SArray {
        SArray(items)
    }
}

impl FromIterator<String> for SArray {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> SArray {
        SArray(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_returns_value_for_matching_name() {
        let a = SArray::from_vec(vec!["a=1".into(), "b=2".into()]);
        assert_eq!(a.find("b"), Some("2"));
        assert_eq!(a.find("c"), None);
    }

    #[test]
    fn find_prefix_strips_prefix() {
        let a = SArray::from_vec(vec!["controlpersist=60".into()]);
        assert_eq!(a.find_prefix("controlpersist="), Some("60"));
    }

    #[test]
    fn update_replaces_existing_or_appends() {
        let mut a = SArray::from_vec(vec!["a=1".into()]);
        a.update("a", "2");
        assert_eq!(a.find("a"), Some("2"));
        assert_eq!(a.len(), 1);
        a.update("b", "3");
        assert_eq!(a.find("b"), Some("3"));
        assert_eq!(a.len(), 2);
    }
}
