use std::collections::btree_map;
use std::collections::BTreeMap;

/// Header map with case-sensitive names and a single value per name.
///
/// Multi-valued headers are the caller's concern: adding an existing name
/// replaces the previous value. `get` on a missing name yields the empty
/// string rather than failing, which keeps protocol code free of `Option`
/// plumbing for the common "is it set to x" checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    data: BTreeMap<String, String>,
}

/// Mime type and charset from a `Content-Type` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentType {
    pub mime: String,
    pub charset: String,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    /// Add a header, replacing any previous value for the name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.data.insert(name.into(), value.into());
    }

    /// Same as `add`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.add(name, value);
    }

    /// Set the header only if the name is not already present.
    pub fn set_default(&mut self, name: &str, value: impl Into<String>) {
        if !self.has(name) {
            self.data.insert(name.to_owned(), value.into());
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    /// The value for `name`, or `""` when not present.
    pub fn get(&self, name: &str) -> &str {
        self.data.get(name).map(|s| s.as_str()).unwrap_or("")
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.data.remove(name)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.data.iter()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Mime and charset split out of the `Content-Type` header.
    pub fn content_type(&self) -> ContentType {
        let val = self.get("Content-Type");
        if val.is_empty() {
            return ContentType::default();
        }
        let mime = match val.find(';') {
            Some(sep) => &val[..sep],
            None => val,
        };
        let charset = val
            .find("charset=")
            .map(|p| val[p + "charset=".len()..].trim())
            .unwrap_or("");
        ContentType {
            mime: mime.trim().to_owned(),
            charset: charset.to_owned(),
        }
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.data.iter()
    }
}
