use std::collections::BTreeMap;
use std::fmt;

/// A typed attribute value stored on an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Bool(bool),
    Long(i64),
}

/// Two-part primary key: partition (`parent`) and range (`child`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrimaryKey {
    pub parent: String,
    pub child: String,
}

impl PrimaryKey {
    pub fn new(parent: impl Into<String>, child: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            child: child.into(),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.parent, self.child)
    }
}

/// A persisted item: a primary key plus named attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: PrimaryKey,
    attributes: BTreeMap<String, AttributeValue>,
}

impl Item {
    pub fn new(key: PrimaryKey) -> Self {
        Self {
            key,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_bool(mut self, name: &str, value: bool) -> Self {
        self.attributes
            .insert(name.to_string(), AttributeValue::Bool(value));
        self
    }

    pub fn with_long(mut self, name: &str, value: i64) -> Self {
        self.attributes
            .insert(name.to_string(), AttributeValue::Long(value));
        self
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Boolean attribute value, `None` if absent or of another type.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.attributes.get(name) {
            Some(AttributeValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Integer attribute value, `None` if absent or of another type.
    pub fn get_long(&self, name: &str) -> Option<i64> {
        match self.attributes.get(name) {
            Some(AttributeValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Server-side filter applied to query and scan results.
///
/// Items lacking the named attribute never match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Equals(String, AttributeValue),
    LessThan(String, i64),
}

impl Filter {
    pub fn matches(&self, item: &Item) -> bool {
        match self {
            Filter::Equals(name, value) => item.attribute(name) == Some(value),
            Filter::LessThan(name, bound) => {
                matches!(item.get_long(name), Some(v) if v < *bound)
            }
        }
    }
}

/// One element of a batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRequest {
    Put(Item),
    Delete(PrimaryKey),
}

impl WriteRequest {
    pub fn key(&self) -> &PrimaryKey {
        match self {
            WriteRequest::Put(item) => &item.key,
            WriteRequest::Delete(key) => key,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, WriteRequest::Delete(_))
    }
}
