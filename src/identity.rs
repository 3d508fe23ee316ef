//! Query identity derivation
//!
//! An [`Identity`] is the canonical key for one logical request: the query
//! descriptor identifier, the sanitized variables serialized with object keys
//! in sorted order, and the optional disambiguation key. Two requests share
//! an identity exactly when they would share a fetch.

use serde_json::{Map, Value};
use std::{
    fmt,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

/// A query document as the coordination core sees it.
///
/// The identifier defaults to the operation name plus a fingerprint of the
/// whitespace-normalized document, so structurally equal documents share an
/// identifier. Persisted or precompiled queries can supply their own id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescriptor {
    id: String,
    name: String,
    document: String,
    fields: Vec<String>,
}

impl QueryDescriptor {
    /// Describe a document under a derived identifier.
    ///
    /// The fingerprint comes from the standard library's default hasher and
    /// is only stable within one process. Use [`with_id`](Self::with_id) for
    /// ids that are persisted or shared with a server.
    pub fn new(name: impl Into<String>, document: &str) -> Self {
        let name = name.into();
        let document = normalize_document(document);
        let id = format!("{}:{:016x}", name, fingerprint(&document));
        Self {
            id,
            name,
            document,
            fields: Vec::new(),
        }
    }

    /// Override the identifier (e.g. a persisted query hash)
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Top-level fields the query selects; the store uses them to tell a
    /// full hit from partial data.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

fn normalize_document(document: &str) -> String {
    document.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fingerprint(document: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    document.hash(&mut hasher);
    hasher.finish()
}

/// Canonical request identity.
///
/// Equality and hashing only consider the canonical key; the descriptor and
/// variables ride along so the fetch path and the store can use them.
#[derive(Clone)]
pub struct Identity {
    key: Arc<str>,
    query: Arc<QueryDescriptor>,
    variables: Arc<Value>,
    disambiguation_key: Option<Arc<str>>,
}

impl Identity {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn query(&self) -> &Arc<QueryDescriptor> {
        &self.query
    }

    /// Sanitized variables, as sent to the transport
    pub fn variables(&self) -> &Arc<Value> {
        &self.variables
    }

    pub fn disambiguation_key(&self) -> Option<&str> {
        self.disambiguation_key.as_deref()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identity").field(&self.key).finish()
    }
}

/// Transforms outgoing variables before identity derivation
pub trait VariableSanitizer: Send + Sync + 'static {
    fn sanitize(&self, variables: Value) -> Value;
}

/// Leaves variables untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSanitizer;

impl VariableSanitizer for NoopSanitizer {
    fn sanitize(&self, variables: Value) -> Value {
        variables
    }
}

/// Recursively removes metadata fields (by default `__typename`) from variables
#[derive(Debug, Clone)]
pub struct StripFields {
    fields: Vec<String>,
}

impl StripFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    fn strip(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(k, _)| !self.fields.iter().any(|f| f == k))
                    .map(|(k, v)| (k, self.strip(v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.strip(v)).collect()),
            other => other,
        }
    }
}

impl Default for StripFields {
    fn default() -> Self {
        Self::new(["__typename"])
    }
}

impl VariableSanitizer for StripFields {
    fn sanitize(&self, variables: Value) -> Value {
        self.strip(variables)
    }
}

/// Derives identities from (query, variables, disambiguation key)
#[derive(Clone)]
pub struct IdentityDeriver {
    sanitizer: Arc<dyn VariableSanitizer>,
}

impl Default for IdentityDeriver {
    fn default() -> Self {
        Self::new(StripFields::default())
    }
}

impl IdentityDeriver {
    pub fn new(sanitizer: impl VariableSanitizer) -> Self {
        Self {
            sanitizer: Arc::new(sanitizer),
        }
    }

    pub fn with_shared_sanitizer(sanitizer: Arc<dyn VariableSanitizer>) -> Self {
        Self { sanitizer }
    }

    /// Run variables through the sanitizer; `null` is treated as no variables
    pub fn sanitize(&self, variables: Value) -> Value {
        match self.sanitizer.sanitize(variables) {
            Value::Null => Value::Object(Map::new()),
            other => other,
        }
    }

    pub fn derive(
        &self,
        query: &Arc<QueryDescriptor>,
        variables: Value,
        disambiguation_key: Option<&str>,
    ) -> Identity {
        let variables = self.sanitize(variables);

        let mut key = String::with_capacity(64);
        key.push('[');
        write_string(query.id(), &mut key);
        key.push(',');
        write_canonical(&variables, &mut key);
        key.push(',');
        // An empty key is still a key: it must not collapse onto "absent"
        match disambiguation_key {
            Some(token) => write_string(token, &mut key),
            None => key.push_str("null"),
        }
        key.push(']');

        Identity {
            key: key.into(),
            query: Arc::clone(query),
            variables: Arc::new(variables),
            disambiguation_key: disambiguation_key.map(Arc::from),
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_owned()).to_string());
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(k, out);
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
