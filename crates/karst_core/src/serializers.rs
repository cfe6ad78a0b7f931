//! Per-collection serialization hooks.
//!
//! Every user-facing row passes through a serializer on the way in and
//! a deserializer on the way out. A pre-sanitizer may rewrite a value
//! before it is serialized; a post-sanitizer observes the final value
//! once the write is staged. Objects and metadata are hooked
//! independently. Hooks can be registered per collection or as
//! database-wide defaults; a transaction captures the table in effect
//! when it begins, so later registrations never affect a transaction
//! already running.

use karst_codec::{from_bytes, to_canonical_bytes, CodecResult, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Turns a value into the bytes stored for it.
///
/// Receives the collection and key so callers can vary the format per
/// row.
pub type Serializer = Arc<dyn Fn(&str, &str, &Value) -> CodecResult<Vec<u8>> + Send + Sync>;

/// Turns stored bytes back into a value.
pub type Deserializer = Arc<dyn Fn(&str, &str, &[u8]) -> CodecResult<Value> + Send + Sync>;

/// Rewrites a value before it is serialized. The returned value is
/// what gets stored, cached, and carried by the commit's change set.
pub type Sanitizer = Arc<dyn Fn(&str, &str, Value) -> Value + Send + Sync>;

/// Observes the final value of a write once it is staged. Runs for its
/// side effects only; the value is already fixed.
pub type PostSanitizer = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

/// Which plane of a row a hook registration targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPlane {
    /// The object payload.
    Object,
    /// The metadata payload.
    Metadata,
}

/// The hooks for one plane of one collection.
#[derive(Clone)]
struct HookPair {
    serializer: Serializer,
    deserializer: Deserializer,
    /// Applied to values before serialization.
    pre_sanitizer: Option<Sanitizer>,
    /// Called with the final value after a write is staged.
    post_sanitizer: Option<PostSanitizer>,
}

impl HookPair {
    fn canonical() -> Self {
        Self {
            serializer: Arc::new(|_, _, value| to_canonical_bytes(value)),
            deserializer: Arc::new(|_, _, bytes| from_bytes(bytes)),
            pre_sanitizer: None,
            post_sanitizer: None,
        }
    }

    fn serialize(
        &self,
        collection: &str,
        key: &str,
        value: Value,
    ) -> CodecResult<(Arc<Value>, Vec<u8>)> {
        let value = match &self.pre_sanitizer {
            Some(sanitize) => sanitize(collection, key, value),
            None => value,
        };
        let bytes = (self.serializer)(collection, key, &value)?;
        Ok((Arc::new(value), bytes))
    }

    fn deserialize(&self, collection: &str, key: &str, bytes: &[u8]) -> CodecResult<Value> {
        (self.deserializer)(collection, key, bytes)
    }
}

#[derive(Clone)]
struct HookSet {
    object: HookPair,
    metadata: HookPair,
}

impl HookSet {
    fn canonical() -> Self {
        Self {
            object: HookPair::canonical(),
            metadata: HookPair::canonical(),
        }
    }

    fn plane(&self, plane: HookPlane) -> &HookPair {
        match plane {
            HookPlane::Object => &self.object,
            HookPlane::Metadata => &self.metadata,
        }
    }

    fn plane_mut(&mut self, plane: HookPlane) -> &mut HookPair {
        match plane {
            HookPlane::Object => &mut self.object,
            HookPlane::Metadata => &mut self.metadata,
        }
    }
}

/// All registered hooks, snapshotted per transaction.
#[derive(Clone)]
pub(crate) struct HookTable {
    defaults: HookSet,
    per_collection: HashMap<String, HookSet>,
}

impl HookTable {
    pub(crate) fn new() -> Self {
        Self {
            defaults: HookSet::canonical(),
            per_collection: HashMap::new(),
        }
    }

    fn hooks_for(&self, collection: &str) -> &HookSet {
        self.per_collection.get(collection).unwrap_or(&self.defaults)
    }

    /// Sanitizes and serializes an object bound for storage.
    ///
    /// Returns the sanitized value (the one caches and change sets must
    /// carry) together with its bytes.
    pub(crate) fn serialize_object(
        &self,
        collection: &str,
        key: &str,
        value: Value,
    ) -> CodecResult<(Arc<Value>, Vec<u8>)> {
        self.hooks_for(collection)
            .object
            .serialize(collection, key, value)
    }

    /// Sanitizes and serializes a metadata value bound for storage.
    pub(crate) fn serialize_metadata(
        &self,
        collection: &str,
        key: &str,
        value: Value,
    ) -> CodecResult<(Arc<Value>, Vec<u8>)> {
        self.hooks_for(collection)
            .metadata
            .serialize(collection, key, value)
    }

    /// Serializes an already-sanitized object, skipping the
    /// pre-sanitizer. Used when restaging a value the transaction
    /// already holds in its final form.
    pub(crate) fn encode_object(
        &self,
        collection: &str,
        key: &str,
        value: &Value,
    ) -> CodecResult<Vec<u8>> {
        (self.hooks_for(collection).object.serializer)(collection, key, value)
    }

    /// Deserializes stored object bytes.
    pub(crate) fn deserialize_object(
        &self,
        collection: &str,
        key: &str,
        bytes: &[u8],
    ) -> CodecResult<Value> {
        self.hooks_for(collection)
            .object
            .deserialize(collection, key, bytes)
    }

    /// Deserializes stored metadata bytes.
    pub(crate) fn deserialize_metadata(
        &self,
        collection: &str,
        key: &str,
        bytes: &[u8],
    ) -> CodecResult<Value> {
        self.hooks_for(collection)
            .metadata
            .deserialize(collection, key, bytes)
    }

    /// Runs the post-sanitizer for a freshly staged write, if one is
    /// registered for the row's collection and plane.
    pub(crate) fn post_write(&self, collection: &str, key: &str, plane: HookPlane, value: &Value) {
        if let Some(observe) = &self.hooks_for(collection).plane(plane).post_sanitizer {
            observe(collection, key, value);
        }
    }

    fn entry(&mut self, collection: Option<&str>, plane: HookPlane) -> &mut HookPair {
        match collection {
            Some(name) => self
                .per_collection
                .entry(name.to_string())
                .or_insert_with(|| self.defaults.clone())
                .plane_mut(plane),
            None => self.defaults.plane_mut(plane),
        }
    }

    /// Sets the serializer for `collection`, or the default when `None`.
    pub(crate) fn set_serializer(
        &mut self,
        collection: Option<&str>,
        plane: HookPlane,
        serializer: Serializer,
    ) {
        self.entry(collection, plane).serializer = serializer;
    }

    /// Sets the deserializer for `collection`, or the default when `None`.
    pub(crate) fn set_deserializer(
        &mut self,
        collection: Option<&str>,
        plane: HookPlane,
        deserializer: Deserializer,
    ) {
        self.entry(collection, plane).deserializer = deserializer;
    }

    /// Sets the pre-write sanitizer for `collection`, or the default.
    pub(crate) fn set_pre_sanitizer(
        &mut self,
        collection: Option<&str>,
        plane: HookPlane,
        sanitizer: Sanitizer,
    ) {
        self.entry(collection, plane).pre_sanitizer = Some(sanitizer);
    }

    /// Sets the post-write sanitizer for `collection`, or the default.
    pub(crate) fn set_post_sanitizer(
        &mut self,
        collection: Option<&str>,
        plane: HookPlane,
        sanitizer: PostSanitizer,
    ) {
        self.entry(collection, plane).post_sanitizer = Some(sanitizer);
    }
}

impl std::fmt::Debug for HookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookTable")
            .field("collections", &self.per_collection.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_roundtrip_by_default() {
        let table = HookTable::new();
        let value = Value::from("hello");
        let (kept, bytes) = table.serialize_object("notes", "a", value.clone()).unwrap();
        assert_eq!(*kept, value);
        assert_eq!(table.deserialize_object("notes", "a", &bytes).unwrap(), value);
    }

    #[test]
    fn object_and_metadata_planes_are_independent() {
        let mut table = HookTable::new();
        table.set_pre_sanitizer(
            Some("notes"),
            HookPlane::Metadata,
            Arc::new(|_, _, value| match value.as_integer() {
                Some(n) => Value::Integer(n * 2),
                None => value,
            }),
        );

        let (kept, bytes) = table
            .serialize_metadata("notes", "a", Value::Integer(21))
            .unwrap();
        assert_eq!(*kept, Value::Integer(42));
        assert_eq!(
            table.deserialize_metadata("notes", "a", &bytes).unwrap(),
            Value::Integer(42)
        );
        // The object plane is untouched
        let (kept, _) = table
            .serialize_object("notes", "a", Value::Integer(21))
            .unwrap();
        assert_eq!(*kept, Value::Integer(21));
    }

    #[test]
    fn per_collection_hooks_override_defaults() {
        let mut table = HookTable::new();
        table.set_serializer(
            Some("upper"),
            HookPlane::Object,
            Arc::new(|_, _, value| {
                let text = value.as_text().unwrap_or_default().to_uppercase();
                to_canonical_bytes(&Value::from(text))
            }),
        );

        let (_, bytes) = table
            .serialize_object("upper", "a", Value::from("shout"))
            .unwrap();
        assert_eq!(
            table.deserialize_object("upper", "a", &bytes).unwrap(),
            Value::from("SHOUT")
        );

        let (_, bytes) = table
            .serialize_object("notes", "a", Value::from("quiet"))
            .unwrap();
        assert_eq!(
            table.deserialize_object("notes", "a", &bytes).unwrap(),
            Value::from("quiet")
        );
    }

    #[test]
    fn pre_sanitizer_shapes_the_recorded_value() {
        let mut table = HookTable::new();
        table.set_pre_sanitizer(
            None,
            HookPlane::Object,
            Arc::new(|_, _, value| match value.as_integer() {
                Some(n) => Value::Integer(n.max(0)),
                None => value,
            }),
        );

        let (kept, _) = table
            .serialize_object("notes", "a", Value::Integer(-5))
            .unwrap();
        assert_eq!(*kept, Value::Integer(0));
    }

    #[test]
    fn post_sanitizer_observes_staged_writes() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        let mut table = HookTable::new();
        table.set_post_sanitizer(
            Some("notes"),
            HookPlane::Object,
            Arc::new(move |collection, key, value| {
                recorded
                    .lock()
                    .push(format!("{collection}/{key}={value:?}"));
            }),
        );

        table.post_write("notes", "a", HookPlane::Object, &Value::Integer(7));
        // Other collections and planes stay silent
        table.post_write("tasks", "a", HookPlane::Object, &Value::Integer(8));
        table.post_write("notes", "a", HookPlane::Metadata, &Value::Integer(9));

        assert_eq!(*seen.lock(), vec!["notes/a=Integer(7)".to_string()]);
    }

    #[test]
    fn encode_object_skips_the_pre_sanitizer() {
        let mut table = HookTable::new();
        table.set_pre_sanitizer(
            None,
            HookPlane::Object,
            Arc::new(|_, _, _| Value::Null),
        );

        let bytes = table
            .encode_object("notes", "a", &Value::Integer(7))
            .unwrap();
        assert_eq!(
            table.deserialize_object("notes", "a", &bytes).unwrap(),
            Value::Integer(7)
        );
    }
}
