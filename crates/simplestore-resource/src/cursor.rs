//! Typed cursors: engine cursors that decode keys and values.

use std::marker::PhantomData;

use simplestore_core::{Entry, RawCursor};

use crate::codec;
use crate::error::{ResourceError, ResourceResult};
use crate::resource::ResourceType;

/// How [`Cursor::get_with_key`] positions the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Positioning {
    /// Exactly the given key
    Set,
    /// The first key greater than or equal to the given one
    SetRange,
}

/// Decoded key parts and value.
pub type Item<T> = (Vec<String>, <T as ResourceType>::Value);

/// Cursor over the table of resource type `T`, bound to one transaction.
pub struct Cursor<'t, T: ResourceType> {
    raw: RawCursor<'t>,
    _type: PhantomData<fn() -> T>,
}

impl<'t, T: ResourceType> Cursor<'t, T> {
    pub(crate) fn new(raw: RawCursor<'t>) -> Self {
        Self { raw, _type: PhantomData }
    }

    /// Next record in key order; `None` at the end of the table.
    pub fn next(&mut self) -> ResourceResult<Option<Item<T>>> {
        let entry = self.raw.next()?;
        Self::decode(entry)
    }

    pub fn prev(&mut self) -> ResourceResult<Option<Item<T>>> {
        let entry = self.raw.prev()?;
        Self::decode(entry)
    }

    pub fn first(&mut self) -> ResourceResult<Option<Item<T>>> {
        let entry = self.raw.first()?;
        Self::decode(entry)
    }

    pub fn last(&mut self) -> ResourceResult<Option<Item<T>>> {
        let entry = self.raw.last()?;
        Self::decode(entry)
    }

    pub fn current(&mut self) -> ResourceResult<Option<Item<T>>> {
        let entry = self.raw.current()?;
        Self::decode(entry)
    }

    /// Next duplicate record of the current key.
    pub fn next_dup(&mut self) -> ResourceResult<Option<Item<T>>> {
        let entry = self.raw.next_dup()?;
        Self::decode(entry)
    }

    /// First record of the next key.
    pub fn next_nodup(&mut self) -> ResourceResult<Option<Item<T>>> {
        let entry = self.raw.next_nodup()?;
        Self::decode(entry)
    }

    /// Records under the current key.
    pub fn count(&mut self) -> ResourceResult<usize> {
        Ok(self.raw.count()?)
    }

    /// Position by key. `Set` needs every key part; `SetRange` also takes
    /// leading parts only.
    pub fn get_with_key<S: AsRef<str>>(&mut self, parts: &[S], positioning: Positioning) -> ResourceResult<Option<Item<T>>> {
        match positioning {
            Positioning::Set => {
                let key = codec::encode_key(parts, T::SCHEMA.arity())?;
                match self.raw.set(&key)? {
                    Some(value) => Self::decode(Some((key, value))),
                    None => Ok(None),
                }
            }
            Positioning::SetRange => {
                if parts.is_empty() || parts.len() > T::SCHEMA.arity() {
                    return Err(ResourceError::validation(format!(
                        "expected 1 to {} key parts, got {}",
                        T::SCHEMA.arity(),
                        parts.len()
                    )));
                }
                let key = codec::encode_key(parts, parts.len())?;
                let entry = self.raw.set_range(&key)?;
                Self::decode(entry)
            }
        }
    }

    /// Independent cursor at the same position in the same transaction.
    pub fn dup(&self) -> ResourceResult<Cursor<'t, T>> {
        Ok(Self::new(self.raw.dup()?))
    }

    /// Release the cursor. Calling it again is a no-op.
    pub fn close(&mut self) {
        self.raw.close();
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_closed()
    }

    fn decode(entry: Option<Entry>) -> ResourceResult<Option<Item<T>>> {
        match entry {
            Some((key, value)) => {
                let parts = codec::decode_key(&key)?;
                let value = codec::deserialize(&value, T::VALUE_VERSION)?;
                Ok(Some((parts, value)))
            }
            None => Ok(None),
        }
    }
}

impl<T: ResourceType> std::fmt::Debug for Cursor<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("resource", &T::SCHEMA.name).field("raw", &self.raw).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::registry::Schema;
    use crate::resource::Resource;
    use simplestore_core::{Config, StoreError};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Score;

    impl ResourceType for Score {
        const SCHEMA: Schema = Schema::new("Score", &["player"]);
        type Value = i64;
    }

    struct Event;

    impl ResourceType for Event {
        const SCHEMA: Schema = Schema::new("Event", &["day", "kind"]).with_duplicates();
        type Value = String;
    }

    fn env() -> (Arc<Environment>, TempDir) {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), Config::relaxed()).unwrap();
        (env, dir)
    }

    fn item(key: &[&str], value: i64) -> Option<Item<Score>> {
        Some((key.iter().map(|k| k.to_string()).collect(), value))
    }

    #[test]
    fn test_typed_walk() {
        let (env, _dir) = env();
        for (player, score) in [("b", 2), ("a", 1)] {
            Resource::<Score>::open(&env, &[player]).unwrap().put(Some(&score), None).unwrap();
        }
        let txn = env.begin_transaction().unwrap();
        let mut cursor = Resource::<Score>::cursor(&env, &txn, false).unwrap();
        assert_eq!(cursor.next().unwrap(), item(&["a"], 1));
        assert_eq!(cursor.next().unwrap(), item(&["b"], 2));
        assert_eq!(cursor.next().unwrap(), None);
        assert_eq!(cursor.prev().unwrap(), item(&["a"], 1));
        assert_eq!(cursor.last().unwrap(), item(&["b"], 2));
    }

    #[test]
    fn test_get_with_key() {
        let (env, _dir) = env();
        for (player, score) in [("ann", 5), ("cid", 7)] {
            Resource::<Score>::open(&env, &[player]).unwrap().put(Some(&score), None).unwrap();
        }
        let txn = env.begin_transaction().unwrap();
        let mut cursor = Resource::<Score>::cursor(&env, &txn, true).unwrap();
        assert_eq!(cursor.get_with_key(&["cid"], Positioning::Set).unwrap(), item(&["cid"], 7));
        assert_eq!(cursor.get_with_key(&["bob"], Positioning::Set).unwrap(), None);
        assert_eq!(cursor.get_with_key(&["bob"], Positioning::SetRange).unwrap(), item(&["cid"], 7));
        assert!(matches!(
            cursor.get_with_key::<&str>(&[], Positioning::SetRange),
            Err(ResourceError::Validation(_))
        ));
    }

    #[test]
    fn test_duplicate_records() {
        let (env, _dir) = env();
        let monday = Resource::<Event>::open(&env, &["mon", "login"]).unwrap();
        monday.put_dup(&"alice".to_string(), None).unwrap();
        monday.put_dup(&"bob".to_string(), None).unwrap();
        Resource::<Event>::open(&env, &["tue", "login"]).unwrap().put(Some(&"carol".to_string()), None).unwrap();

        let txn = env.begin_transaction().unwrap();
        let mut cursor = Resource::<Event>::cursor(&env, &txn, false).unwrap();
        let (key, first) = cursor.first().unwrap().unwrap();
        assert_eq!(key, vec!["mon", "login"]);
        assert_eq!(first, "alice");
        assert_eq!(cursor.count().unwrap(), 2);
        assert_eq!(cursor.next_dup().unwrap().map(|(_, v)| v), Some("bob".to_string()));
        assert_eq!(cursor.next_dup().unwrap(), None);
        cursor.first().unwrap();
        assert_eq!(cursor.next_nodup().unwrap().map(|(_, v)| v), Some("carol".to_string()));
    }

    #[test]
    fn test_close_twice_then_use_fails() {
        let (env, _dir) = env();
        let txn = env.begin_transaction().unwrap();
        let mut cursor = Resource::<Score>::cursor(&env, &txn, false).unwrap();
        cursor.close();
        cursor.close();
        assert!(cursor.is_closed());
        assert!(matches!(cursor.next(), Err(ResourceError::Store(StoreError::CursorClosed(_)))));
    }
}
