//! Collection-valued resources with add/remove rules.

use std::ops::Deref;
use std::sync::Arc;

use simplestore_core::Transaction;

use crate::environment::Environment;
use crate::error::{ResourceError, ResourceResult};
use crate::resource::{Resource, ResourceType};

/// A resource whose value is a collection.
///
/// The default value is `make_details` when the type has a rule, otherwise
/// `Value::default()` (the empty collection).
pub trait ContainerType: ResourceType
where
    Self::Value: Default,
{
    /// What `add` takes.
    type Item;
    /// What `remove` reports as removed.
    type Removed;

    fn add_item(collection: Self::Value, item: &Self::Item) -> ResourceResult<Self::Value>;

    /// Remove `item`. Returns what was removed and the remaining collection;
    /// the rule decides what a missing item means.
    fn remove_item(collection: Self::Value, item: &Self::Item) -> ResourceResult<(Self::Removed, Self::Value)>;
}

/// One key of a container type.
pub struct Container<T: ContainerType>
where
    T::Value: Default,
{
    inner: Resource<T>,
}

impl<T: ContainerType> Container<T>
where
    T::Value: Default,
{
    pub fn open<S: AsRef<str>>(env: &Arc<Environment>, parts: &[S]) -> ResourceResult<Self> {
        Ok(Self { inner: Resource::open(env, parts)? })
    }

    pub fn new<S: AsRef<str>>(parts: &[S]) -> ResourceResult<Self> {
        Ok(Self { inner: Resource::new(parts)? })
    }

    /// The stored collection, or the default one (persisted on first read).
    pub fn get(&self, txn: Option<&Transaction>) -> ResourceResult<T::Value> {
        if let Some(value) = self.inner.get(txn)? {
            return Ok(value);
        }
        let empty = T::Value::default();
        self.inner.put(Some(&empty), txn)?;
        Ok(empty)
    }

    /// Add `item`; returns it with the updated collection.
    pub fn add(&self, item: T::Item, txn: Option<&Transaction>) -> ResourceResult<(T::Item, T::Value)> {
        let after = self.inner.alter(
            |current| {
                let collection = current.unwrap_or_default();
                T::add_item(collection, &item).map(Some)
            },
            txn,
        )?;
        Ok((item, after.unwrap_or_default()))
    }

    /// Remove `item`; returns what was removed and the remaining collection.
    pub fn remove(&self, item: &T::Item, txn: Option<&Transaction>) -> ResourceResult<(T::Removed, T::Value)> {
        let mut removed = None;
        let after = self.inner.alter(
            |current| {
                let (gone, rest) = T::remove_item(current.unwrap_or_default(), item)?;
                removed = Some(gone);
                Ok(Some(rest))
            },
            txn,
        )?;
        let removed = removed.ok_or_else(|| ResourceError::NotFound(self.inner.to_string()))?;
        Ok((removed, after.unwrap_or_default()))
    }

    pub fn resource(&self) -> &Resource<T> {
        &self.inner
    }
}

impl<T: ContainerType> Deref for Container<T>
where
    T::Value: Default,
{
    type Target = Resource<T>;

    fn deref(&self) -> &Resource<T> {
        &self.inner
    }
}

impl<T: ContainerType> std::fmt::Debug for Container<T>
where
    T::Value: Default,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.inner, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Schema;
    use simplestore_core::Config;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    struct Tags;

    impl ResourceType for Tags {
        const SCHEMA: Schema = Schema::new("Tags", &["post"]);
        type Value = BTreeSet<String>;
    }

    impl ContainerType for Tags {
        type Item = String;
        type Removed = bool;

        fn add_item(mut tags: BTreeSet<String>, item: &String) -> ResourceResult<BTreeSet<String>> {
            tags.insert(item.clone());
            Ok(tags)
        }

        fn remove_item(mut tags: BTreeSet<String>, item: &String) -> ResourceResult<(bool, BTreeSet<String>)> {
            let removed = tags.remove(item);
            Ok((removed, tags))
        }
    }

    fn env() -> (Arc<Environment>, TempDir) {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), Config::relaxed()).unwrap();
        (env, dir)
    }

    #[test]
    fn test_empty_default_is_persisted() {
        let (env, _dir) = env();
        let tags = Container::<Tags>::open(&env, &["p1"]).unwrap();
        assert!(tags.get(None).unwrap().is_empty());
        assert!(Resource::<Tags>::has_key(&env, b"p1").unwrap());
    }

    #[test]
    fn test_add_and_remove() {
        let (env, _dir) = env();
        let tags = Container::<Tags>::open(&env, &["p2"]).unwrap();
        let (added, set) = tags.add("rust".to_string(), None).unwrap();
        assert_eq!(added, "rust");
        assert_eq!(set.len(), 1);
        tags.add("db".to_string(), None).unwrap();

        let (removed, rest) = tags.remove(&"rust".to_string(), None).unwrap();
        assert!(removed);
        assert_eq!(rest.into_iter().collect::<Vec<_>>(), vec!["db"]);

        let (removed, rest) = tags.remove(&"missing".to_string(), None).unwrap();
        assert!(!removed);
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_deref_to_resource() {
        let (env, _dir) = env();
        let tags = Container::<Tags>::open(&env, &["p3"]).unwrap();
        assert_eq!(tags.db_key(), b"p3");
        assert_eq!(format!("{:?}", tags), "Tags(\"p3\")");
    }
}
