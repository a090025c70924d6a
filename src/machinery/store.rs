// heed backed local bookkeeping store (cpu pins, action journal)

use anyhow::{Context, Result};
use heed::{
    Database, Env, EnvOpenOptions,
    types::{Bytes, Str},
};
use serde::{Serialize, de::DeserializeOwned};
use std::{marker::PhantomData, path::PathBuf};
use tokio::fs::create_dir_all;

/// Full key of one record: `<collection>/<id>`.
pub struct Key<D>(String, PhantomData<D>)
where
    D: Serialize + DeserializeOwned;

/// Prefix over a collection, or over part of one.
pub struct PartialKey<D>(String, PhantomData<D>)
where
    D: Serialize + DeserializeOwned;

impl<D> Key<D>
where
    D: Serialize + DeserializeOwned,
{
    pub fn new(collection: impl AsRef<str>, id: impl AsRef<str>) -> Self {
        Key(
            format!("{}/{}", collection.as_ref(), id.as_ref()),
            PhantomData,
        )
    }
}

impl<D> PartialKey<D>
where
    D: Serialize + DeserializeOwned,
{
    pub fn collection(collection: impl AsRef<str>) -> Self {
        PartialKey(format!("{}/", collection.as_ref()), PhantomData)
    }

    pub fn prefixed(collection: impl AsRef<str>, prefix: impl AsRef<str>) -> Self {
        PartialKey(
            format!("{}/{}", collection.as_ref(), prefix.as_ref()),
            PhantomData,
        )
    }
}

impl<D> From<&Key<D>> for Key<D>
where
    D: Serialize + DeserializeOwned,
{
    fn from(key: &Key<D>) -> Self {
        Key(key.0.clone(), PhantomData)
    }
}

impl<D> From<&PartialKey<D>> for PartialKey<D>
where
    D: Serialize + DeserializeOwned,
{
    fn from(key: &PartialKey<D>) -> Self {
        PartialKey(key.0.clone(), PhantomData)
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub dir_path: PathBuf,
    /// Upper bound of the memory map; writes past it fail.
    pub size_mib: usize,
}

pub struct Store {
    db: Database<Str, Bytes>,
    env: Env,
}

impl Store {
    pub async fn new(config: StoreConfig) -> Result<Self> {
        if !config.dir_path.exists() {
            create_dir_all(&config.dir_path).await?;
        }

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.size_mib * 1024 * 1024)
                .open(&config.dir_path)?
        };

        let db = {
            let mut wtxn = env.write_txn()?;
            let db: Database<Str, Bytes> = env.create_database(&mut wtxn, None)?;
            wtxn.commit()?;

            db
        };

        Ok(Self { db, env })
    }

    pub fn get<D: Serialize + DeserializeOwned>(&self, key: impl Into<Key<D>>) -> Result<Option<D>> {
        let key: Key<D> = key.into();
        let rtxn = self.env.read_txn()?;
        let Some(value) = self.db.get(&rtxn, &key.0)? else {
            return Ok(None);
        };

        let value = serde_json::from_slice(value)
            .with_context(|| format!("corrupt value under {}", key.0))?;
        Ok(Some(value))
    }

    /// Every record under the prefix, in key order.
    pub fn list<D: Serialize + DeserializeOwned>(
        &self,
        key: impl Into<PartialKey<D>>,
    ) -> Result<Vec<D>> {
        let key: PartialKey<D> = key.into();
        let rtxn = self.env.read_txn()?;

        let mut values = Vec::new();
        for entry in self.db.prefix_iter(&rtxn, &key.0)? {
            let (k, v) = entry?;
            values.push(serde_json::from_slice(v).with_context(|| format!("corrupt value under {k}"))?);
        }
        Ok(values)
    }

    /// At most `limit` records under the prefix, highest key first.
    pub fn list_last<D: Serialize + DeserializeOwned>(
        &self,
        key: impl Into<PartialKey<D>>,
        limit: usize,
    ) -> Result<Vec<D>> {
        let key: PartialKey<D> = key.into();
        let rtxn = self.env.read_txn()?;

        let mut values = Vec::new();
        for entry in self.db.rev_prefix_iter(&rtxn, &key.0)?.take(limit) {
            let (k, v) = entry?;
            values.push(serde_json::from_slice(v).with_context(|| format!("corrupt value under {k}"))?);
        }
        Ok(values)
    }

    pub fn put<D: Serialize + DeserializeOwned>(
        &self,
        key: impl Into<Key<D>>,
        value: &D,
    ) -> Result<()> {
        self.put_all([(key.into(), value)])
    }

    /// Writes all records in one transaction; none land if any fails.
    pub fn put_all<'a, D: Serialize + DeserializeOwned + 'a>(
        &self,
        records: impl IntoIterator<Item = (Key<D>, &'a D)>,
    ) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        for (key, value) in records {
            let value = serde_json::to_vec(value)?;
            self.db.put(&mut wtxn, &key.0, &value)?;
        }
        wtxn.commit()?;

        Ok(())
    }

    pub fn delete<D: Serialize + DeserializeOwned>(&self, key: impl Into<Key<D>>) -> Result<()> {
        let key: Key<D> = key.into();
        let mut wtxn = self.env.write_txn()?;
        self.db.delete(&mut wtxn, &key.0)?;
        wtxn.commit()?;

        Ok(())
    }

    /// Removes every record under the prefix and returns how many were
    /// dropped.
    pub fn delete_prefix<D: Serialize + DeserializeOwned>(
        &self,
        key: impl Into<PartialKey<D>>,
    ) -> Result<usize> {
        let key: PartialKey<D> = key.into();
        let mut wtxn = self.env.write_txn()?;

        let mut keys = Vec::new();
        for entry in self.db.prefix_iter(&wtxn, &key.0)? {
            let (k, _) = entry?;
            keys.push(k.to_string());
        }
        for k in &keys {
            self.db.delete(&mut wtxn, k)?;
        }
        wtxn.commit()?;

        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pin {
        guest: String,
        cores: Vec<u32>,
    }

    fn pin(guest: &str, cores: &[u32]) -> Pin {
        Pin {
            guest: guest.to_string(),
            cores: cores.to_vec(),
        }
    }

    async fn open() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let store = Store::new(StoreConfig {
            dir_path: dir.path().join("store"),
            size_mib: 16,
        })
        .await
        .expect("failed to create store");
        (dir, store)
    }

    #[tokio::test]
    async fn test_get_put_delete() {
        let (_dir, store) = open().await;
        let key = Key::<Pin>::new("pins", "vm-1");

        assert_eq!(store.get(&key).unwrap(), None);
        store.put(&key, &pin("vm-1", &[2, 3])).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(pin("vm-1", &[2, 3])));

        store.delete(&key).unwrap();
        assert_eq!(store.get(&key).unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_all_and_list_in_key_order() {
        let (_dir, store) = open().await;
        let a = pin("vm-a", &[0]);
        let b = pin("vm-b", &[1]);
        store
            .put_all([
                (Key::new("pins", "vm-b"), &b),
                (Key::new("pins", "vm-a"), &a),
            ])
            .unwrap();

        let listed = store.list(&PartialKey::<Pin>::collection("pins")).unwrap();
        assert_eq!(listed, vec![a, b]);
    }

    #[tokio::test]
    async fn test_list_last_newest_first() {
        let (_dir, store) = open().await;
        for i in 0..5u32 {
            store
                .put(&Key::<u32>::new("actions", format!("vm-1/{i:04}")), &i)
                .unwrap();
        }
        store.put(&Key::<u32>::new("actions", "vm-2/0000"), &99).unwrap();

        let last = store
            .list_last(&PartialKey::<u32>::prefixed("actions", "vm-1/"), 3)
            .unwrap();
        assert_eq!(last, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn test_delete_prefix_keeps_other_collections() {
        let (_dir, store) = open().await;
        for i in 0..3 {
            store.put(&Key::<u32>::new("pins", format!("g{i}")), &i).unwrap();
        }
        store.put(&Key::<u32>::new("pinsets", "other"), &9).unwrap();

        let removed = store
            .delete_prefix(&PartialKey::<u32>::collection("pins"))
            .unwrap();
        assert_eq!(removed, 3);
        assert!(store.list(&PartialKey::<u32>::collection("pins")).unwrap().is_empty());
        assert_eq!(store.list(&PartialKey::<u32>::collection("pinsets")).unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_writes_past_map_size_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(StoreConfig {
            dir_path: dir.path().to_path_buf(),
            size_mib: 1,
        })
        .await
        .unwrap();

        let blob = vec![7u8; 4096];
        let mut failed = false;
        for i in 0..1024 {
            if store.put(&Key::<Vec<u8>>::new("blobs", format!("{i:04}")), &blob).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }
}
