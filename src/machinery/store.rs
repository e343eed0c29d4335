// heed based KV store backing the local api server

use std::{marker::PhantomData, path::Path};

use anyhow::Result;
use heed::{
    Database, Env, EnvOpenOptions,
    types::{Bytes, Str},
};
use serde::{Serialize, de::DeserializeOwned};
use tokio::fs::create_dir_all;

use crate::resources::metadata::ResourceId;

/// Location of one object: `<kind>/<namespace>/<name>`, or `<kind>/<name>`
/// when cluster scoped. `D` is the type stored under it.
pub struct Key<D> {
    path: String,
    _marker: PhantomData<fn() -> D>,
}

impl<D> Key<D> {
    pub fn object(kind: &str, id: &ResourceId) -> Self {
        let path = match &id.namespace {
            Some(namespace) => format!("{}/{}/{}", kind, namespace, id.name),
            None => format!("{}/{}", kind, id.name),
        };
        Self {
            path,
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }
}

/// Prefix matching every object of a kind, or of a kind in one namespace.
pub struct Prefix<D> {
    path: String,
    _marker: PhantomData<fn() -> D>,
}

impl<D> Prefix<D> {
    pub fn kind(kind: &str) -> Self {
        Self {
            path: format!("{}/", kind),
            _marker: PhantomData,
        }
    }

    pub fn namespace(kind: &str, namespace: &str) -> Self {
        Self {
            path: format!("{}/{}/", kind, namespace),
            _marker: PhantomData,
        }
    }
}

/// Outcome of a read-modify-write done with [`Store::update`].
pub enum StoreWrite<D> {
    Put(D),
    Delete,
    Keep,
}

pub struct Store {
    db: Database<Str, Bytes>,
    env: Env,
}

impl Store {
    pub async fn new(dir_path: impl AsRef<Path>) -> Result<Self> {
        let dir_path = dir_path.as_ref();
        if !dir_path.exists() {
            create_dir_all(dir_path).await?;
        }

        let env = unsafe { EnvOpenOptions::new().open(dir_path)? };

        let db = {
            let mut wtxn = env.write_txn()?;
            let db: Database<Str, Bytes> = env.create_database(&mut wtxn, None)?;
            wtxn.commit()?;

            db
        };

        Ok(Self { db, env })
    }

    pub fn get<D: DeserializeOwned>(&self, key: &Key<D>) -> Result<Option<D>> {
        let rtxn = self.env.read_txn()?;
        match self.db.get(&rtxn, key.as_str())? {
            Some(v) => Ok(Some(serde_json::from_slice(v)?)),
            None => Ok(None),
        }
    }

    pub fn list<D: DeserializeOwned>(&self, prefix: &Prefix<D>) -> Result<Vec<D>> {
        let rtxn = self.env.read_txn()?;

        let mut values = Vec::new();
        for entry in self.db.prefix_iter(&rtxn, &prefix.path)? {
            let (_, v) = entry?;
            values.push(serde_json::from_slice(v)?);
        }
        Ok(values)
    }

    /// Reads the current value and applies `f` to it inside a single write
    /// transaction. Nothing is written when `f` fails.
    pub fn update<D, T>(
        &self,
        key: &Key<D>,
        f: impl FnOnce(Option<D>) -> Result<(StoreWrite<D>, T)>,
    ) -> Result<T>
    where
        D: Serialize + DeserializeOwned,
    {
        let mut wtxn = self.env.write_txn()?;

        let current = match self.db.get(&wtxn, key.as_str())? {
            Some(v) => Some(serde_json::from_slice(v)?),
            None => None,
        };

        let (write, out) = f(current)?;
        match write {
            StoreWrite::Put(value) => {
                let value = serde_json::to_vec(&value)?;
                self.db.put(&mut wtxn, key.as_str(), &value)?;
            }
            StoreWrite::Delete => {
                self.db.delete(&mut wtxn, key.as_str())?;
            }
            StoreWrite::Keep => {}
        }
        wtxn.commit()?;

        Ok(out)
    }
}
