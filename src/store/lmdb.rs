//! LMDB namespace backend.

use std::path::Path;

use heed::types::Bytes as RawBytes;
use heed::{Database, Env, EnvOpenOptions};
use tracing::debug;

use crate::error::StoreError;
use crate::tile::{TileAddress, TileEntry};

use super::codec::{decode_value, encode_key, encode_value};
use super::{BackendKind, NamespaceBackend};

const TILES_DB: &str = "tiles";

pub(crate) struct LmdbNamespace {
    name: String,
    env: Env,
    db: Database<RawBytes, RawBytes>,
}

impl LmdbNamespace {
    pub fn open(name: &str, dir: &Path, map_size: usize) -> Result<Self, StoreError> {
        let open_err = |e: heed::Error| StoreError::Open {
            namespace: name.to_string(),
            message: e.to_string(),
        };

        // SAFETY: the store root lock guarantees no other process maps these
        // files, and the registry opens each namespace at most once.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(dir)
        }
        .map_err(open_err)?;

        let mut wtxn = env.write_txn().map_err(open_err)?;
        let db: Database<RawBytes, RawBytes> = env
            .create_database(&mut wtxn, Some(TILES_DB))
            .map_err(open_err)?;
        wtxn.commit().map_err(open_err)?;

        debug!(namespace = name, path = %dir.display(), "Opened LMDB namespace");

        Ok(Self {
            name: name.to_string(),
            env,
            db,
        })
    }

    fn backend_err(&self, e: heed::Error) -> StoreError {
        StoreError::Backend {
            namespace: self.name.clone(),
            message: e.to_string(),
        }
    }
}

impl NamespaceBackend for LmdbNamespace {
    fn kind(&self) -> BackendKind {
        BackendKind::Lmdb
    }

    fn put(&self, entry: &TileEntry) -> Result<(), StoreError> {
        let value = encode_value(entry).map_err(|message| StoreError::Backend {
            namespace: self.name.clone(),
            message,
        })?;

        let mut wtxn = self.env.write_txn().map_err(|e| self.backend_err(e))?;
        self.db
            .put(&mut wtxn, &encode_key(entry.address), &value)
            .map_err(|e| self.backend_err(e))?;
        wtxn.commit().map_err(|e| self.backend_err(e))
    }

    fn get(&self, address: TileAddress) -> Result<Option<TileEntry>, StoreError> {
        let rtxn = self.env.read_txn().map_err(|e| self.backend_err(e))?;
        let Some(value) = self
            .db
            .get(&rtxn, &encode_key(address))
            .map_err(|e| self.backend_err(e))?
        else {
            return Ok(None);
        };

        decode_value(address, value)
            .map(Some)
            .map_err(|message| StoreError::Corrupt {
                namespace: self.name.clone(),
                message: format!("{}: {}", address, message),
            })
    }

    fn contains(&self, address: TileAddress) -> Result<bool, StoreError> {
        let rtxn = self.env.read_txn().map_err(|e| self.backend_err(e))?;
        let found = self
            .db
            .get(&rtxn, &encode_key(address))
            .map_err(|e| self.backend_err(e))?;
        Ok(found.is_some())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(|e| self.backend_err(e))?;
        self.db.clear(&mut wtxn).map_err(|e| self.backend_err(e))?;
        wtxn.commit().map_err(|e| self.backend_err(e))
    }

    fn tile_count(&self) -> Result<u64, StoreError> {
        let rtxn = self.env.read_txn().map_err(|e| self.backend_err(e))?;
        self.db.len(&rtxn).map_err(|e| self.backend_err(e))
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.env.force_sync().map_err(|e| self.backend_err(e))
    }
}
