//! The storage system: a directory of per-`venue/instrument/level` indexes.
//!
//! This is the `Y` component: it owns the `stg` marker file check, the map
//! of currently-open indexes, and the scratch buffer used to build segment
//! directory paths so no index leaks a half-built path across opens.

pub mod block;
pub mod index;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use block::Block;
pub use index::{Index, RowCursor};

use crate::config::StorageConfig;
use crate::error::{Error, Result};

const MARKER_FILE: &str = "stg";

/// A directory of indexes keyed by `venue/instrument/level`.
pub struct Storage {
    config: StorageConfig,
    indexes: HashMap<(String, String, u8), Index>,
    scratch: String,
}

impl Storage {
    /// Attaches to `config.root`, creating the `stg` marker if this is a
    /// fresh root, or failing if an existing root is missing it.
    pub fn attach(config: StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root)?;
        let marker = config.root.join(MARKER_FILE);
        if !marker.exists() {
            std::fs::File::create(&marker)?;
        }
        if !marker.exists() {
            log::error!("storage root {} missing 'stg' marker file", config.root.display());
            return Err(Error::MissingMarker);
        }
        Ok(Storage { config, indexes: HashMap::new(), scratch: String::new() })
    }

    fn path_for(&mut self, venue: &str, instrument: &str, level: u8) -> PathBuf {
        self.scratch.clear();
        self.scratch.push_str(venue);
        self.scratch.push('/');
        self.scratch.push_str(instrument);
        self.scratch.push('/');
        self.scratch.push_str(&level.to_string());
        self.config.root.join(&self.scratch)
    }

    /// Opens (creating on first use) the index for `venue/instrument/level`.
    pub fn open(&mut self, venue: &str, instrument: &str, level: u8) -> Result<&mut Index> {
        let key = (venue.to_string(), instrument.to_string(), level);
        if !self.indexes.contains_key(&key) {
            let dir = self.path_for(venue, instrument, level);
            let index = Index::open(&self.config, dir, level)?;
            self.indexes.insert(key.clone(), index);
        }
        Ok(self.indexes.get_mut(&key).expect("just inserted"))
    }

    /// Drops the in-memory handle for `venue/instrument/level`. The on-disk
    /// index persists; a later `open` reattaches fresh.
    pub fn close(&mut self, venue: &str, instrument: &str, level: u8) {
        self.indexes.remove(&(venue.to_string(), instrument.to_string(), level));
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }
}
