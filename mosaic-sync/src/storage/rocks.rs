//! RocksDB-backed pixel store.
//!
//! Column families:
//! - `pixels`   — one entry per occupied cell, keyed by `<y:4 BE><x:4 BE>`
//!                so a forward scan is row-major; value is the bincode cell
//! - `metadata` — grid dimensions the store was created with
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

use crate::cell::Cell;
use crate::grid::GridDimensions;
use crate::storage::{PixelStore, StoreError};

/// Column family names.
const CF_PIXELS: &str = "pixels";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_PIXELS, CF_METADATA];

const META_DIMENSIONS: &[u8] = b"dimensions";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mosaic_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024, // 4MB
            max_open_files: 64,
            ..Self::default()
        }
    }
}

/// RocksDB-backed [`PixelStore`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode: column families are fixed at open)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    dimensions: GridDimensions,
}

impl RocksStore {
    /// Open the store for a grid of the given size.
    ///
    /// A fresh database records `dimensions`; an existing one must match
    /// them, since the grid cannot be resized.
    pub fn open(config: StoreConfig, dimensions: GridDimensions) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let store = Self {
            db,
            config,
            dimensions,
        };
        store.check_dimensions()?;
        log::info!(
            "Opened pixel store at {} ({}x{})",
            store.config.path.display(),
            dimensions.width,
            dimensions.height
        );
        Ok(store)
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_PIXELS => {
                // Small fixed-size values, many point overwrites
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Record the grid size on first open, verify it afterwards.
    fn check_dimensions(&self) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, META_DIMENSIONS)? {
            Some(bytes) => {
                let (stored, _): (GridDimensions, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                if stored != self.dimensions {
                    return Err(StoreError::DimensionMismatch {
                        stored_width: stored.width,
                        stored_height: stored.height,
                        width: self.dimensions.width,
                        height: self.dimensions.height,
                    });
                }
                Ok(())
            }
            None => {
                let encoded =
                    bincode::serde::encode_to_vec(self.dimensions, bincode::config::standard())
                        .map_err(|e| StoreError::Serialization(e.to_string()))?;
                self.db.put_cf_opt(cf, META_DIMENSIONS, encoded, &self.write_options())?;
                Ok(())
            }
        }
    }

    /// Count stored cells.
    pub fn cell_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Force a memtable flush to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn dimensions(&self) -> GridDimensions {
        self.dimensions
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Build a pixel key: y (4 bytes BE) + x (4 bytes BE).
    fn pixel_key(x: u32, y: u32) -> [u8; 8] {
        let mut key = [0u8; 8];
        key[..4].copy_from_slice(&y.to_be_bytes());
        key[4..].copy_from_slice(&x.to_be_bytes());
        key
    }
}

impl PixelStore for RocksStore {
    fn persist(&self, cell: &Cell) -> Result<(), StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        let encoded = bincode::serde::encode_to_vec(cell, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.db.put_cf_opt(
            cf,
            Self::pixel_key(cell.x, cell.y),
            encoded,
            &self.write_options(),
        )?;
        Ok(())
    }

    fn delete_persisted(&self, x: u32, y: u32) -> Result<(), StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        self.db
            .delete_cf_opt(cf, Self::pixel_key(x, y), &self.write_options())?;
        Ok(())
    }

    fn clear_all_persisted(&self) -> Result<(), StoreError> {
        let cf = self.cf(CF_PIXELS)?;

        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(cf, &key);
            count += 1;
        }

        if count > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        log::debug!("Cleared {count} persisted cells");
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Cell>, StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        let mut cells = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let (cell, _): (Cell, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            cells.push(cell);
        }

        Ok(cells)
    }
}
