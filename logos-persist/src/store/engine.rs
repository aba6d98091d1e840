//! RocksDB-backed embedded store with versioned partitions.
//!
//! Every document namespace owns column families ("partitions") that are
//! created by schema upgrades. The store records its schema generation in the
//! default column family, next to one key generator per partition:
//!
//! ```text
//! default CF
//!   __generation           → u64 BE
//!   __seq/updates-doc1     → next auto key, u64 BE
//! updates-doc1 CF          → <seq: u64 BE> → LZ4 record
//! custom-doc1 CF           → <key bytes>   → JSON value
//! ```
//!
//! Opening at a generation newer than the stored one runs the upgrade
//! callback with exclusive access to the database, exactly once per bump.
//! RocksDB's directory lock admits a single live instance per path, so an
//! upgrade always closes the previous instance before reopening.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch,
    WriteOptions,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::config::StoreConfig;
use crate::error::{PersistError, Result};

type Db = DBWithThreadMode<SingleThreaded>;

const DEFAULT_CF: &str = "default";
const GENERATION_KEY: &[u8] = b"__generation";
const KEYGEN_PREFIX: &str = "__seq/";

/// First key handed out by a fresh key generator.
const FIRST_AUTO_KEY: u64 = 1;

/// What a read-only probe found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// Stored schema generation
    pub generation: u64,
    /// Existing partitions (column families other than `default`)
    pub partitions: BTreeSet<String>,
}

/// An open store at a fixed schema generation.
pub struct Database {
    db: Db,
    config: StoreConfig,
    generation: u64,
    partitions: BTreeSet<String>,
    /// Block cache shared by every partition
    cache: Cache,
    /// One lock per partition; held for the whole of a partition transaction
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Database {
    /// Inspect the store without taking the directory lock.
    ///
    /// Returns `None` if no store exists at the configured path.
    pub fn probe(config: &StoreConfig) -> Result<Option<Probe>> {
        if !config.path.join("CURRENT").exists() {
            return Ok(None);
        }

        let opts = Options::default();
        let names = Db::list_cf(&opts, &config.path)?;
        let db = Db::open_cf_for_read_only(&opts, &config.path, names.iter(), false)?;
        let generation = read_generation(&db)?;

        let partitions = names
            .into_iter()
            .filter(|name| name != DEFAULT_CF)
            .collect();

        Ok(Some(Probe { generation, partitions }))
    }

    /// Open the store.
    ///
    /// `target` of `None` opens at the stored generation (1 for a new store).
    /// A target above the stored generation invokes `on_upgrade(upgrade, old,
    /// new)` before the new generation is recorded.
    pub fn open<F>(config: &StoreConfig, target: Option<u64>, on_upgrade: F) -> Result<Self>
    where
        F: FnOnce(&mut Upgrade<'_>, u64, u64) -> Result<()>,
    {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let existing = Db::list_cf(&db_opts, &config.path)
            .unwrap_or_else(|_| vec![DEFAULT_CF.to_string()]);

        // One block cache for every partition of this instance
        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = existing
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, cf_options(name, config, &cache)))
            .collect();

        let mut db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;

        let stored = read_generation(&db)?;
        let generation = target.unwrap_or(stored.max(1));
        if generation < stored {
            return Err(PersistError::VersionConflict {
                requested: generation,
                stored,
            });
        }

        let mut partitions: BTreeSet<String> = existing
            .into_iter()
            .filter(|name| name != DEFAULT_CF)
            .collect();

        if generation > stored {
            let mut upgrade = Upgrade {
                db: &mut db,
                config,
                cache: &cache,
                partitions: &mut partitions,
            };
            on_upgrade(&mut upgrade, stored, generation).map_err(|e| match e {
                PersistError::Upgrade { .. } => e,
                other => PersistError::Upgrade {
                    generation,
                    reason: other.to_string(),
                },
            })?;

            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(true);
            db.put_opt(GENERATION_KEY, generation.to_be_bytes(), &write_opts)?;
            log::info!("Store at {} upgraded: generation {stored} → {generation}", config.path.display());
        }

        Ok(Self {
            db,
            config: config.clone(),
            generation,
            partitions,
            cache,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Delete the store directory and everything in it.
    pub fn destroy(config: &StoreConfig) -> Result<()> {
        if !config.path.exists() {
            return Ok(());
        }
        Db::destroy(&Options::default(), &config.path)?;
        // RocksDB leaves the emptied directory behind
        if let Err(e) = std::fs::remove_dir_all(&config.path) {
            log::warn!("Could not remove {}: {e}", config.path.display());
        }
        Ok(())
    }

    /// Schema generation this instance was opened at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a partition exists in this generation.
    pub fn has_partition(&self, name: &str) -> bool {
        self.partitions.contains(name)
    }

    /// All partitions of this generation.
    pub fn partitions(&self) -> &BTreeSet<String> {
        &self.partitions
    }

    /// Bytes currently held by the shared block cache.
    pub fn block_cache_usage(&self) -> usize {
        self.cache.get_usage()
    }

    /// Flush the memtables of every partition to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        for name in &self.partitions {
            if let Some(cf) = self.db.cf_handle(name) {
                self.db.flush_cf(cf)?;
            }
        }
        log::trace!(
            "Flushed {} partitions (block cache {} bytes)",
            self.partitions.len(),
            self.block_cache_usage()
        );
        Ok(())
    }

    /// Run `f` as one transaction over a single partition.
    ///
    /// Writes are buffered and committed atomically when `f` returns `Ok`;
    /// an error discards them. Reads see committed data only.
    pub fn transact<R, F>(&self, partition: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R>,
    {
        let cf = self
            .db
            .cf_handle(partition)
            .ok_or_else(|| PersistError::UnknownNamespace(partition.to_string()))?;

        let lock = {
            let mut locks = self.locks.lock()?;
            locks
                .entry(partition.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock()?;

        let mut txn = Transaction {
            db: &self.db,
            cf,
            partition,
            batch: WriteBatch::default(),
            next_key: None,
        };
        let result = f(&mut txn)?;

        if !txn.batch.is_empty() {
            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(self.config.sync_writes);
            self.db.write_opt(txn.batch, &write_opts)?;
        }
        Ok(result)
    }
}

/// Exclusive access to the database while the generation is bumped.
pub struct Upgrade<'a> {
    db: &'a mut Db,
    config: &'a StoreConfig,
    cache: &'a Cache,
    partitions: &'a mut BTreeSet<String>,
}

impl Upgrade<'_> {
    /// Create a partition. Existing partitions are left untouched.
    pub fn create_partition(&mut self, name: &str) -> Result<()> {
        if name == DEFAULT_CF || self.partitions.contains(name) {
            return Ok(());
        }
        self.db.create_cf(name, &cf_options(name, self.config, self.cache))?;
        self.partitions.insert(name.to_string());
        log::debug!("Created partition '{name}'");
        Ok(())
    }

    /// Drop a partition and its key generator. Missing partitions are ignored.
    pub fn delete_partition(&mut self, name: &str) -> Result<()> {
        if !self.partitions.remove(name) {
            return Ok(());
        }
        self.db.drop_cf(name)?;
        self.db.delete(keygen_key(name))?;
        log::debug!("Dropped partition '{name}'");
        Ok(())
    }
}

/// A transaction over one partition, holding that partition's lock.
pub struct Transaction<'a> {
    db: &'a Db,
    cf: &'a ColumnFamily,
    partition: &'a str,
    batch: WriteBatch,
    /// Key generator value, loaded on first `add`
    next_key: Option<u64>,
}

impl Transaction<'_> {
    /// Insert `value` under the next auto-incremented key.
    pub fn add(&mut self, value: &[u8]) -> Result<u64> {
        let key = match self.next_key {
            Some(key) => key,
            None => self.load_key_generator()?,
        };
        self.batch.put_cf(self.cf, key.to_be_bytes(), value);
        self.batch.put(keygen_key(self.partition), (key + 1).to_be_bytes());
        self.next_key = Some(key + 1);
        Ok(key)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf, key)?)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.batch.put_cf(self.cf, key, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.batch.delete_cf(self.cf, key);
    }

    /// All auto-keyed entries with key ≥ `from`, ascending, from one snapshot.
    pub fn scan_from(&self, from: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        let snapshot = self.db.snapshot();
        let start = from.to_be_bytes();
        let iter = snapshot.iterator_cf(self.cf, IteratorMode::From(&start, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            let Some(seq) = decode_seq(&key) else {
                continue;
            };
            entries.push((seq, value.into_vec()));
        }
        Ok(entries)
    }

    /// Number of auto-keyed entries with key ≥ `from`.
    pub fn count_from(&self, from: u64) -> Result<u64> {
        let start = from.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(self.cf, IteratorMode::From(&start, Direction::Forward));

        let mut count = 0u64;
        for item in iter {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Number of entries in the partition.
    pub fn count(&self) -> Result<u64> {
        self.count_from(0)
    }

    /// Highest auto key currently stored.
    pub fn last_key(&self) -> Result<Option<u64>> {
        let mut iter = self.db.iterator_cf(self.cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(decode_seq(&key))
            }
            None => Ok(None),
        }
    }

    /// Delete every auto-keyed entry with key < `upto`.
    pub fn delete_below(&mut self, upto: u64) {
        if upto == 0 {
            return;
        }
        self.batch
            .delete_range_cf(self.cf, 0u64.to_be_bytes(), upto.to_be_bytes());
    }

    /// Recover the key generator, falling back to the highest stored key.
    fn load_key_generator(&self) -> Result<u64> {
        if let Some(bytes) = self.db.get(keygen_key(self.partition))? {
            if let Some(next) = decode_seq(&bytes) {
                return Ok(next);
            }
        }
        Ok(self
            .last_key()?
            .map_or(FIRST_AUTO_KEY, |last| last + 1))
    }
}

/// Build column-family-specific options.
fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
    let mut opts = Options::default();

    let mut block_opts = BlockBasedOptions::default();
    block_opts.set_block_cache(cache);
    block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
    block_opts.set_block_size(16 * 1024); // 16KB blocks
    opts.set_block_based_table_factory(&block_opts);
    opts.set_write_buffer_size(config.write_buffer_size);

    if name.starts_with("updates-") {
        // Records are LZ4 compressed before they get here
        opts.set_compression_type(DBCompressionType::None);
        opts.set_max_write_buffer_number(4);
    } else {
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_max_write_buffer_number(2);
    }

    opts
}

fn read_generation(db: &Db) -> Result<u64> {
    Ok(db
        .get(GENERATION_KEY)?
        .and_then(|bytes| decode_seq(&bytes))
        .unwrap_or(0))
}

fn keygen_key(partition: &str) -> Vec<u8> {
    format!("{KEYGEN_PREFIX}{partition}").into_bytes()
}

fn decode_seq(bytes: &[u8]) -> Option<u64> {
    let buf: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}
