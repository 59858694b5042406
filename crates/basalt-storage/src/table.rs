//! Named tables, each backed by one B+Tree keyed on a typed column.

use crate::btree::BPlusTree;
use crate::compare::{FloatKeyCompare, IntegerKeyCompare, KeyCompare, StringKeyCompare};
use basalt_buffer::PageStore;
use basalt_common::{BasaltError, FieldType, KeyKind, PageId, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A tree instantiated with the comparator matching its key type.
pub enum TableIndex {
    Integer(BPlusTree<IntegerKeyCompare>),
    Float(BPlusTree<FloatKeyCompare>),
    String(BPlusTree<StringKeyCompare>),
}

/// Runs the same expression against whichever tree the index holds.
macro_rules! dispatch {
    ($index:expr, $tree:ident => $body:expr) => {
        match $index {
            TableIndex::Integer($tree) => $body,
            TableIndex::Float($tree) => $body,
            TableIndex::String($tree) => $body,
        }
    };
}

impl TableIndex {
    fn key_kind(key_type: FieldType) -> Result<KeyKind> {
        key_type
            .key_kind()
            .ok_or_else(|| BasaltError::UnsupportedKeyType(key_type.to_string()))
    }

    pub fn create(store: Arc<PageStore>, key_type: FieldType) -> Result<Self> {
        Ok(match Self::key_kind(key_type)? {
            KeyKind::Integer => Self::Integer(BPlusTree::create(store, IntegerKeyCompare)?),
            KeyKind::Float => Self::Float(BPlusTree::create(store, FloatKeyCompare)?),
            KeyKind::String => Self::String(BPlusTree::create(store, StringKeyCompare)?),
        })
    }

    pub fn open(store: Arc<PageStore>, meta: PageId, key_type: FieldType) -> Result<Self> {
        Ok(match Self::key_kind(key_type)? {
            KeyKind::Integer => Self::Integer(BPlusTree::open(store, meta, IntegerKeyCompare)?),
            KeyKind::Float => Self::Float(BPlusTree::open(store, meta, FloatKeyCompare)?),
            KeyKind::String => Self::String(BPlusTree::open(store, meta, StringKeyCompare)?),
        })
    }

    pub fn meta_page_id(&self) -> PageId {
        dispatch!(self, tree => tree.meta_page_id())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        dispatch!(self, tree => tree.get(key))
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        dispatch!(self, tree => tree.insert(key, value))
    }

    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        dispatch!(self, tree => tree.update(key, value))
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        dispatch!(self, tree => tree.delete(key))
    }

    pub fn take(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        dispatch!(self, tree => tree.take(key))
    }

    pub fn max_key(&self) -> Result<Option<Bytes>> {
        dispatch!(self, tree => tree.max_key())
    }

    pub fn tuple_num(&self) -> Result<u64> {
        dispatch!(self, tree => tree.tuple_num())
    }

    /// Every entry in key order.
    pub fn scan(&self) -> Result<Vec<(Bytes, Bytes)>> {
        dispatch!(self, tree => tree.begin()?.collect())
    }

    /// Entries with `lower <= key < upper`.
    pub fn range(&self, lower: &[u8], upper: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        dispatch!(self, tree => {
            let cmp = tree.comparator().clone();
            let mut out = Vec::new();
            for entry in tree.lower_bound(lower)? {
                let (key, value) = entry?;
                if cmp.compare(&key, upper).is_ge() {
                    break;
                }
                out.push((key, value));
            }
            Ok(out)
        })
    }

    pub fn check_key_order(&self) -> Result<()> {
        dispatch!(self, tree => tree.check_key_order())
    }

    pub fn destroy(self) -> Result<()> {
        dispatch!(self, tree => tree.destroy())
    }
}

/// A named table with a typed key.
pub struct Table {
    name: String,
    key_type: FieldType,
    index: TableIndex,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_type(&self) -> FieldType {
        self.key_type
    }

    /// Meta page of the backing tree; pass it to [`Tables::open`] after a restart.
    pub fn meta_page_id(&self) -> PageId {
        self.index.meta_page_id()
    }

    pub fn index(&self) -> &TableIndex {
        &self.index
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.index.get(key)
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.index.insert(key, value)
    }

    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.index.update(key, value)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.index.delete(key)
    }

    pub fn take(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        self.index.take(key)
    }

    pub fn tuple_num(&self) -> Result<u64> {
        self.index.tuple_num()
    }

    pub fn scan(&self) -> Result<Vec<(Bytes, Bytes)>> {
        self.index.scan()
    }

    pub fn check(&self) -> Result<()> {
        self.index.check_key_order()
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("key_type", &self.key_type)
            .field("meta", &self.index.meta_page_id())
            .finish()
    }
}

/// Registry of the tables living in one page store.
pub struct Tables {
    store: Arc<PageStore>,
    tables: RwLock<HashMap<String, Arc<Mutex<Table>>>>,
}

impl Tables {
    pub fn new(store: Arc<PageStore>) -> Self {
        Self {
            store,
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    /// Builds and registers a table while holding the registry lock, so two
    /// callers cannot both claim one name.
    fn register(
        &self,
        name: &str,
        key_type: FieldType,
        build: impl FnOnce() -> Result<TableIndex>,
    ) -> Result<Arc<Mutex<Table>>> {
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(BasaltError::TableAlreadyExists(name.to_string()));
        }
        let table = Arc::new(Mutex::new(Table {
            name: name.to_string(),
            key_type,
            index: build()?,
        }));
        tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Creates an empty table.
    pub fn create(&self, name: &str, key_type: FieldType) -> Result<Arc<Mutex<Table>>> {
        let table = self.register(name, key_type, || {
            TableIndex::create(Arc::clone(&self.store), key_type)
        })?;
        debug!(table = name, key_type = %key_type, "table created");
        Ok(table)
    }

    /// Registers an existing tree under `name`.
    pub fn open(&self, name: &str, key_type: FieldType, meta: PageId) -> Result<Arc<Mutex<Table>>> {
        let table = self.register(name, key_type, || {
            TableIndex::open(Arc::clone(&self.store), meta, key_type)
        })?;
        debug!(table = name, key_type = %key_type, meta = %meta, "table opened");
        Ok(table)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Mutex<Table>>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BasaltError::TableNotFound(name.to_string()))
    }

    /// Unregisters a table and frees all of its pages.
    ///
    /// Fails, leaving the table registered, while any other handle on it is alive.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let table = {
            let mut tables = self.tables.write();
            let in_use = match tables.get(name) {
                Some(table) => Arc::strong_count(table) > 1,
                None => return Err(BasaltError::TableNotFound(name.to_string())),
            };
            if in_use {
                return Err(BasaltError::Internal(format!("table {} is still in use", name)));
            }
            tables
                .remove(name)
                .ok_or_else(|| BasaltError::TableNotFound(name.to_string()))?
        };

        // The registry held the only handle and new ones are taken under its lock
        let table = Arc::try_unwrap(table)
            .map_err(|_| BasaltError::Internal(format!("table {} is still in use", name)))?;
        table.into_inner().index.destroy()?;
        info!(table = name, "table dropped");
        Ok(())
    }

    /// Registered table names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}
