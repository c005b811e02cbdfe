use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::catalog::{Catalog, CATALOG_FILE};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::store::FileBasedTupleStore;
use crate::warehouse::Warehouse;

/// Process-wide registry holding one open store per table.
pub struct SharedDataArea {
    config: StoreConfig,
    warehouse: Arc<dyn Warehouse>,
    tables: RwLock<HashMap<String, Arc<FileBasedTupleStore>>>,
}

impl SharedDataArea {
    /// Opens every table found under the data directory.
    pub fn open(config: StoreConfig, warehouse: Arc<dyn Warehouse>) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let mut tables = HashMap::new();
        for entry in fs::read_dir(&config.data_dir)? {
            let path = entry?.path();
            if !path.join(CATALOG_FILE).is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let store = FileBasedTupleStore::open_existing(config.clone(), name, warehouse.clone())?;
            tables.insert(name.to_string(), Arc::new(store));
        }
        tracing::info!(
            data_dir = %config.data_dir.display(),
            tables = tables.len(),
            "Opened data area"
        );
        Ok(Self {
            config,
            warehouse,
            tables: RwLock::new(tables),
        })
    }

    /// Returns the store for `catalog.table`, creating the table on first
    /// sight. An existing table must match the catalog.
    pub fn sync_catalog(&self, catalog: Catalog) -> Result<Arc<FileBasedTupleStore>> {
        if let Some(store) = self.read()?.get(&catalog.table) {
            store.catalog().ensure_compatible(&catalog)?;
            return Ok(store.clone());
        }

        let mut tables = self.write()?;
        if let Some(store) = tables.get(&catalog.table) {
            store.catalog().ensure_compatible(&catalog)?;
            return Ok(store.clone());
        }
        let table = catalog.table.clone();
        let store = Arc::new(FileBasedTupleStore::open(
            self.config.clone(),
            catalog,
            self.warehouse.clone(),
        )?);
        tables.insert(table.clone(), store.clone());
        tracing::info!(table = %table, "Registered table");
        Ok(store)
    }

    pub fn get(&self, table: &str) -> Result<Arc<FileBasedTupleStore>> {
        self.read()?
            .get(table)
            .cloned()
            .ok_or_else(|| Error::NotFound(table.to_string()))
    }

    pub fn tables(&self) -> Vec<Arc<FileBasedTupleStore>> {
        self.read()
            .map(|tables| tables.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Fails every reader parked on an accuracy wait.
    pub fn close(&self) {
        for store in self.tables() {
            store.close();
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Arc<FileBasedTupleStore>>>> {
        self.tables
            .read()
            .map_err(|_| Error::InvalidState("table registry lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Arc<FileBasedTupleStore>>>> {
        self.tables
            .write()
            .map_err(|_| Error::InvalidState("table registry lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Column;
    use crate::encoding::DataType;
    use crate::warehouse::MemoryWarehouse;
    use tempfile::TempDir;

    fn catalog(table: &str) -> Catalog {
        Catalog::new(table, vec![Column::new("v", DataType::Int)])
    }

    #[test]
    fn test_sync_creates_and_reopens_tables() -> Result<()> {
        let dir = TempDir::new()?;
        let warehouse: Arc<dyn Warehouse> = Arc::new(MemoryWarehouse::new());
        {
            let area = SharedDataArea::open(StoreConfig::new(dir.path()), warehouse.clone())?;
            let a = area.sync_catalog(catalog("a"))?;
            let again = area.sync_catalog(catalog("a"))?;
            assert!(Arc::ptr_eq(&a, &again));
            area.sync_catalog(catalog("b"))?;
            assert!(matches!(area.get("c"), Err(Error::NotFound(_))));

            let changed = Catalog::new("a", vec![Column::new("v", DataType::Long)]);
            assert!(matches!(area.sync_catalog(changed), Err(Error::CatalogMismatch(..))));
        }

        let area = SharedDataArea::open(StoreConfig::new(dir.path()), warehouse)?;
        let mut names: Vec<String> = area.tables().iter().map(|s| s.table().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        Ok(())
    }
}
