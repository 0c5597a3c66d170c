//! The embedded database facade: open/recover, statement execution,
//! manual transaction scope, vacuum.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, atomic::Ordering, Arc, Mutex, RwLock},
};

use log::{info, warn};

use crate::{
    btree::{
        consts::DEFAULT_PAGE_CACHE_SIZE,
        page::Page,
        pager::Pager,
        table::TableTree,
    },
    catalog::{Catalog, SCHEMA_ROOT_PAGE, SCHEMA_TABLE_SCHEMA},
    error::DbError,
    journal,
    query::{
        executor::{self, StatementResult},
        statement::{InsertStmt, Statement},
    },
    storage::tuple::{unmarshal_columns, ColumnBytes},
    transaction::{Transaction, TransactionManager},
    types::{CancelToken, DbResult, PageIndex, NO_PAGE},
    utils::HandyRwLock,
};

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub journal_enabled: bool,
    pub page_cache_size: usize,
    pub create_if_missing: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            journal_enabled: true,
            page_cache_size: DEFAULT_PAGE_CACHE_SIZE,
            create_if_missing: true,
        }
    }
}

pub struct Database {
    path: PathBuf,
    options: OpenOptions,
    pager: Arc<Pager>,
    tm: Arc<TransactionManager>,
    catalog: RwLock<Catalog>,
    /// Structural operations (DDL, vacuum) take the write side; plain
    /// statements share the read side.
    ddl_lock: RwLock<()>,
    /// The transaction opened by `begin()`, consumed by `commit()` or
    /// `rollback()`. Statements outside an explicit scope run in their
    /// own implicit transaction.
    ambient_tx: Mutex<Option<Arc<Transaction>>>,
    closed: AtomicBool,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> DbResult<Database> {
        Self::open_with(path, OpenOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: OpenOptions) -> DbResult<Database> {
        let path = path.as_ref().to_path_buf();
        if path.exists() && journal::recover(&path)? {
            info!("recovered {} from its rollback journal", path.display());
        }
        let pager = Arc::new(Pager::open(
            &path,
            options.page_cache_size,
            options.create_if_missing,
        )?);
        let tm = Arc::new(TransactionManager::new(
            Arc::clone(&pager),
            options.journal_enabled,
        ));

        let tx = tm.begin();
        let catalog = Catalog::load(&tx)?;
        tx.commit()?;

        Ok(Database {
            path,
            options,
            pager,
            tm,
            catalog: RwLock::new(catalog),
            ddl_lock: RwLock::new(()),
            ambient_tx: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::validation("database is closed"));
        }
        Ok(())
    }

    /// Close the database. Committed state is already durable; an open
    /// explicit transaction is rolled back. Idempotent.
    pub fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut ambient = self.ambient_tx.lock().unwrap();
        if let Some(tx) = ambient.take() {
            warn!("closing with an open transaction, rolling it back");
            tx.abort()?;
        }
        Ok(())
    }

    /// Open an explicit transaction scope.
    pub fn begin(&self) -> DbResult<()> {
        self.ensure_open()?;
        let mut ambient = self.ambient_tx.lock().unwrap();
        if ambient.is_some() {
            return Err(DbError::validation("a transaction is already open"));
        }
        *ambient = Some(Arc::new(self.tm.begin()));
        Ok(())
    }

    pub fn commit(&self) -> DbResult<()> {
        self.ensure_open()?;
        let tx = self
            .ambient_tx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DbError::validation("no open transaction"))?;
        tx.commit()
    }

    pub fn rollback(&self) -> DbResult<()> {
        self.ensure_open()?;
        let tx = self
            .ambient_tx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DbError::validation("no open transaction"))?;
        tx.abort()
    }

    pub fn execute(&self, stmt: Statement) -> DbResult<StatementResult> {
        self.execute_with(stmt, CancelToken::new())
    }

    pub fn execute_with(&self, stmt: Statement, token: CancelToken) -> DbResult<StatementResult> {
        self.ensure_open()?;
        match stmt {
            Statement::CreateTable(_)
            | Statement::DropTable(_)
            | Statement::CreateIndex(_)
            | Statement::DropIndex(_) => self.execute_ddl(stmt),
            Statement::Insert(_)
            | Statement::Select(_)
            | Statement::Update(_)
            | Statement::Delete(_) => self.execute_dml(stmt, token),
        }
    }

    fn execute_ddl(&self, stmt: Statement) -> DbResult<StatementResult> {
        let _structural = self.ddl_lock.wl();
        if self.ambient_tx.lock().unwrap().is_some() {
            return Err(DbError::validation(
                "schema changes cannot run inside an explicit transaction",
            ));
        }

        let tx = self.tm.begin();
        let change = {
            let catalog = self.catalog.rl();
            match stmt {
                Statement::CreateTable(s) => {
                    catalog.create_table(&tx, &s.name, s.columns, s.primary_key)
                }
                Statement::DropTable(s) => catalog.drop_table(&tx, &s.name),
                Statement::CreateIndex(s) => {
                    catalog.create_index(&tx, &s.name, &s.table, &s.columns, s.unique)
                }
                Statement::DropIndex(s) => catalog.drop_index(&tx, &s.name),
                _ => unreachable!(),
            }
        };
        let change = match change {
            Ok(change) => change,
            Err(e) => {
                tx.abort()?;
                return Err(e);
            }
        };
        tx.commit()?;
        self.catalog.wl().apply(change);
        Ok(StatementResult::affected(0))
    }

    fn execute_dml(&self, stmt: Statement, token: CancelToken) -> DbResult<StatementResult> {
        let _structural = self.ddl_lock.rl();

        let ambient = self.ambient_tx.lock().unwrap().clone();
        let (tx, implicit) = match ambient {
            Some(tx) => (tx, false),
            None => (Arc::new(self.tm.begin()), true),
        };

        let result = self.run_dml(&tx, &stmt, &token);
        if implicit {
            match &result {
                Ok(_) => tx.commit()?,
                Err(_) => tx.abort()?,
            }
        }
        result
    }

    fn run_dml(
        &self,
        tx: &Transaction,
        stmt: &Statement,
        token: &CancelToken,
    ) -> DbResult<StatementResult> {
        let catalog = self.catalog.rl();
        match stmt {
            Statement::Insert(s) => {
                let table_pod = catalog.get_table(&s.table)?;
                drop(catalog);
                executor::execute_insert(tx, &table_pod, s, token)
            }
            Statement::Select(s) => {
                let table_pod = catalog.get_table(&s.table)?;
                drop(catalog);
                let table = table_pod.rl();
                executor::execute_select(tx, &table, s, token)
            }
            Statement::Update(s) => {
                let table_pod = catalog.get_table(&s.table)?;
                drop(catalog);
                let table = table_pod.rl();
                executor::execute_update(tx, &table, s, token)
            }
            Statement::Delete(s) => {
                let table_pod = catalog.get_table(&s.table)?;
                drop(catalog);
                let table = table_pod.rl();
                executor::execute_delete(tx, &table, s, token)
            }
            _ => unreachable!(),
        }
    }

    /// Rebuild the database into a fresh file and swap it in, dropping
    /// free pages and fragmentation. Experimental; takes exclusive
    /// ownership of the engine for its whole duration.
    pub fn vacuum(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        if self.ambient_tx.lock().unwrap().is_some() {
            return Err(DbError::validation("vacuum cannot run inside a transaction"));
        }
        // `&mut self` already excludes every other caller

        let mut tmp = self.path.as_os_str().to_os_string();
        tmp.push("-vacuum");
        let tmp = PathBuf::from(tmp);
        let _ = std::fs::remove_file(&tmp);

        {
            let rebuilt = Database::open_with(&tmp, self.options.clone())?;
            let catalog = self.catalog.rl();
            let tx = self.tm.begin();
            for name in catalog.table_names() {
                let pod = catalog.get_table(&name)?;
                let table = pod.rl();

                let pk_spec = table.primary_key.as_ref().map(|pk| crate::catalog::PrimaryKeySpec {
                    columns: pk
                        .columns
                        .iter()
                        .map(|&c| table.schema.column(c).name.clone())
                        .collect(),
                    autoincrement: pk.autoincrement,
                });
                rebuilt.execute(Statement::CreateTable(
                    crate::query::statement::CreateTableStmt {
                        name: name.clone(),
                        columns: table.schema.columns().to_vec(),
                        primary_key: pk_spec,
                    },
                ))?;

                let tree = table.tree();
                let rows: DbResult<Vec<_>> = tree.iter(&tx, CancelToken::new()).collect();
                let rows = rows?;
                if !rows.is_empty() {
                    rebuilt.execute(Statement::Insert(InsertStmt {
                        table: name.clone(),
                        columns: Vec::new(),
                        rows: rows
                            .into_iter()
                            .map(|r| {
                                r.values
                                    .into_iter()
                                    .map(|v| if v.valid { Some(v.value) } else { None })
                                    .collect()
                            })
                            .collect(),
                    }))?;
                }

                for def in table.unique_indexes.iter().chain(&table.secondary_indexes) {
                    rebuilt.execute(Statement::CreateIndex(
                        crate::query::statement::CreateIndexStmt {
                            name: def.name.clone(),
                            table: name.clone(),
                            columns: def
                                .columns
                                .iter()
                                .map(|&c| table.schema.column(c).name.clone())
                                .collect(),
                            unique: def.unique,
                        },
                    ))?;
                }
            }
            tx.commit()?;
            rebuilt.close()?;
        }

        std::fs::rename(&tmp, &self.path)?;
        let _ = std::fs::remove_file(journal::journal_path(&tmp));
        info!("vacuum rebuilt {}", self.path.display());

        *self = Database::open_with(&self.path, self.options.clone())?;
        Ok(())
    }

    /// Walk every tree, the free list and the page census, asserting
    /// the structural invariants. Test support.
    pub fn check_integrity(&self) -> DbResult<()> {
        self.ensure_open()?;
        let _structural = self.ddl_lock.rl();
        let tx = self.tm.begin();
        let catalog = self.catalog.rl();

        let mut live: HashSet<PageIndex> = HashSet::new();

        let schema_tree = TableTree::new(SCHEMA_ROOT_PAGE, &SCHEMA_TABLE_SCHEMA);
        schema_tree.check_integrity(&tx)?;
        self.collect_table_pages(&tx, &schema_tree, &mut live)?;

        for name in catalog.table_names() {
            let pod = catalog.get_table(&name)?;
            let table = pod.rl();
            let tree = table.tree();
            tree.check_integrity(&tx)?;
            self.collect_table_pages(&tx, &tree, &mut live)?;
            for def in table.all_indexes() {
                let index_tree = def.tree();
                index_tree.check_integrity(&tx)?;
                self.collect_index_pages(&tx, def.root_page, &mut live)?;
            }
        }

        // free list length must match the header and stay disjoint
        // from every live tree
        let header = tx.db_header();
        let mut free_count = 0u32;
        let mut cursor = header.first_free_page;
        while cursor != NO_PAGE {
            if !live.insert(cursor) {
                return Err(DbError::corrupt(format!(
                    "page {} is both free and in use",
                    cursor
                )));
            }
            free_count += 1;
            if free_count > self.pager.total_pages() {
                return Err(DbError::corrupt("free list cycle"));
            }
            cursor = tx.read_page(cursor)?.as_free()?.next_free;
        }
        if free_count != header.free_page_count {
            return Err(DbError::corrupt(format!(
                "free list holds {} pages, header says {}",
                free_count, header.free_page_count
            )));
        }

        // every page belongs somewhere, and the file covers exactly
        // the page count
        let total = self.pager.total_pages();
        for index in 0..total {
            if !live.contains(&index) {
                return Err(DbError::corrupt(format!("orphan page {}", index)));
            }
        }
        let file_len = std::fs::metadata(&self.path)?.len();
        if file_len != total as u64 * crate::btree::consts::PAGE_SIZE as u64 {
            return Err(DbError::corrupt(format!(
                "file is {} bytes for {} pages",
                file_len, total
            )));
        }

        tx.commit()?;
        Ok(())
    }

    fn collect_table_pages(
        &self,
        tx: &Transaction,
        tree: &TableTree<'_>,
        live: &mut HashSet<PageIndex>,
    ) -> DbResult<()> {
        self.collect_table_subtree(tx, tree, tree.root, live)
    }

    fn collect_table_subtree(
        &self,
        tx: &Transaction,
        tree: &TableTree<'_>,
        index: PageIndex,
        live: &mut HashSet<PageIndex>,
    ) -> DbResult<()> {
        live.insert(index);
        let page = tx.read_page(index)?;
        match &*page {
            Page::TableLeaf(leaf) => {
                for cell in &leaf.cells {
                    let cols = unmarshal_columns(tree.schema, cell.null_mask, &cell.value)?;
                    for col in cols {
                        if let ColumnBytes::BigText { first_page, .. } = col {
                            let mut cursor = first_page;
                            while cursor != NO_PAGE {
                                live.insert(cursor);
                                cursor = tx.read_page(cursor)?.as_table_overflow()?.next_page;
                            }
                        }
                    }
                }
            }
            Page::TableInternal(node) => {
                let children: Vec<PageIndex> = node.children().collect();
                for child in children {
                    self.collect_table_subtree(tx, tree, child, live)?;
                }
            }
            other => {
                return Err(DbError::corrupt(format!(
                    "page {} is a {} inside a table tree",
                    index,
                    other.kind_name()
                )));
            }
        }
        Ok(())
    }

    fn collect_index_pages(
        &self,
        tx: &Transaction,
        index: PageIndex,
        live: &mut HashSet<PageIndex>,
    ) -> DbResult<()> {
        live.insert(index);
        let page = tx.read_page(index)?;
        match &page.as_index()?.node {
            crate::btree::page::IndexNode::Leaf(leaf) => {
                for cell in &leaf.cells {
                    let mut cursor = cell.overflow;
                    while cursor != NO_PAGE {
                        live.insert(cursor);
                        cursor = tx.read_page(cursor)?.as_index_overflow()?.next_page;
                    }
                }
            }
            crate::btree::page::IndexNode::Internal(node) => {
                let children: Vec<PageIndex> = node.children().collect();
                for child in children {
                    self.collect_index_pages(tx, child, live)?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
