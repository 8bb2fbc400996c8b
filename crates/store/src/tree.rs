//! The node table: persistence for the resource tree.
//!
//! This layer is pure storage. Mount/unmount orchestration (hooks, lock
//! discipline, proxy handling) lives in `noodle-node`; everything here is a
//! transient-connection CRUD operation over the `node` table.

use camino::{Utf8Path, Utf8PathBuf};
use noodle_primitives::{NodeKey, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::records::NodeRecord;
use crate::store_err;

#[derive(Clone, Debug)]
pub struct TreeStore {
    db_path: Utf8PathBuf,
}

impl TreeStore {
    #[must_use]
    pub fn new(db_path: impl AsRef<Utf8Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_owned(),
        }
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(self.db_path.as_std_path()).map_err(store_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(store_err)?;
        Ok(conn)
    }

    /// Creates the node table and its indexes if absent.
    pub fn init(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| noodle_primitives::NoodleError::Store(err.to_string()))?;
        }
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS node (
                parent_key TEXT,
                template_name TEXT,
                node_key TEXT PRIMARY KEY,
                access_info TEXT DEFAULT NULL,
                launch_params TEXT DEFAULT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (parent_key) REFERENCES node (node_key) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_parent_key ON node(parent_key);
            CREATE INDEX IF NOT EXISTS idx_template_name ON node(template_name);",
        )
        .map_err(store_err)
    }

    pub fn has(&self, node_key: &NodeKey) -> Result<bool> {
        let conn = self.connect()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM node WHERE node_key = ?1",
                params![node_key.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        Ok(found.is_some())
    }

    pub fn insert(
        &self,
        node_key: &NodeKey,
        parent_key: Option<&NodeKey>,
        template_name: Option<&str>,
        launch_params: Option<&str>,
        access_info: Option<&str>,
    ) -> Result<()> {
        let conn = self.connect()?;
        let _ = conn
            .execute(
                "INSERT INTO node (node_key, parent_key, template_name, launch_params, access_info)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    node_key.as_str(),
                    parent_key.map(NodeKey::as_str),
                    template_name,
                    launch_params,
                    access_info,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn delete(&self, node_key: &NodeKey) -> Result<()> {
        let conn = self.connect()?;
        let _ = conn
            .execute(
                "DELETE FROM node WHERE node_key = ?1",
                params![node_key.as_str()],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn child_keys(&self, parent_key: &NodeKey) -> Result<Vec<NodeKey>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT node_key FROM node WHERE parent_key = ?1")
            .map_err(store_err)?;
        let keys = stmt
            .query_map(params![parent_key.as_str()], |row| {
                row.get::<_, String>(0).map(NodeKey::new)
            })
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        Ok(keys)
    }

    /// Loads one record; with `cascade`, attaches direct children sorted
    /// case-insensitively by their own name (one level only).
    pub fn load(&self, node_key: &NodeKey, cascade: bool) -> Result<Option<NodeRecord>> {
        let conn = self.connect()?;
        let record = conn
            .query_row(
                "SELECT node_key, parent_key, template_name, launch_params, access_info, created_at
                 FROM node WHERE node_key = ?1",
                params![node_key.as_str()],
                row_to_record,
            )
            .optional()
            .map_err(store_err)?;

        let Some(mut record) = record else {
            return Ok(None);
        };

        if cascade {
            record.children = self.children(node_key)?;
        }

        Ok(Some(record))
    }

    /// Direct children of a node, sorted case-insensitively by last path
    /// segment.
    pub fn children(&self, node_key: &NodeKey) -> Result<Vec<NodeRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT node_key, parent_key, template_name, launch_params, access_info, created_at
                 FROM node WHERE parent_key = ?1",
            )
            .map_err(store_err)?;
        let mut children = stmt
            .query_map(params![node_key.as_str()], row_to_record)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;

        children.sort_by_key(|child| child.node_key.last_segment().to_lowercase());
        Ok(children)
    }

    /// Renames a record in place, carrying its children along. Used when a
    /// pull transfer displaces an existing target to `<key>_copy`.
    pub fn rename(&self, from: &NodeKey, to: &NodeKey) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction().map_err(store_err)?;
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")
            .map_err(store_err)?;
        let _ = tx
            .execute(
                "UPDATE node SET node_key = ?2 WHERE node_key = ?1",
                params![from.as_str(), to.as_str()],
            )
            .map_err(store_err)?;
        let _ = tx
            .execute(
                "UPDATE node SET parent_key = ?2 WHERE parent_key = ?1",
                params![from.as_str(), to.as_str()],
            )
            .map_err(store_err)?;
        tx.commit().map_err(store_err)
    }

    pub fn update_launch_params(
        &self,
        node_key: &NodeKey,
        launch_params: Option<&str>,
    ) -> Result<()> {
        let conn = self.connect()?;
        let _ = conn
            .execute(
                "UPDATE node SET launch_params = ?2 WHERE node_key = ?1",
                params![node_key.as_str(), launch_params],
            )
            .map_err(store_err)?;
        Ok(())
    }

    /// Every non-proxy record mounted with the given template.
    pub fn keys_by_template(&self, template_name: &str) -> Result<Vec<NodeKey>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT node_key FROM node
                 WHERE template_name = ?1 AND access_info IS NULL",
            )
            .map_err(store_err)?;
        let keys = stmt
            .query_map(params![template_name], |row| {
                row.get::<_, String>(0).map(NodeKey::new)
            })
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        Ok(keys)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRecord> {
    Ok(NodeRecord {
        node_key: NodeKey::new(row.get::<_, String>(0)?),
        parent_key: row.get::<_, Option<String>>(1)?.map(NodeKey::new),
        template_name: row.get(2)?,
        launch_params: row.get(3)?,
        access_info: row.get(4)?,
        created_at: row.get(5)?,
        children: Vec::new(),
    })
}
