//! Folder tree queries
//!
//! Folders group documents within one collection and form a tree rooted per
//! collection. Acyclicity is enforced at write time: a folder can never be
//! moved under itself or one of its descendants.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{GroundedError, Result};
use crate::types::Folder;

fn folder_from_row(row: &Row<'_>) -> rusqlite::Result<Folder> {
    let created_at: String = row.get("created_at")?;
    Ok(Folder {
        id: row.get("id")?,
        collection: row.get("collection")?,
        name: row.get("name")?,
        parent_id: row.get("parent_id")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

pub fn create_folder(
    conn: &Connection,
    collection: &str,
    name: &str,
    parent_id: Option<&str>,
) -> Result<Folder> {
    if name.trim().is_empty() {
        return Err(GroundedError::InvalidInput(
            "Folder name cannot be empty".into(),
        ));
    }
    if let Some(pid) = parent_id {
        let parent = get_folder(conn, pid)?
            .ok_or_else(|| GroundedError::NotFound(format!("Folder '{}'", pid)))?;
        if parent.collection != collection {
            return Err(GroundedError::InvalidInput(
                "Parent folder belongs to a different collection".into(),
            ));
        }
    }
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO folders (id, collection, name, parent_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, collection, name.trim(), parent_id, now.to_rfc3339()],
    )?;
    Ok(Folder {
        id,
        collection: collection.to_string(),
        name: name.trim().to_string(),
        parent_id: parent_id.map(String::from),
        created_at: now,
    })
}

pub fn get_folder(conn: &Connection, folder_id: &str) -> Result<Option<Folder>> {
    Ok(conn
        .query_row(
            "SELECT * FROM folders WHERE id = ?1",
            params![folder_id],
            folder_from_row,
        )
        .optional()?)
}

pub fn list_folders(conn: &Connection, collection: &str) -> Result<Vec<Folder>> {
    let mut stmt =
        conn.prepare("SELECT * FROM folders WHERE collection = ?1 ORDER BY name ASC")?;
    let rows = stmt.query_map(params![collection], folder_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// IDs of the given folder and every folder below it
fn descendant_ids(conn: &Connection, collection: &str, folder_id: &str) -> Result<Vec<String>> {
    let folders = list_folders(conn, collection)?;
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for f in &folders {
        if let Some(pid) = f.parent_id.as_deref() {
            children.entry(pid).or_default().push(&f.id);
        }
    }
    let mut out = vec![folder_id.to_string()];
    let mut stack = vec![folder_id];
    while let Some(current) = stack.pop() {
        if let Some(kids) = children.get(current) {
            for kid in kids {
                out.push(kid.to_string());
                stack.push(kid);
            }
        }
    }
    Ok(out)
}

/// Rename and/or move a folder. Moving a folder into its own subtree fails.
pub fn update_folder(
    conn: &Connection,
    folder_id: &str,
    name: Option<&str>,
    new_parent_id: Option<Option<&str>>,
) -> Result<Folder> {
    let folder = get_folder(conn, folder_id)?
        .ok_or_else(|| GroundedError::NotFound(format!("Folder '{}'", folder_id)))?;

    if let Some(Some(pid)) = new_parent_id {
        let parent = get_folder(conn, pid)?
            .ok_or_else(|| GroundedError::NotFound(format!("Folder '{}'", pid)))?;
        if parent.collection != folder.collection {
            return Err(GroundedError::InvalidInput(
                "Parent folder belongs to a different collection".into(),
            ));
        }
        let subtree = descendant_ids(conn, &folder.collection, folder_id)?;
        if subtree.iter().any(|id| id == pid) {
            return Err(GroundedError::InvalidInput(
                "Cannot move a folder into its own subtree".into(),
            ));
        }
    }

    if let Some(name) = name {
        if name.trim().is_empty() {
            return Err(GroundedError::InvalidInput(
                "Folder name cannot be empty".into(),
            ));
        }
        conn.execute(
            "UPDATE folders SET name = ?1 WHERE id = ?2",
            params![name.trim(), folder_id],
        )?;
    }
    if let Some(parent) = new_parent_id {
        conn.execute(
            "UPDATE folders SET parent_id = ?1 WHERE id = ?2",
            params![parent, folder_id],
        )?;
    }
    get_folder(conn, folder_id)?
        .ok_or_else(|| GroundedError::NotFound(format!("Folder '{}'", folder_id)))
}

/// Delete a folder and its whole subtree. Documents bound to deleted folders
/// revert to the collection root.
pub fn delete_folder(conn: &Connection, folder_id: &str) -> Result<usize> {
    let folder = get_folder(conn, folder_id)?
        .ok_or_else(|| GroundedError::NotFound(format!("Folder '{}'", folder_id)))?;
    let ids = descendant_ids(conn, &folder.collection, folder_id)?;
    for id in ids.iter() {
        conn.execute(
            "DELETE FROM document_folders WHERE folder_id = ?1",
            params![id],
        )?;
    }
    // Children before parents so the self-referencing FK stays satisfied
    for id in ids.iter().rev() {
        conn.execute("DELETE FROM folders WHERE id = ?1", params![id])?;
    }
    Ok(ids.len())
}

pub fn set_document_folder(conn: &Connection, document_id: &str, folder_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO document_folders (document_id, folder_id) VALUES (?1, ?2) \
         ON CONFLICT(document_id) DO UPDATE SET folder_id = excluded.folder_id",
        params![document_id, folder_id],
    )?;
    Ok(())
}

pub fn unset_document_folder(conn: &Connection, document_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM document_folders WHERE document_id = ?1",
        params![document_id],
    )?;
    Ok(())
}

pub fn get_document_folder(conn: &Connection, document_id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT folder_id FROM document_folders WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Document count per folder id
pub fn folder_document_counts(conn: &Connection) -> Result<HashMap<String, i64>> {
    let mut stmt =
        conn.prepare("SELECT folder_id, COUNT(*) FROM document_folders GROUP BY folder_id")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Storage;

    #[test]
    fn test_cycle_rejected_and_tree_unchanged() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let a = create_folder(conn, "kb", "A", None)?;
                let b = create_folder(conn, "kb", "B", Some(&a.id))?;
                // Moving A under B would create a cycle
                let result = update_folder(conn, &a.id, None, Some(Some(&b.id)));
                assert!(matches!(result, Err(GroundedError::InvalidInput(_))));
                let a_after = get_folder(conn, &a.id)?.unwrap();
                assert_eq!(a_after.parent_id, None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_self_parent_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let a = create_folder(conn, "kb", "A", None)?;
                let result = update_folder(conn, &a.id, None, Some(Some(&a.id)));
                assert!(result.is_err());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_cross_collection_parent_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let a = create_folder(conn, "kb", "A", None)?;
                let result = create_folder(conn, "other", "B", Some(&a.id));
                assert!(result.is_err());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_delete_cascades_and_documents_revert_to_root() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let a = create_folder(conn, "kb", "A", None)?;
                let b = create_folder(conn, "kb", "B", Some(&a.id))?;
                let c = create_folder(conn, "kb", "C", Some(&b.id))?;
                set_document_folder(conn, "doc-1", &c.id)?;

                let removed = delete_folder(conn, &a.id)?;
                assert_eq!(removed, 3);
                assert!(get_folder(conn, &b.id)?.is_none());
                assert_eq!(get_document_folder(conn, "doc-1")?, None);
                Ok(())
            })
            .unwrap();
    }
}
