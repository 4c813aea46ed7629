use crate::db::items::{item_from_row, ITEM_COLUMNS};
use crate::db::{DuplicateKind, DuplicateSet, Item};
use crate::error::Result;
use rusqlite::{params, Connection};

/// Exact sets (same hash and size) followed by probable sets (unhashed files
/// sharing name and size), each ordered by reclaimable bytes.
pub fn find_duplicate_sets(conn: &Connection, scan_id: &str) -> Result<Vec<DuplicateSet>> {
    let mut sets = find_exact(conn, scan_id)?;
    sets.extend(find_probable(conn, scan_id)?);
    Ok(sets)
}

fn find_exact(conn: &Connection, scan_id: &str) -> Result<Vec<DuplicateSet>> {
    let mut stmt = conn.prepare(
        "SELECT content_hash, size_bytes FROM items
         WHERE scan_id = ?1 AND item_type = 'file' AND content_hash IS NOT NULL
         GROUP BY content_hash, size_bytes
         HAVING COUNT(*) > 1
         ORDER BY size_bytes * (COUNT(*) - 1) DESC, content_hash",
    )?;
    let groups = stmt
        .query_map([scan_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let query = format!(
        "SELECT {} FROM items
         WHERE scan_id = ?1 AND item_type = 'file' AND content_hash = ?2 AND size_bytes = ?3
         ORDER BY id",
        ITEM_COLUMNS
    );
    let mut members = conn.prepare(&query)?;

    let mut sets = Vec::with_capacity(groups.len());
    for (hash, size) in groups {
        let items = members
            .query_map(params![scan_id, hash, size], item_from_row)?
            .collect::<std::result::Result<Vec<Item>, _>>()?;
        sets.push(DuplicateSet {
            hash: Some(hash),
            size_bytes: size,
            kind: DuplicateKind::Exact,
            items,
        });
    }
    Ok(sets)
}

fn find_probable(conn: &Connection, scan_id: &str) -> Result<Vec<DuplicateSet>> {
    let mut stmt = conn.prepare(
        "SELECT name, size_bytes FROM items
         WHERE scan_id = ?1 AND item_type = 'file' AND content_hash IS NULL
         GROUP BY name, size_bytes
         HAVING COUNT(*) > 1
         ORDER BY size_bytes * (COUNT(*) - 1) DESC, name",
    )?;
    let groups = stmt
        .query_map([scan_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let query = format!(
        "SELECT {} FROM items
         WHERE scan_id = ?1 AND item_type = 'file' AND content_hash IS NULL
           AND name = ?2 AND size_bytes = ?3
         ORDER BY id",
        ITEM_COLUMNS
    );
    let mut members = conn.prepare(&query)?;

    let mut sets = Vec::with_capacity(groups.len());
    for (name, size) in groups {
        let items = members
            .query_map(params![scan_id, name, size], item_from_row)?
            .collect::<std::result::Result<Vec<Item>, _>>()?;
        sets.push(DuplicateSet {
            hash: None,
            size_bytes: size,
            kind: DuplicateKind::Probable,
            items,
        });
    }
    Ok(sets)
}

#[derive(Debug, Clone, Default)]
pub struct DuplicateStatistics {
    pub set_count: usize,
    pub exact_sets: usize,
    pub probable_sets: usize,
    pub redundant_files: usize,
    pub wasted_bytes: i64,
}

pub fn summarize(sets: &[DuplicateSet]) -> DuplicateStatistics {
    sets.iter().fold(DuplicateStatistics::default(), |mut acc, set| {
        acc.set_count += 1;
        match set.kind {
            DuplicateKind::Exact => acc.exact_sets += 1,
            DuplicateKind::Probable => acc.probable_sets += 1,
        }
        acc.redundant_files += set.items.len().saturating_sub(1);
        acc.wasted_bytes += set.wasted_bytes();
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InventoryStore, ItemType, SqliteDatabase};
    use std::collections::BTreeMap;

    fn file(path: &str, size: i64, hash: Option<&str>) -> Item {
        Item {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap().to_string(),
            provider_id: "local".to_string(),
            size_bytes: size,
            mime_type: None,
            created_at: None,
            modified_at: None,
            content_hash: hash.map(|h| h.to_string()),
            item_type: ItemType::File,
            depth: 1,
            extended_properties: BTreeMap::new(),
            issues: Vec::new(),
            is_shared: false,
        }
    }

    fn setup(items: &[Item]) -> (SqliteDatabase, String) {
        let mut db = SqliteDatabase::open_in_memory().unwrap();
        db.initialize().unwrap();
        let scan_id = db.create_scan(&["local".to_string()]).unwrap();
        db.add_items(&scan_id, items).unwrap();
        (db, scan_id)
    }

    #[test]
    fn test_exact_duplicates_require_hash_and_size() {
        let (db, scan_id) = setup(&[
            file("/a/one.txt", 100, Some("aaa")),
            file("/b/two.txt", 100, Some("aaa")),
            file("/c/three.txt", 200, Some("aaa")),
            file("/d/four.txt", 100, Some("bbb")),
        ]);

        let sets = find_duplicate_sets(db.conn(), &scan_id).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].kind, DuplicateKind::Exact);
        assert_eq!(sets[0].items.len(), 2);
        assert_eq!(sets[0].wasted_bytes(), 100);
    }

    #[test]
    fn test_probable_duplicates_by_name_and_size() {
        let (db, scan_id) = setup(&[
            file("/a/report.pdf", 500, None),
            file("/b/report.pdf", 500, None),
            file("/c/report.pdf", 501, None),
        ]);

        let sets = find_duplicate_sets(db.conn(), &scan_id).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].kind, DuplicateKind::Probable);
        assert!(sets[0].hash.is_none());
    }

    #[test]
    fn test_cache_invalidated_on_add() {
        let (mut db, scan_id) = setup(&[file("/a/x.bin", 10, Some("h"))]);
        assert!(db.find_duplicates(&scan_id).unwrap().is_empty());

        db.add_items(&scan_id, &[file("/b/x.bin", 10, Some("h"))])
            .unwrap();
        assert_eq!(db.find_duplicates(&scan_id).unwrap().len(), 1);
    }

    #[test]
    fn test_summarize() {
        let (db, scan_id) = setup(&[
            file("/a/x.bin", 10, Some("h")),
            file("/b/x.bin", 10, Some("h")),
            file("/c/x.bin", 10, Some("h")),
        ]);
        let sets = find_duplicate_sets(db.conn(), &scan_id).unwrap();
        let stats = summarize(&sets);
        assert_eq!(stats.exact_sets, 1);
        assert_eq!(stats.redundant_files, 2);
        assert_eq!(stats.wasted_bytes, 20);
    }
}
