use crate::db::{Item, ItemType, ScanStatistics, ScanStatus};
use crate::error::{Result, StowageError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct ScanHeader {
    pub scan_id: String,
    pub provider_ids: Vec<String>,
    pub status: ScanStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub header: ScanHeader,
    pub total_items: i64,
    pub total_bytes: i64,
}

pub(crate) fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parse_optional_timestamp(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_timestamp(idx, s)).transpose()
}

pub fn create_scan(conn: &Connection, provider_ids: &[String]) -> Result<String> {
    let scan_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO scans (id, provider_ids, status, started_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            scan_id,
            serde_json::to_string(provider_ids)?,
            ScanStatus::Running.as_str(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    log::info!("Started scan {} for providers {:?}", scan_id, provider_ids);
    Ok(scan_id)
}

fn header_from_row(row: &Row) -> rusqlite::Result<ScanHeader> {
    let provider_json: String = row.get(1)?;
    let provider_ids: Vec<String> =
        serde_json::from_str(&provider_json).map_err(|e| conversion_error(1, e))?;
    let status_raw: String = row.get(2)?;

    Ok(ScanHeader {
        scan_id: row.get(0)?,
        provider_ids,
        status: ScanStatus::from_str(&status_raw).map_err(|e| conversion_error(2, e))?,
        started_at: parse_timestamp(3, row.get(3)?)?,
        completed_at: parse_optional_timestamp(4, row.get(4)?)?,
    })
}

pub fn get_scan_header(conn: &Connection, scan_id: &str) -> Result<ScanHeader> {
    conn.query_row(
        "SELECT id, provider_ids, status, started_at, completed_at FROM scans WHERE id = ?1",
        [scan_id],
        header_from_row,
    )
    .optional()?
    .ok_or_else(|| StowageError::ScanNotFound(scan_id.to_string()))
}

pub fn list_scans(conn: &Connection) -> Result<Vec<ScanSummary>> {
    let mut stmt = conn.prepare(
        "SELECT id, provider_ids, status, started_at, completed_at, total_items, total_bytes
         FROM scans ORDER BY started_at DESC",
    )?;

    let scans = stmt
        .query_map([], |row| {
            Ok(ScanSummary {
                header: header_from_row(row)?,
                total_items: row.get(5)?,
                total_bytes: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(scans)
}

/// Insert a batch of items in a single transaction. A path already present
/// in the scan fails the whole batch.
pub fn insert_items(conn: &mut Connection, scan_id: &str, items: &[Item]) -> Result<usize> {
    get_scan_header(conn, scan_id)?;

    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO items (
                scan_id, path, name, extension, provider_id, size_bytes, mime_type,
                created_at, modified_at, content_hash, item_type, depth,
                extended_properties, issues, is_shared
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )?;

        for item in items {
            stmt.execute(params![
                scan_id,
                item.path,
                item.name,
                item.extension(),
                item.provider_id,
                item.size_bytes,
                item.mime_type,
                item.created_at.map(|dt| dt.to_rfc3339()),
                item.modified_at.map(|dt| dt.to_rfc3339()),
                item.content_hash,
                item.item_type.as_str(),
                item.depth,
                serde_json::to_string(&item.extended_properties)?,
                serde_json::to_string(&item.issues)?,
                item.is_shared,
            ])?;
        }
    }
    tx.commit()?;

    log::debug!("Stored {} items for scan {}", items.len(), scan_id);
    Ok(items.len())
}

pub(crate) const ITEM_COLUMNS: &str = "path, name, provider_id, size_bytes, mime_type, created_at,
     modified_at, content_hash, item_type, depth, extended_properties, issues, is_shared";

pub(crate) fn item_from_row(row: &Row) -> rusqlite::Result<Item> {
    let item_type_raw: String = row.get(8)?;
    let properties_raw: Option<String> = row.get(10)?;
    let issues_raw: Option<String> = row.get(11)?;

    let extended_properties: BTreeMap<String, String> = match properties_raw {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| conversion_error(10, e))?,
        None => BTreeMap::new(),
    };
    let issues: Vec<String> = match issues_raw {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| conversion_error(11, e))?,
        None => Vec::new(),
    };

    Ok(Item {
        path: row.get(0)?,
        name: row.get(1)?,
        provider_id: row.get(2)?,
        size_bytes: row.get(3)?,
        mime_type: row.get(4)?,
        created_at: parse_optional_timestamp(5, row.get(5)?)?,
        modified_at: parse_optional_timestamp(6, row.get(6)?)?,
        content_hash: row.get(7)?,
        item_type: ItemType::from_str(&item_type_raw).map_err(|e| conversion_error(8, e))?,
        depth: row.get(9)?,
        extended_properties,
        issues,
        is_shared: row.get(12)?,
    })
}

pub fn get_items(conn: &Connection, scan_id: &str) -> Result<Vec<Item>> {
    let query = format!(
        "SELECT {} FROM items WHERE scan_id = ?1 ORDER BY id",
        ITEM_COLUMNS
    );
    let mut stmt = conn.prepare(&query)?;
    let items = stmt
        .query_map([scan_id], item_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn compute_statistics(conn: &Connection, scan_id: &str) -> Result<ScanStatistics> {
    let (total_items, total_files, total_folders, total_bytes, max_depth, average_depth): (
        i64,
        i64,
        i64,
        i64,
        Option<i64>,
        Option<f64>,
    ) = conn.query_row(
        "SELECT
            COUNT(*),
            COALESCE(SUM(CASE WHEN item_type = 'file' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN item_type = 'folder' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN item_type = 'file' THEN size_bytes ELSE 0 END), 0),
            MAX(depth),
            AVG(depth)
         FROM items WHERE scan_id = ?1",
        [scan_id],
        |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        },
    )?;

    let (hashed_files, shared_items, items_with_issues): (i64, i64, i64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN item_type = 'file' AND content_hash IS NOT NULL THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN is_shared THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN issues IS NOT NULL AND issues != '[]' THEN 1 ELSE 0 END), 0)
         FROM items WHERE scan_id = ?1",
        [scan_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let mut stmt = conn.prepare(
        "SELECT provider_id, COUNT(*) FROM items WHERE scan_id = ?1 GROUP BY provider_id",
    )?;
    let items_by_provider = stmt
        .query_map([scan_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?
        .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

    Ok(ScanStatistics {
        total_items: total_items as usize,
        total_files: total_files as usize,
        total_folders: total_folders as usize,
        total_bytes,
        max_depth: max_depth.unwrap_or(0) as u32,
        average_depth: average_depth.unwrap_or(0.0),
        hashed_files: hashed_files as usize,
        shared_items: shared_items as usize,
        items_with_issues: items_with_issues as usize,
        items_by_provider,
    })
}

pub fn finish_scan(conn: &Connection, scan_id: &str, statistics: &ScanStatistics) -> Result<()> {
    let updated = conn.execute(
        "UPDATE scans SET status = ?1, completed_at = ?2, total_items = ?3, total_bytes = ?4
         WHERE id = ?5",
        params![
            ScanStatus::Complete.as_str(),
            Utc::now().to_rfc3339(),
            statistics.total_items as i64,
            statistics.total_bytes,
            scan_id,
        ],
    )?;

    if updated == 0 {
        return Err(StowageError::ScanNotFound(scan_id.to_string()));
    }

    log::info!(
        "Scan {} complete: {} items, {} bytes",
        scan_id,
        statistics.total_items,
        statistics.total_bytes
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::initialize_schema;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        conn
    }

    fn folder(path: &str, depth: u32) -> Item {
        Item {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap().to_string(),
            provider_id: "local".to_string(),
            size_bytes: 0,
            mime_type: None,
            created_at: None,
            modified_at: None,
            content_hash: None,
            item_type: ItemType::Folder,
            depth,
            extended_properties: BTreeMap::new(),
            issues: vec!["too deep".to_string()],
            is_shared: true,
        }
    }

    #[test]
    fn test_statistics_on_empty_scan() {
        let conn = setup();
        let scan_id = create_scan(&conn, &["local".to_string()]).unwrap();

        let stats = compute_statistics(&conn, &scan_id).unwrap();
        assert_eq!(stats.total_items, 0);
        assert_eq!(stats.max_depth, 0);
        assert_eq!(stats.average_depth, 0.0);
    }

    #[test]
    fn test_item_properties_survive_storage() {
        let mut conn = setup();
        let scan_id = create_scan(&conn, &["local".to_string()]).unwrap();

        let mut item = folder("/data/projects", 2);
        item.extended_properties
            .insert("owner".to_string(), "alice".to_string());
        insert_items(&mut conn, &scan_id, &[item.clone()]).unwrap();

        let loaded = get_items(&conn, &scan_id).unwrap();
        assert_eq!(loaded, vec![item]);

        let stats = compute_statistics(&conn, &scan_id).unwrap();
        assert_eq!(stats.total_folders, 1);
        assert_eq!(stats.shared_items, 1);
        assert_eq!(stats.items_with_issues, 1);
        assert_eq!(stats.items_by_provider.get("local"), Some(&1));
    }

    #[test]
    fn test_insert_into_unknown_scan_fails() {
        let mut conn = setup();
        let result = insert_items(&mut conn, "nope", &[folder("/a", 1)]);
        assert!(matches!(result, Err(StowageError::ScanNotFound(_))));
    }

    #[test]
    fn test_list_scans_reports_totals() {
        let mut conn = setup();
        let scan_id = create_scan(&conn, &["local".to_string()]).unwrap();
        insert_items(&mut conn, &scan_id, &[folder("/a", 1)]).unwrap();
        let stats = compute_statistics(&conn, &scan_id).unwrap();
        finish_scan(&conn, &scan_id, &stats).unwrap();

        let scans = list_scans(&conn).unwrap();
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].total_items, 1);
        assert_eq!(scans[0].header.status, ScanStatus::Complete);
    }
}
