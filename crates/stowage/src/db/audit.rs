use crate::db::items::parse_timestamp;
use crate::db::AuditLogEntry;
use crate::error::Result;

pub trait AuditDatabase {
    fn log_audit(&mut self, entry: &AuditLogEntry) -> Result<i64>;
    fn get_audit_entries(
        &self,
        plan_id: Option<&str>,
        action: Option<&str>,
        limit: Option<i32>,
    ) -> Result<Vec<AuditLogEntry>>;
    fn get_audit_entries_for_plan(&self, plan_id: &str) -> Result<Vec<AuditLogEntry>>;
}

impl AuditDatabase for crate::db::SqliteDatabase {
    fn log_audit(&mut self, entry: &AuditLogEntry) -> Result<i64> {
        let conn = self.conn_mut();
        conn.execute(
            "INSERT INTO audit_log (timestamp, action, plan_id, operation_id, details)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                entry.timestamp.to_rfc3339(),
                &entry.action,
                &entry.plan_id,
                &entry.operation_id,
                &entry.details,
            ),
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_audit_entries(
        &self,
        plan_id: Option<&str>,
        action: Option<&str>,
        limit: Option<i32>,
    ) -> Result<Vec<AuditLogEntry>> {
        let conn = self.conn();
        let mut query = "SELECT id, timestamp, action, plan_id, operation_id, details
                         FROM audit_log WHERE 1=1"
            .to_string();

        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(pid) = plan_id {
            query.push_str(" AND plan_id = ?");
            params.push(Box::new(pid.to_string()));
        }

        if let Some(act) = action {
            query.push_str(" AND action = ?");
            params.push(Box::new(act.to_string()));
        }

        query.push_str(" ORDER BY id");

        if let Some(lim) = limit {
            query.push_str(" LIMIT ?");
            params.push(Box::new(lim));
        }

        let mut stmt = conn.prepare(&query)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let entries = stmt
            .query_map(&param_refs[..], |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    timestamp: parse_timestamp(1, row.get(1)?)?,
                    action: row.get(2)?,
                    plan_id: row.get(3)?,
                    operation_id: row.get(4)?,
                    details: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn get_audit_entries_for_plan(&self, plan_id: &str) -> Result<Vec<AuditLogEntry>> {
        self.get_audit_entries(Some(plan_id), None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;

    fn create_test_db() -> SqliteDatabase {
        let mut db = SqliteDatabase::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_audit_log() {
        let mut db = create_test_db();

        let mut entry = AuditLogEntry::new(
            "operation_failed",
            Some("plan-1"),
            Some("copy failed".to_string()),
        );
        entry.operation_id = Some("op-1".to_string());

        let id = db.log_audit(&entry).unwrap();
        assert!(id > 0);

        let entries = db.get_audit_entries_for_plan("plan-1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "operation_failed");
        assert_eq!(entries[0].operation_id.as_deref(), Some("op-1"));
    }

    #[test]
    fn test_audit_log_filtering() {
        let mut db = create_test_db();

        for i in 1..=5 {
            let action = if i % 2 == 0 { "batch_checkpointed" } else { "plan_paused" };
            db.log_audit(&AuditLogEntry::new(action, Some("plan-1"), None))
                .unwrap();
        }
        db.log_audit(&AuditLogEntry::new("plan_created", Some("plan-2"), None))
            .unwrap();

        assert_eq!(db.get_audit_entries(None, None, None).unwrap().len(), 6);
        assert_eq!(db.get_audit_entries(None, None, Some(3)).unwrap().len(), 3);
        assert_eq!(
            db.get_audit_entries(Some("plan-1"), Some("batch_checkpointed"), None)
                .unwrap()
                .len(),
            2
        );
    }
}
