use super::groups::{restore_group_metas, union_memberships};
use super::{
    delete_tab_rows, fetch_tab, fetch_tab_by_url, format_time, now, parse_tab_row, parse_time,
    upsert_tab_row, write_memberships, Database,
};
use crate::errors::{AppError, AppResult};
use crate::models::{BatchOutcome, DeleteOutcome, TabRecord, TrashedTab};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

const TRASH_COLUMNS: &str = "id, url, title, display_name, sort_key, domain, favicon_url, screenshot, \
                             last_accessed, saved_at, custom_groups_json, trashed_at";

impl Database {
    /// Moves an active tab into the trash. With `retention_days == 0` the tab
    /// is deleted permanently instead. Missing ids are reported, not failed.
    pub fn move_to_trash(&self, id: &str, retention_days: u32) -> AppResult<DeleteOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(tab) = fetch_tab(&tx, id)? else {
            return Ok(DeleteOutcome::NotFound);
        };

        let outcome = if retention_days == 0 {
            delete_tab_rows(&tx, id)?;
            DeleteOutcome::PermanentlyDeleted
        } else {
            insert_trash_row(&tx, &tab, now())?;
            delete_tab_rows(&tx, id)?;
            DeleteOutcome::Trashed
        };
        tx.commit()?;
        tracing::debug!(tab_id = id, outcome = ?outcome, "removed tab");
        Ok(outcome)
    }

    /// Best-effort batch: every id is handled in its own transaction.
    pub fn move_many_to_trash(&self, ids: &[String], retention_days: u32) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in ids {
            let result = self.move_to_trash(id, retention_days).map(|_| ());
            outcome.record(id, result);
        }
        log_batch("move to trash", &outcome);
        outcome
    }

    /// Moves a trashed tab back into the active collection.
    ///
    /// When the same url has been archived again in the meantime the trashed
    /// copy is folded into that record: its groups are merged in and the
    /// active record is returned.
    pub fn restore_from_trash(&self, id: &str) -> AppResult<TabRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let trashed = fetch_trashed(&tx, id)?.ok_or_else(|| AppError::NotFound(format!("trashed tab {}", id)))?;
        let groups = trashed.tab.custom_groups.clone();
        restore_group_metas(&tx, &groups)?;

        let restored = match fetch_tab_by_url(&tx, &trashed.tab.url)? {
            Some(active) if active.id != trashed.tab.id => {
                let merged = union_memberships(&tx, &active.id, &groups)?;
                write_memberships(&tx, &active.id, &merged)?;
                tracing::info!(
                    trashed_id = id,
                    active_id = %active.id,
                    "restored tab folded into active record with same url"
                );
                fetch_tab(&tx, &active.id)?.unwrap_or(active)
            }
            _ => {
                upsert_tab_row(&tx, &trashed.tab)?;
                trashed.tab
            }
        };
        tx.execute("DELETE FROM trashed_tabs WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(restored)
    }

    pub fn restore_many(&self, ids: &[String]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in ids {
            let result = self.restore_from_trash(id).map(|_| ());
            outcome.record(id, result);
        }
        log_batch("restore", &outcome);
        outcome
    }

    /// Permanently removes a trashed tab. Returns whether anything was removed.
    pub fn delete_from_trash(&self, id: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM trashed_tabs WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }

    pub fn delete_many_from_trash(&self, ids: &[String]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in ids {
            let result = self.delete_from_trash(id).map(|_| ());
            outcome.record(id, result);
        }
        log_batch("permanent delete", &outcome);
        outcome
    }

    pub fn empty_trash(&self) -> AppResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM trashed_tabs", [])?;
        tracing::info!(removed, "emptied trash");
        Ok(removed)
    }

    /// Trashed tabs, most recently trashed first.
    pub fn get_trashed_tabs(&self) -> AppResult<Vec<TrashedTab>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM trashed_tabs ORDER BY trashed_at DESC, rowid DESC",
            TRASH_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], parse_trash_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_trash_count(&self) -> AppResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM trashed_tabs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Deletes trashed tabs whose retention window ended before `now`.
    /// Zero retention disables the sweep.
    pub fn delete_expired_trash(&self, retention_days: u32, now: DateTime<Utc>) -> AppResult<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = now - Duration::days(i64::from(retention_days));
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM trashed_tabs WHERE trashed_at < ?1",
            [format_time(cutoff)],
        )?;
        if removed > 0 {
            tracing::info!(removed, retention_days, "swept expired trash");
        }
        Ok(removed)
    }
}

fn insert_trash_row(conn: &Connection, tab: &TabRecord, trashed_at: DateTime<Utc>) -> AppResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO trashed_tabs (id, url, title, display_name, sort_key, domain, group_name,
                                             group_type, custom_groups_json, favicon_url, screenshot,
                                             last_accessed, saved_at, trashed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            tab.id,
            tab.url,
            tab.title,
            tab.display_name,
            tab.sort_key,
            tab.domain,
            tab.group_label(),
            tab.group_kind().as_str(),
            serde_json::to_string(&tab.custom_groups)?,
            tab.favicon_url,
            tab.screenshot,
            tab.last_accessed.map(format_time),
            format_time(tab.saved_at),
            format_time(trashed_at),
        ],
    )?;
    Ok(())
}

fn fetch_trashed(conn: &Connection, id: &str) -> AppResult<Option<TrashedTab>> {
    conn.query_row(
        &format!("SELECT {} FROM trashed_tabs WHERE id = ?1", TRASH_COLUMNS),
        [id],
        parse_trash_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn parse_trash_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrashedTab> {
    let mut tab = parse_tab_row(row)?;
    let groups_raw: String = row.get(10)?;
    tab.custom_groups = serde_json::from_str::<Vec<String>>(&groups_raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(error))
    })?;
    Ok(TrashedTab {
        tab,
        trashed_at: parse_time(&row.get::<_, String>(11)?)?,
    })
}

fn log_batch(action: &str, outcome: &BatchOutcome) {
    if outcome.failed.is_empty() {
        tracing::info!(action, succeeded = outcome.succeeded.len(), "batch finished");
    } else {
        tracing::warn!(
            action,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "batch finished with failures"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::format_time;
    use crate::db::Database;
    use crate::errors::AppError;
    use crate::models::{DeleteOutcome, TabDraft};
    use chrono::{Duration, Utc};

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("tabs.sqlite")).expect("db");
        (dir, db)
    }

    fn backdate(db: &Database, id: &str, days: i64) {
        let conn = db.conn().expect("conn");
        conn.execute(
            "UPDATE trashed_tabs SET trashed_at = ?1 WHERE id = ?2",
            rusqlite::params![format_time(Utc::now() - Duration::days(days)), id],
        )
        .expect("backdate");
    }

    #[test]
    fn trash_then_restore_reproduces_record() {
        let (_dir, db) = open();
        let mut draft = TabDraft::new("https://example.com/doc", "Doc");
        draft.screenshot = Some(vec![9, 9]);
        draft.favicon_url = Some("https://example.com/favicon.ico".to_string());
        let saved = db.save_tabs(&[draft]).expect("save").remove(0);
        db.create_group("Reading").expect("group");
        let original = db.assign_tab_to_group(&saved.id, "Reading").expect("assign");

        assert_eq!(db.move_to_trash(&original.id, 30).expect("trash"), DeleteOutcome::Trashed);
        assert!(db.get_tab(&original.id).expect("get").is_none());
        let trashed = db.get_trashed_tabs().expect("trash list");
        assert_eq!(trashed.len(), 1);
        assert_eq!(trashed[0].tab, original);

        let restored = db.restore_from_trash(&original.id).expect("restore");
        assert_eq!(restored, original);
        assert_eq!(db.get_tab(&original.id).expect("get").expect("active"), original);
        assert_eq!(db.get_trash_count().expect("count"), 0);
    }

    #[test]
    fn zero_retention_deletes_immediately() {
        let (_dir, db) = open();
        let saved = db
            .save_tabs(&[TabDraft::new("https://example.com/", "Example")])
            .expect("save")
            .remove(0);
        assert_eq!(
            db.move_to_trash(&saved.id, 0).expect("delete"),
            DeleteOutcome::PermanentlyDeleted
        );
        assert!(db.get_trashed_tabs().expect("trash").is_empty());
        assert_eq!(db.count_tabs().expect("count"), 0);
        assert_eq!(db.move_to_trash(&saved.id, 30).expect("again"), DeleteOutcome::NotFound);
    }

    #[test]
    fn restoring_unknown_id_is_an_error() {
        let (_dir, db) = open();
        assert!(matches!(db.restore_from_trash("nope"), Err(AppError::NotFound(_))));
        assert!(!db.delete_from_trash("nope").expect("idempotent delete"));
    }

    #[test]
    fn sweep_respects_retention_window() {
        let (_dir, db) = open();
        let saved = db
            .save_tabs(&[
                TabDraft::new("https://old.example/", "Old"),
                TabDraft::new("https://recent.example/", "Recent"),
            ])
            .expect("save");
        for tab in &saved {
            db.move_to_trash(&tab.id, 7).expect("trash");
        }
        backdate(&db, &saved[0].id, 8);
        backdate(&db, &saved[1].id, 6);

        assert_eq!(db.delete_expired_trash(0, Utc::now()).expect("disabled sweep"), 0);
        assert_eq!(db.delete_expired_trash(7, Utc::now()).expect("sweep"), 1);
        let remaining = db.get_trashed_tabs().expect("trash");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].tab.id, saved[1].id);
    }

    #[test]
    fn batch_restore_keeps_successes_and_reports_failures() {
        let (_dir, db) = open();
        let saved = db
            .save_tabs(&[
                TabDraft::new("https://a.example/", "A"),
                TabDraft::new("https://b.example/", "B"),
            ])
            .expect("save");
        let ids: Vec<String> = saved.iter().map(|tab| tab.id.clone()).collect();
        let trashed = db.move_many_to_trash(&ids, 30);
        assert_eq!(trashed.succeeded.len(), 2);

        let request = vec![ids[0].clone(), "ghost".to_string(), ids[1].clone()];
        let outcome = db.restore_many(&request);
        assert_eq!(outcome.succeeded, vec![ids[0].clone(), ids[1].clone()]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].id, "ghost");
        assert_eq!(db.count_tabs().expect("count"), 2);
    }

    #[test]
    fn restore_onto_resaved_url_folds_into_active_record() {
        let (_dir, db) = open();
        let first = db
            .save_tabs(&[TabDraft::new("https://example.com/", "First")])
            .expect("save")
            .remove(0);
        db.create_group("Dev").expect("group");
        db.assign_tab_to_group(&first.id, "Dev").expect("assign");
        db.move_to_trash(&first.id, 30).expect("trash");
        db.delete_group("Dev").expect("drop group");

        let again = db
            .save_tabs(&[TabDraft::new("https://example.com/", "Again")])
            .expect("resave")
            .remove(0);
        assert_ne!(again.id, first.id);

        let restored = db.restore_from_trash(&first.id).expect("restore");
        assert_eq!(restored.id, again.id);
        assert_eq!(db.count_tabs().expect("count"), 1);
        assert_eq!(db.get_trash_count().expect("trash"), 0);
    }

    #[test]
    fn corrupt_membership_snapshot_fails_restore_without_losing_entry() {
        let (_dir, db) = open();
        let tab = db
            .save_tabs_for_custom_group(&[TabDraft::new("https://example.com/", "Example")], "Dev")
            .expect("save")
            .remove(0);
        db.move_to_trash(&tab.id, 30).expect("trash");
        {
            let conn = db.conn().expect("conn");
            conn.execute("UPDATE trashed_tabs SET custom_groups_json = '[\"Dev\"'", [])
                .expect("corrupt snapshot");
        }

        assert!(db.restore_from_trash(&tab.id).is_err());
        assert!(db.get_trashed_tabs().is_err());
        assert_eq!(db.get_trash_count().expect("trash"), 1);
        assert_eq!(db.count_tabs().expect("count"), 0);
    }

    #[test]
    fn restore_recreates_missing_group_meta() {
        let (_dir, db) = open();
        let tab = db
            .save_tabs(&[TabDraft::new("https://example.com/", "Example")])
            .expect("save")
            .remove(0);
        db.create_group("Dev").expect("group");
        db.assign_tab_to_group(&tab.id, "Dev").expect("assign");
        db.move_to_trash(&tab.id, 30).expect("trash");
        db.rename_group("Dev", "Work").expect("rename while trashed");

        let restored = db.restore_from_trash(&tab.id).expect("restore");
        assert_eq!(restored.custom_groups, vec!["Work".to_string()]);

        db.move_to_trash(&tab.id, 30).expect("trash again");
        {
            let conn = db.conn().expect("conn");
            conn.execute("DELETE FROM custom_group_meta", []).expect("drop metas");
        }
        let restored = db.restore_from_trash(&tab.id).expect("restore again");
        assert_eq!(restored.custom_groups, vec!["Work".to_string()]);
        assert!(db.get_group("Work").expect("meta").is_some());
    }
}
