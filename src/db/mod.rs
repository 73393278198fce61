mod groups;
mod migrations;
mod normalize;
mod tabs;
mod trash;

use crate::errors::{AppError, AppResult};
use crate::models::{CustomGroupMeta, GroupKind, TabRecord, TabSort};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub use migrations::LATEST_SCHEMA_VERSION;

const OPEN_BUSY_TIMEOUT: Duration = Duration::from_millis(250);

pub(crate) const TAB_COLUMNS: &str =
    "id, url, title, display_name, sort_key, domain, favicon_url, screenshot, last_accessed, saved_at";

/// Handle to the embedded archive store.
///
/// Opened once at startup and shared by every component. Each public method
/// takes the connection lock for its whole duration, so read-write work on the
/// store is serialized and multi-step mutations commit as one transaction.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    schema_version: u32,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        Self::open(path, LATEST_SCHEMA_VERSION)
    }

    /// Opens the store and upgrades it to `target_version`.
    ///
    /// Fails with [`AppError::Open`] when another connection holds the store
    /// or when the on-disk schema is newer than the requested version.
    pub fn open(path: &Path, target_version: u32) -> AppResult<Self> {
        if target_version == 0 || target_version > LATEST_SCHEMA_VERSION {
            return Err(AppError::InvalidInput(format!(
                "schema version {} is not supported (latest is {})",
                target_version, LATEST_SCHEMA_VERSION
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }

        let mut conn = Connection::open(path).map_err(|err| open_error(err, "open store"))?;
        conn.busy_timeout(OPEN_BUSY_TIMEOUT)
            .map_err(|err| open_error(err, "configure busy timeout"))?;

        let schema_version = migrate(&mut conn, target_version)?;
        tracing::info!(path = %path.display(), schema_version, "archive store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            schema_version,
        })
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Wipes every collection while keeping the schema in place.
    pub fn clear_all(&self) -> AppResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM tab_groups;
             DELETE FROM custom_group_meta;
             DELETE FROM tabs;
             DELETE FROM trashed_tabs;",
        )?;
        tx.commit()?;
        tracing::info!("archive store cleared");
        Ok(())
    }

    pub(crate) fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }
}

fn migrate(conn: &mut Connection, target_version: u32) -> AppResult<u32> {
    let current: u32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
        .map_err(|err| open_error(err, "read schema version"))? as u32;

    if current > target_version {
        return Err(AppError::Open(format!(
            "store schema version {} is newer than requested version {}",
            current, target_version
        )));
    }
    if current == target_version {
        return Ok(current);
    }

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Exclusive)
        .map_err(|err| open_error(err, "begin upgrade"))?;
    for step in migrations::MIGRATIONS {
        if step.version <= current || step.version > target_version {
            continue;
        }
        (step.apply)(&tx)?;
        tx.pragma_update(None, "user_version", i64::from(step.version))?;
        tracing::info!(version = step.version, step = step.name, "applied schema migration");
    }
    tx.commit().map_err(|err| open_error(err, "commit upgrade"))?;
    Ok(target_version)
}

fn open_error(err: rusqlite::Error, action: &str) -> AppError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            AppError::Open(format!("{}: store is held by another connection", action))
        }
        Some(ErrorCode::CannotOpen) | Some(ErrorCode::NotADatabase) => {
            AppError::Open(format!("{}: {}", action, err))
        }
        _ => AppError::Internal(format!("{}: {}", action, err)),
    }
}

pub(crate) fn parse_tab_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TabRecord> {
    Ok(TabRecord {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        display_name: row.get(3)?,
        sort_key: row.get(4)?,
        domain: row.get(5)?,
        custom_groups: Vec::new(),
        favicon_url: row.get(6)?,
        screenshot: row.get(7)?,
        last_accessed: row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        saved_at: parse_time(&row.get::<_, String>(9)?)?,
    })
}

pub(crate) fn parse_group_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CustomGroupMeta> {
    Ok(CustomGroupMeta {
        name: row.get(0)?,
        sort_order: row.get(1)?,
        color: row.get(2)?,
        sort_override: row
            .get::<_, Option<String>>(3)?
            .and_then(|raw| TabSort::parse(&raw)),
        created_at: parse_time(&row.get::<_, String>(4)?)?,
    })
}

pub(crate) fn fetch_tab(conn: &Connection, id: &str) -> AppResult<Option<TabRecord>> {
    let tab = conn
        .query_row(
            &format!("SELECT {} FROM tabs WHERE id = ?1", TAB_COLUMNS),
            [id],
            parse_tab_row,
        )
        .optional()?;
    match tab {
        Some(mut tab) => {
            tab.custom_groups = memberships_of(conn, &tab.id)?;
            Ok(Some(tab))
        }
        None => Ok(None),
    }
}

pub(crate) fn fetch_tab_by_url(conn: &Connection, url: &str) -> AppResult<Option<TabRecord>> {
    let tab = conn
        .query_row(
            &format!(
                "SELECT {} FROM tabs WHERE url = ?1 ORDER BY saved_at DESC, rowid ASC LIMIT 1",
                TAB_COLUMNS
            ),
            [url],
            parse_tab_row,
        )
        .optional()?;
    match tab {
        Some(mut tab) => {
            tab.custom_groups = memberships_of(conn, &tab.id)?;
            Ok(Some(tab))
        }
        None => Ok(None),
    }
}

/// Runs `sql` (which must select [`TAB_COLUMNS`]) and attaches memberships.
pub(crate) fn query_tabs(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> AppResult<Vec<TabRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let mut tabs = stmt
        .query_map(params, parse_tab_row)?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    attach_memberships(conn, &mut tabs)?;
    Ok(tabs)
}

pub(crate) fn attach_memberships(conn: &Connection, tabs: &mut [TabRecord]) -> AppResult<()> {
    if tabs.is_empty() {
        return Ok(());
    }
    let mut stmt =
        conn.prepare("SELECT tab_id, group_name FROM tab_groups ORDER BY tab_id, position ASC, rowid ASC")?;
    let mut by_tab: HashMap<String, Vec<String>> = HashMap::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let tab_id: String = row.get(0)?;
        let group_name: String = row.get(1)?;
        by_tab.entry(tab_id).or_default().push(group_name);
    }
    for tab in tabs.iter_mut() {
        tab.custom_groups = by_tab.remove(&tab.id).unwrap_or_default();
    }
    Ok(())
}

pub(crate) fn memberships_of(conn: &Connection, tab_id: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT group_name FROM tab_groups WHERE tab_id = ?1 ORDER BY position ASC, rowid ASC",
    )?;
    let names = stmt
        .query_map([tab_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Replaces the tab's membership set with `groups`, preserving their order.
pub(crate) fn write_memberships(conn: &Connection, tab_id: &str, groups: &[String]) -> AppResult<()> {
    conn.execute("DELETE FROM tab_groups WHERE tab_id = ?1", [tab_id])?;
    let mut position = 0i64;
    for name in groups {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO tab_groups (tab_id, group_name, position) VALUES (?1, ?2, ?3)",
            params![tab_id, name, position],
        )?;
        position += inserted as i64;
    }
    sync_legacy_group(conn, tab_id)
}

/// Recomputes the legacy single-group columns from the membership set.
pub(crate) fn sync_legacy_group(conn: &Connection, tab_id: &str) -> AppResult<()> {
    let first: Option<String> = conn
        .query_row(
            "SELECT group_name FROM tab_groups WHERE tab_id = ?1 ORDER BY position ASC, rowid ASC LIMIT 1",
            [tab_id],
            |row| row.get(0),
        )
        .optional()?;
    match first {
        Some(name) => conn.execute(
            "UPDATE tabs SET group_name = ?1, group_type = ?2 WHERE id = ?3",
            params![name, GroupKind::Custom.as_str(), tab_id],
        )?,
        None => conn.execute(
            "UPDATE tabs SET group_name = domain, group_type = ?1 WHERE id = ?2",
            params![GroupKind::Domain.as_str(), tab_id],
        )?,
    };
    Ok(())
}

/// Writes every column of `tab`, inserting or replacing by id.
pub(crate) fn upsert_tab_row(conn: &Connection, tab: &TabRecord) -> AppResult<()> {
    conn.execute(
        "INSERT INTO tabs (id, url, title, display_name, sort_key, domain, group_name, group_type,
                           favicon_url, screenshot, last_accessed, saved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 'domain', ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
           url = excluded.url,
           title = excluded.title,
           display_name = excluded.display_name,
           sort_key = excluded.sort_key,
           domain = excluded.domain,
           favicon_url = excluded.favicon_url,
           screenshot = excluded.screenshot,
           last_accessed = excluded.last_accessed,
           saved_at = excluded.saved_at",
        params![
            tab.id,
            tab.url,
            tab.title,
            tab.display_name,
            tab.sort_key,
            tab.domain,
            tab.favicon_url,
            tab.screenshot,
            tab.last_accessed.map(format_time),
            format_time(tab.saved_at),
        ],
    )?;
    write_memberships(conn, &tab.id, &tab.custom_groups)
}

pub(crate) fn delete_tab_rows(conn: &Connection, tab_id: &str) -> AppResult<bool> {
    conn.execute("DELETE FROM tab_groups WHERE tab_id = ?1", [tab_id])?;
    let removed = conn.execute("DELETE FROM tabs WHERE id = ?1", [tab_id])?;
    Ok(removed > 0)
}

/// Creates a meta record for `name` at the end of the order when it is missing.
pub(crate) fn ensure_group_meta(conn: &Connection, name: &str) -> AppResult<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO custom_group_meta (name, sort_order, color, sort_override, created_at)
         VALUES (?1, (SELECT COALESCE(MAX(sort_order), -1) + 1 FROM custom_group_meta), NULL, NULL, ?2)",
        params![name, format_time(now())],
    )?;
    Ok(inserted > 0)
}

pub(crate) fn domain_of(raw_url: &str) -> String {
    match url::Url::parse(raw_url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) if !host.is_empty() => host.to_ascii_lowercase(),
            _ => parsed.scheme().to_string(),
        },
        Err(_) => "unknown".to_string(),
    }
}

/// Current time at the store's millisecond precision.
pub(crate) fn now() -> DateTime<Utc> {
    truncate_time(Utc::now())
}

pub(crate) fn truncate_time(value: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(value.timestamp_millis()).unwrap_or(value)
}

/// Fixed-width RFC 3339 so stored timestamps order lexicographically.
pub(crate) fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::{domain_of, format_time, Database, LATEST_SCHEMA_VERSION};
    use crate::errors::AppError;
    use chrono::{TimeZone, Utc};
    use rusqlite::Connection;

    #[test]
    fn fresh_store_is_created_at_latest_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("tabs.sqlite")).expect("db");
        assert_eq!(db.schema_version(), LATEST_SCHEMA_VERSION);

        let conn = Connection::open(db.path()).expect("raw connection");
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .expect("user_version");
        assert_eq!(version as u32, LATEST_SCHEMA_VERSION);
    }

    #[test]
    fn reopening_is_idempotent_and_keeps_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tabs.sqlite");
        {
            let db = Database::new(&path).expect("db");
            db.save_tabs(&[crate::models::TabDraft::new("https://example.com/", "Example")])
                .expect("save");
        }
        let db = Database::new(&path).expect("reopen");
        assert_eq!(db.count_tabs().expect("count"), 1);
    }

    #[test]
    fn legacy_custom_groups_are_backfilled_on_upgrade() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tabs.sqlite");
        {
            let db = Database::open(&path, 1).expect("v1 store");
            assert_eq!(db.schema_version(), 1);
            let conn = db.conn().expect("conn");
            conn.execute(
                "INSERT INTO tabs (id, url, title, domain, group_name, group_type, saved_at)
                 VALUES ('legacy-1', 'https://docs.rs/', 'Docs', 'docs.rs', 'Reading', 'custom', ?1)",
                [format_time(Utc::now())],
            )
            .expect("insert legacy row");
        }

        let db = Database::new(&path).expect("upgrade");
        let tab = db.get_tab("legacy-1").expect("get").expect("tab exists");
        assert_eq!(tab.custom_groups, vec!["Reading".to_string()]);
        let groups = db.list_groups().expect("groups");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "Reading");
        assert_eq!(groups[0].sort_order, 0);
        assert!(tab.display_name.is_none());
    }

    #[test]
    fn newer_on_disk_version_is_an_open_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tabs.sqlite");
        Database::new(&path).expect("latest");
        let err = Database::open(&path, 2).expect_err("downgrade must fail");
        assert!(matches!(err, AppError::Open(_)));
    }

    #[test]
    fn upgrade_blocked_by_other_connection_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tabs.sqlite");
        let holder = Connection::open(&path).expect("holder");
        holder.execute_batch("BEGIN EXCLUSIVE;").expect("hold lock");

        let err = Database::new(&path).expect_err("blocked open must fail");
        assert!(matches!(err, AppError::Open(_)), "unexpected error: {err}");
        assert!(err.is_retryable());

        holder.execute_batch("COMMIT;").expect("release lock");
        drop(holder);
        assert!(Database::new(&path).is_ok());
    }

    #[test]
    fn clear_all_empties_every_collection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("tabs.sqlite")).expect("db");
        let saved = db
            .save_tabs(&[
                crate::models::TabDraft::new("https://a.example/", "A"),
                crate::models::TabDraft::new("https://b.example/", "B"),
            ])
            .expect("save");
        db.create_group("Dev").expect("group");
        db.move_to_trash(&saved[0].id, 30).expect("trash");

        db.clear_all().expect("clear");
        assert_eq!(db.count_tabs().expect("count"), 0);
        assert_eq!(db.get_trash_count().expect("trash count"), 0);
        assert!(db.list_groups().expect("groups").is_empty());
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_time(early), "2024-01-02T03:04:05.000Z");
    }

    #[test]
    fn domain_is_lowercased_host() {
        assert_eq!(domain_of("https://Docs.RS/tokio"), "docs.rs");
        assert_eq!(domain_of("file:///tmp/a.html"), "file");
        assert_eq!(domain_of("not a url"), "unknown");
    }
}
