use super::{format_time, now};
use crate::errors::AppResult;
use rusqlite::{params, Connection};

pub const LATEST_SCHEMA_VERSION: u32 = 4;

/// One append-only upgrade step. Steps must tolerate being re-run after a
/// partially applied upgrade, so every statement is "create if missing".
pub(crate) struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub apply: fn(&Connection) -> AppResult<()>,
}

pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "tabs",
        apply: create_tabs,
    },
    Migration {
        version: 2,
        name: "custom_groups",
        apply: create_custom_groups,
    },
    Migration {
        version: 3,
        name: "trash",
        apply: create_trash,
    },
    Migration {
        version: 4,
        name: "display_fields",
        apply: add_display_fields,
    },
];

fn create_tabs(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tabs (
           id TEXT PRIMARY KEY,
           url TEXT NOT NULL,
           title TEXT NOT NULL DEFAULT '',
           domain TEXT NOT NULL DEFAULT '',
           group_name TEXT NOT NULL DEFAULT '',
           group_type TEXT NOT NULL DEFAULT 'domain',
           favicon_url TEXT,
           screenshot BLOB,
           last_accessed TEXT,
           saved_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_tabs_url ON tabs(url);
         CREATE INDEX IF NOT EXISTS idx_tabs_group ON tabs(group_name);
         CREATE INDEX IF NOT EXISTS idx_tabs_saved_at ON tabs(saved_at DESC);",
    )?;
    Ok(())
}

fn create_custom_groups(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS custom_group_meta (
           name TEXT PRIMARY KEY,
           sort_order INTEGER NOT NULL,
           color TEXT,
           sort_override TEXT,
           created_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS tab_groups (
           tab_id TEXT NOT NULL,
           group_name TEXT NOT NULL,
           position INTEGER NOT NULL DEFAULT 0,
           PRIMARY KEY (tab_id, group_name)
         );
         CREATE INDEX IF NOT EXISTS idx_tab_groups_group ON tab_groups(group_name);
         CREATE INDEX IF NOT EXISTS idx_custom_group_meta_order ON custom_group_meta(sort_order);
         INSERT OR IGNORE INTO tab_groups (tab_id, group_name, position)
           SELECT id, group_name, 0 FROM tabs
           WHERE group_type = 'custom' AND group_name <> '';",
    )?;

    let mut stmt = conn.prepare(
        "SELECT DISTINCT group_name FROM tab_groups
         WHERE group_name NOT IN (SELECT name FROM custom_group_meta)
         ORDER BY group_name ASC",
    )?;
    let missing = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let created_at = format_time(now());
    for name in missing {
        conn.execute(
            "INSERT OR IGNORE INTO custom_group_meta (name, sort_order, color, sort_override, created_at)
             VALUES (?1, (SELECT COALESCE(MAX(sort_order), -1) + 1 FROM custom_group_meta), NULL, NULL, ?2)",
            params![name, created_at],
        )?;
    }
    Ok(())
}

fn create_trash(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS trashed_tabs (
           id TEXT PRIMARY KEY,
           url TEXT NOT NULL,
           title TEXT NOT NULL DEFAULT '',
           domain TEXT NOT NULL DEFAULT '',
           group_name TEXT NOT NULL DEFAULT '',
           group_type TEXT NOT NULL DEFAULT 'domain',
           custom_groups_json TEXT NOT NULL DEFAULT '[]',
           favicon_url TEXT,
           screenshot BLOB,
           last_accessed TEXT,
           saved_at TEXT NOT NULL,
           trashed_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_trashed_tabs_trashed_at ON trashed_tabs(trashed_at);
         CREATE INDEX IF NOT EXISTS idx_trashed_tabs_url ON trashed_tabs(url);",
    )?;
    Ok(())
}

fn add_display_fields(conn: &Connection) -> AppResult<()> {
    for table in ["tabs", "trashed_tabs"] {
        if !column_exists(conn, table, "display_name")? {
            conn.execute(&format!("ALTER TABLE {} ADD COLUMN display_name TEXT", table), [])?;
        }
        if !column_exists(conn, table, "sort_key")? {
            conn.execute(&format!("ALTER TABLE {} ADD COLUMN sort_key TEXT", table), [])?;
        }
    }
    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_tabs_domain ON tabs(domain);")?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
