use super::{
    ensure_group_meta, fetch_tab, memberships_of, parse_group_row, query_tabs, sync_legacy_group,
    Database, TAB_COLUMNS,
};
use crate::errors::{AppError, AppResult};
use crate::models::{CustomGroupMeta, TabRecord, TabSort};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};

const GROUP_COLUMNS: &str = "name, sort_order, color, sort_override, created_at";

/// `#rgb`, `#rrggbb` or a lowercase palette name such as `blue`.
static GROUP_COLOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(#[0-9a-fA-F]{3}|#[0-9a-fA-F]{6}|[a-z]{3,20})$").expect("valid regex"));

impl Database {
    /// Custom groups in their canonical order.
    pub fn list_groups(&self) -> AppResult<Vec<CustomGroupMeta>> {
        let conn = self.conn()?;
        list_groups(&conn)
    }

    pub fn get_group(&self, name: &str) -> AppResult<Option<CustomGroupMeta>> {
        let conn = self.conn()?;
        get_group(&conn, name)
    }

    pub fn create_group(&self, name: &str) -> AppResult<CustomGroupMeta> {
        let name = validate_group_name(name)?;
        let conn = self.conn()?;
        if get_group(&conn, name)?.is_some() {
            return Err(AppError::DuplicateName(format!("group '{}' already exists", name)));
        }
        ensure_group_meta(&conn, name)?;
        tracing::info!(group = name, "created custom group");
        get_group(&conn, name)?.ok_or_else(|| AppError::Internal(format!("group '{}' vanished", name)))
    }

    /// Renames a group and rewrites every reference to it in one transaction.
    /// Returns how many active tabs were rewritten.
    pub fn rename_group(&self, old_name: &str, new_name: &str) -> AppResult<usize> {
        let old_name = validate_group_name(old_name)?;
        let new_name = validate_group_name(new_name)?;
        let mut conn = self.conn()?;
        if get_group(&conn, old_name)?.is_none() {
            return Err(AppError::NotFound(format!("group '{}'", old_name)));
        }
        if old_name == new_name {
            return Ok(0);
        }
        if get_group(&conn, new_name)?.is_some() {
            return Err(AppError::DuplicateName(format!("group '{}' already exists", new_name)));
        }

        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE custom_group_meta SET name = ?1 WHERE name = ?2",
            params![new_name, old_name],
        )?;
        let tab_ids = tabs_referencing(&tx, old_name)?;
        // Stray memberships under the new name would collide with the renamed rows.
        tx.execute(
            "DELETE FROM tab_groups
             WHERE group_name = ?1
               AND tab_id IN (SELECT tab_id FROM tab_groups WHERE group_name = ?2)",
            params![new_name, old_name],
        )?;
        tx.execute(
            "UPDATE tab_groups SET group_name = ?1 WHERE group_name = ?2",
            params![new_name, old_name],
        )?;
        for tab_id in &tab_ids {
            sync_legacy_group(&tx, tab_id)?;
        }
        let trashed = rewrite_trashed_memberships(&tx, old_name, Some(new_name))?;
        tx.commit()?;

        tracing::info!(
            from = old_name,
            to = new_name,
            tabs = tab_ids.len(),
            trashed,
            "renamed custom group"
        );
        Ok(tab_ids.len())
    }

    /// Removes a group. Tabs left without any custom group fall back to their
    /// domain group. Deleting a missing group is a no-op.
    pub fn delete_group(&self, name: &str) -> AppResult<usize> {
        let name = validate_group_name(name)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM custom_group_meta WHERE name = ?1", [name])?;
        let tab_ids = tabs_referencing(&tx, name)?;
        tx.execute("DELETE FROM tab_groups WHERE group_name = ?1", [name])?;
        for tab_id in &tab_ids {
            sync_legacy_group(&tx, tab_id)?;
        }
        rewrite_trashed_memberships(&tx, name, None)?;
        compact_group_order(&tx)?;
        tx.commit()?;

        if removed > 0 || !tab_ids.is_empty() {
            tracing::info!(group = name, tabs = tab_ids.len(), "deleted custom group");
        }
        Ok(tab_ids.len())
    }

    pub fn assign_tab_to_group(&self, tab_id: &str, name: &str) -> AppResult<TabRecord> {
        let name = validate_group_name(name)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if fetch_tab(&tx, tab_id)?.is_none() {
            return Err(AppError::NotFound(format!("tab {}", tab_id)));
        }
        if get_group(&tx, name)?.is_none() {
            return Err(AppError::NotFound(format!("group '{}'", name)));
        }
        tx.execute(
            "INSERT OR IGNORE INTO tab_groups (tab_id, group_name, position)
             VALUES (?1, ?2, (SELECT COALESCE(MAX(position), -1) + 1 FROM tab_groups WHERE tab_id = ?1))",
            params![tab_id, name],
        )?;
        sync_legacy_group(&tx, tab_id)?;
        let tab = fetch_tab(&tx, tab_id)?.ok_or_else(|| AppError::NotFound(format!("tab {}", tab_id)))?;
        tx.commit()?;
        Ok(tab)
    }

    /// Drops one membership, or every custom membership when `name` is `None`.
    pub fn unassign_tab(&self, tab_id: &str, name: Option<&str>) -> AppResult<TabRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if fetch_tab(&tx, tab_id)?.is_none() {
            return Err(AppError::NotFound(format!("tab {}", tab_id)));
        }
        match name {
            Some(name) => tx.execute(
                "DELETE FROM tab_groups WHERE tab_id = ?1 AND group_name = ?2",
                params![tab_id, name.trim()],
            )?,
            None => tx.execute("DELETE FROM tab_groups WHERE tab_id = ?1", [tab_id])?,
        };
        sync_legacy_group(&tx, tab_id)?;
        let tab = fetch_tab(&tx, tab_id)?.ok_or_else(|| AppError::NotFound(format!("tab {}", tab_id)))?;
        tx.commit()?;
        Ok(tab)
    }

    /// Rewrites every sort order to its index in `names`. Groups missing from
    /// `names` keep their relative order after the listed ones.
    pub fn update_group_order(&self, names: &[String]) -> AppResult<Vec<CustomGroupMeta>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let current: Vec<String> = list_groups(&tx)?.into_iter().map(|group| group.name).collect();

        let mut ordered: Vec<String> = Vec::with_capacity(current.len());
        for name in names {
            let name = name.trim();
            if !current.iter().any(|existing| existing == name) {
                tracing::warn!(group = name, "ignoring unknown group in reorder request");
                continue;
            }
            if !ordered.iter().any(|seen| seen == name) {
                ordered.push(name.to_string());
            }
        }
        for name in current {
            if !ordered.contains(&name) {
                ordered.push(name);
            }
        }

        for (index, name) in ordered.iter().enumerate() {
            tx.execute(
                "UPDATE custom_group_meta SET sort_order = ?1 WHERE name = ?2",
                params![index as i64, name],
            )?;
        }
        let groups = list_groups(&tx)?;
        tx.commit()?;
        Ok(groups)
    }

    pub fn set_group_color(&self, name: &str, color: Option<&str>) -> AppResult<CustomGroupMeta> {
        let conn = self.conn()?;
        let color = color.map(str::trim).filter(|value| !value.is_empty());
        if let Some(color) = color {
            if !GROUP_COLOR.is_match(color) {
                return Err(AppError::InvalidInput(format!("unsupported group color '{}'", color)));
            }
        }
        let changed = conn.execute(
            "UPDATE custom_group_meta SET color = ?1 WHERE name = ?2",
            params![color, name],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("group '{}'", name)));
        }
        get_group(&conn, name)?.ok_or_else(|| AppError::NotFound(format!("group '{}'", name)))
    }

    pub fn set_group_sort_override(&self, name: &str, sort: Option<TabSort>) -> AppResult<CustomGroupMeta> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE custom_group_meta SET sort_override = ?1 WHERE name = ?2",
            params![sort.map(TabSort::as_str), name],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("group '{}'", name)));
        }
        get_group(&conn, name)?.ok_or_else(|| AppError::NotFound(format!("group '{}'", name)))
    }

    /// Members of a custom group, ordered by the group's override or `fallback`.
    pub fn list_group_tabs(&self, name: &str, fallback: TabSort) -> AppResult<Vec<TabRecord>> {
        let conn = self.conn()?;
        let group = get_group(&conn, name)?.ok_or_else(|| AppError::NotFound(format!("group '{}'", name)))?;
        let sort = group.sort_override.unwrap_or(fallback);
        query_tabs(
            &conn,
            &format!(
                "SELECT {} FROM tabs
                 WHERE id IN (SELECT tab_id FROM tab_groups WHERE group_name = ?1)
                 ORDER BY {}",
                TAB_COLUMNS,
                sort.order_by()
            ),
            &[&group.name as &dyn rusqlite::ToSql],
        )
    }

    pub fn count_tabs_in_group(&self, name: &str) -> AppResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM tab_groups WHERE group_name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

pub(crate) fn list_groups(conn: &Connection) -> AppResult<Vec<CustomGroupMeta>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM custom_group_meta ORDER BY sort_order ASC, name ASC",
        GROUP_COLUMNS
    ))?;
    let groups = stmt
        .query_map([], parse_group_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(groups)
}

pub(crate) fn get_group(conn: &Connection, name: &str) -> AppResult<Option<CustomGroupMeta>> {
    conn.query_row(
        &format!("SELECT {} FROM custom_group_meta WHERE name = ?1", GROUP_COLUMNS),
        [name],
        parse_group_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn tabs_referencing(conn: &Connection, name: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT tab_id FROM tab_groups WHERE group_name = ?1")?;
    let ids = stmt
        .query_map([name], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Re-ranks sort orders densely from zero, keeping the current order.
fn compact_group_order(conn: &Connection) -> AppResult<()> {
    for (index, group) in list_groups(conn)?.iter().enumerate() {
        if group.sort_order != index as i64 {
            conn.execute(
                "UPDATE custom_group_meta SET sort_order = ?1 WHERE name = ?2",
                params![index as i64, group.name],
            )?;
        }
    }
    Ok(())
}

/// Renames (or drops, when `new_name` is `None`) a group inside trashed records
/// so a later restore lands in the right place.
fn rewrite_trashed_memberships(conn: &Connection, old_name: &str, new_name: Option<&str>) -> AppResult<usize> {
    let mut stmt = conn.prepare(
        "SELECT id, custom_groups_json FROM trashed_tabs
         WHERE EXISTS (SELECT 1 FROM json_each(trashed_tabs.custom_groups_json) WHERE value = ?1)",
    )?;
    let rows = stmt
        .query_map([old_name], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    for (id, raw) in &rows {
        let groups: Vec<String> = serde_json::from_str(raw)?;
        let mut rewritten: Vec<String> = Vec::with_capacity(groups.len());
        for group in groups {
            let group = if group == old_name {
                match new_name {
                    Some(new_name) => new_name.to_string(),
                    None => continue,
                }
            } else {
                group
            };
            if !rewritten.contains(&group) {
                rewritten.push(group);
            }
        }
        conn.execute(
            "UPDATE trashed_tabs SET custom_groups_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(&rewritten)?, id],
        )?;
    }
    Ok(rows.len())
}

fn validate_group_name(raw: &str) -> AppResult<&str> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AppError::InvalidInput("group name must not be empty".to_string()));
    }
    Ok(name)
}

/// Recreates metas for groups that a restored record still references.
pub(crate) fn restore_group_metas(conn: &Connection, groups: &[String]) -> AppResult<usize> {
    let mut created = 0usize;
    for name in groups {
        if ensure_group_meta(conn, name)? {
            created += 1;
        }
    }
    Ok(created)
}

pub(crate) fn union_memberships(conn: &Connection, tab_id: &str, extra: &[String]) -> AppResult<Vec<String>> {
    let mut groups = memberships_of(conn, tab_id)?;
    for name in extra {
        if !groups.contains(name) {
            groups.push(name.clone());
        }
    }
    Ok(groups)
}
