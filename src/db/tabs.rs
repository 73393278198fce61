use super::{
    delete_tab_rows, domain_of, ensure_group_meta, fetch_tab, fetch_tab_by_url, now, query_tabs,
    truncate_time, upsert_tab_row, Database, TAB_COLUMNS,
};
use crate::errors::{AppError, AppResult};
use crate::models::{TabDraft, TabRecord, TabSort};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
enum SaveMode<'a> {
    /// Ordinary re-save: existing organization is left alone.
    PreserveGroups,
    /// The save exists to (re)assign the tabs to this custom group.
    AssignGroup(&'a str),
}

impl Database {
    /// All active tabs, newest first.
    pub fn get_all_tabs(&self) -> AppResult<Vec<TabRecord>> {
        self.list_tabs(TabSort::SavedAt)
    }

    pub fn list_tabs(&self, sort: TabSort) -> AppResult<Vec<TabRecord>> {
        let conn = self.conn()?;
        query_tabs(
            &conn,
            &format!("SELECT {} FROM tabs ORDER BY {}", TAB_COLUMNS, sort.order_by()),
            &[],
        )
    }

    pub fn get_tab(&self, id: &str) -> AppResult<Option<TabRecord>> {
        let conn = self.conn()?;
        fetch_tab(&conn, id)
    }

    pub fn get_tab_by_url(&self, url: &str) -> AppResult<Option<TabRecord>> {
        let conn = self.conn()?;
        fetch_tab_by_url(&conn, url)
    }

    /// Case-insensitive substring search over title, display name and url.
    pub fn search_tabs(&self, query: &str) -> AppResult<Vec<TabRecord>> {
        let needle = query.trim();
        if needle.is_empty() {
            return self.get_all_tabs();
        }
        let pattern = format!("%{}%", escape_like(&needle.to_lowercase()));
        let conn = self.conn()?;
        query_tabs(
            &conn,
            &format!(
                "SELECT {} FROM tabs
                 WHERE lower(title) LIKE ?1 ESCAPE '\\'
                    OR lower(url) LIKE ?1 ESCAPE '\\'
                    OR lower(COALESCE(display_name, '')) LIKE ?1 ESCAPE '\\'
                 ORDER BY saved_at DESC, rowid ASC",
                TAB_COLUMNS
            ),
            &[&pattern as &dyn rusqlite::ToSql],
        )
    }

    pub fn count_tabs(&self) -> AppResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM tabs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Writes a full record by key. The url must not belong to another active record.
    pub fn put_tab(&self, tab: &TabRecord) -> AppResult<()> {
        self.put_tabs(std::slice::from_ref(tab))
    }

    /// Writes several records in one transaction; nothing is committed if any write fails.
    pub fn put_tabs(&self, tabs: &[TabRecord]) -> AppResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for tab in tabs {
            validate_url(&tab.url)?;
            let clash: Option<String> = tx
                .query_row(
                    "SELECT id FROM tabs WHERE url = ?1 AND id <> ?2 LIMIT 1",
                    params![tab.url, tab.id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(other) = clash {
                return Err(AppError::InvalidInput(format!(
                    "url {} is already archived as {}",
                    tab.url, other
                )));
            }
            for name in &tab.custom_groups {
                ensure_group_meta(&tx, name)?;
            }
            upsert_tab_row(&tx, tab)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns whether a record was removed. A missing id is not an error.
    pub fn delete_tab_by_id(&self, id: &str) -> AppResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = delete_tab_rows(&tx, id)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Ids of active tabs shown under `name`: members of that custom group, plus
    /// tabs without custom membership whose domain group is `name`.
    pub fn tab_ids_in_group(&self, name: &str) -> AppResult<Vec<String>> {
        let conn = self.conn()?;
        group_member_ids(&conn, name)
    }

    /// Permanently deletes every active tab shown under `name` in one
    /// transaction, without going through the trash.
    pub fn purge_tabs_by_group(&self, name: &str) -> AppResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0usize;
        for id in group_member_ids(&tx, name)? {
            if delete_tab_rows(&tx, &id)? {
                removed += 1;
            }
        }
        tx.commit()?;
        tracing::info!(group = name, removed, "purged tabs by group");
        Ok(removed)
    }

    pub fn update_tab_details(
        &self,
        id: &str,
        display_name: Option<&str>,
        sort_key: Option<&str>,
    ) -> AppResult<TabRecord> {
        let conn = self.conn()?;
        let display_name = display_name.map(str::trim).filter(|value| !value.is_empty());
        let sort_key = sort_key.map(str::trim).filter(|value| !value.is_empty());
        let changed = conn.execute(
            "UPDATE tabs SET display_name = ?1, sort_key = ?2 WHERE id = ?3",
            params![display_name, sort_key, id],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("tab {}", id)));
        }
        fetch_tab(&conn, id)?.ok_or_else(|| AppError::NotFound(format!("tab {}", id)))
    }

    /// Saves captured tabs, merging into existing records with the same url.
    ///
    /// A matched record keeps its id and group membership; title, favicon and
    /// access times are replaced and the screenshot only when a new one is
    /// supplied. The whole batch commits atomically.
    pub fn save_tabs(&self, drafts: &[TabDraft]) -> AppResult<Vec<TabRecord>> {
        self.save_drafts(drafts, SaveMode::PreserveGroups)
    }

    /// Saves tabs and makes `group` their only custom group, creating the
    /// group when it does not exist yet.
    pub fn save_tabs_for_custom_group(&self, drafts: &[TabDraft], group: &str) -> AppResult<Vec<TabRecord>> {
        let group = group.trim();
        if group.is_empty() {
            return Err(AppError::InvalidInput("group name must not be empty".to_string()));
        }
        self.save_drafts(drafts, SaveMode::AssignGroup(group))
    }

    fn save_drafts(&self, drafts: &[TabDraft], mode: SaveMode<'_>) -> AppResult<Vec<TabRecord>> {
        for draft in drafts {
            validate_url(&draft.url)?;
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if let SaveMode::AssignGroup(group) = mode {
            ensure_group_meta(&tx, group)?;
        }

        let mut saved = Vec::with_capacity(drafts.len());
        let mut inserted = 0usize;
        for draft in drafts {
            let url = draft.url.trim();
            let saved_at = draft.saved_at.map(truncate_time).unwrap_or_else(now);
            let last_accessed = draft.last_accessed.map(truncate_time);

            let mut record = match fetch_tab_by_url(&tx, url)? {
                Some(mut existing) => {
                    existing.title = draft.title.clone();
                    existing.favicon_url = draft.favicon_url.clone();
                    existing.last_accessed = last_accessed;
                    existing.saved_at = saved_at;
                    if draft.has_screenshot() {
                        existing.screenshot = draft.screenshot.clone();
                    }
                    existing
                }
                None => {
                    inserted += 1;
                    TabRecord {
                        id: Uuid::new_v4().to_string(),
                        url: url.to_string(),
                        title: draft.title.clone(),
                        display_name: None,
                        sort_key: None,
                        domain: domain_of(url),
                        custom_groups: Vec::new(),
                        favicon_url: draft.favicon_url.clone(),
                        screenshot: draft.screenshot.clone().filter(|bytes| !bytes.is_empty()),
                        last_accessed,
                        saved_at,
                    }
                }
            };

            if let SaveMode::AssignGroup(group) = mode {
                record.custom_groups = vec![group.to_string()];
            }
            upsert_tab_row(&tx, &record)?;
            saved.push(record);
        }
        tx.commit()?;

        tracing::debug!(
            count = saved.len(),
            inserted,
            merged = saved.len() - inserted,
            "saved tabs"
        );
        Ok(saved)
    }
}

fn group_member_ids(conn: &Connection, name: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM tabs
         WHERE id IN (SELECT tab_id FROM tab_groups WHERE group_name = ?1)
            OR (group_type = 'domain' AND group_name = ?1)
         ORDER BY saved_at DESC, rowid ASC",
    )?;
    let ids = stmt
        .query_map([name], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn validate_url(url: &str) -> AppResult<()> {
    if url.trim().is_empty() {
        return Err(AppError::InvalidInput("tab url must not be empty".to_string()));
    }
    Ok(())
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use crate::db::Database;
    use crate::models::{TabDraft, TabSort};
    use chrono::{Duration, Utc};

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("tabs.sqlite")).expect("db");
        (dir, db)
    }

    #[test]
    fn resaving_same_url_keeps_one_record_and_id() {
        let (_dir, db) = open();
        let first = db
            .save_tabs(&[TabDraft::new("https://example.com/page", "First")])
            .expect("first save");
        for title in ["Second", "Third"] {
            db.save_tabs(&[TabDraft::new("https://example.com/page", title)])
                .expect("resave");
        }

        let all = db.get_all_tabs().expect("all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, first[0].id);
        assert_eq!(all[0].title, "Third");
    }

    #[test]
    fn empty_screenshot_does_not_replace_existing_one() {
        let (_dir, db) = open();
        let mut draft = TabDraft::new("https://example.com/", "Example");
        draft.screenshot = Some(vec![1, 2, 3]);
        db.save_tabs(&[draft]).expect("save with screenshot");

        let mut resave = TabDraft::new("https://example.com/", "Example again");
        resave.screenshot = Some(Vec::new());
        db.save_tabs(&[resave]).expect("resave");

        let tab = db
            .get_tab_by_url("https://example.com/")
            .expect("lookup")
            .expect("tab");
        assert_eq!(tab.screenshot, Some(vec![1, 2, 3]));
        assert_eq!(tab.title, "Example again");
    }

    #[test]
    fn plain_resave_keeps_manual_organization() {
        let (_dir, db) = open();
        let saved = db
            .save_tabs(&[TabDraft::new("https://docs.rs/", "Docs")])
            .expect("save");
        db.create_group("Reading").expect("group");
        db.assign_tab_to_group(&saved[0].id, "Reading").expect("assign");

        db.save_tabs(&[TabDraft::new("https://docs.rs/", "Docs v2")])
            .expect("resave");
        let tab = db.get_tab(&saved[0].id).expect("get").expect("tab");
        assert_eq!(tab.custom_groups, vec!["Reading".to_string()]);
        assert_eq!(tab.title, "Docs v2");
    }

    #[test]
    fn custom_group_save_overwrites_membership() {
        let (_dir, db) = open();
        let saved = db
            .save_tabs(&[TabDraft::new("https://docs.rs/", "Docs")])
            .expect("save");
        db.create_group("Reading").expect("group");
        db.assign_tab_to_group(&saved[0].id, "Reading").expect("assign");

        let resaved = db
            .save_tabs_for_custom_group(&[TabDraft::new("https://docs.rs/", "Docs")], "Later")
            .expect("group save");
        assert_eq!(resaved[0].id, saved[0].id);
        assert_eq!(resaved[0].custom_groups, vec!["Later".to_string()]);
        assert!(db.get_group("Later").expect("meta").is_some());
    }

    #[test]
    fn duplicate_urls_within_one_batch_collapse() {
        let (_dir, db) = open();
        let saved = db
            .save_tabs(&[
                TabDraft::new("https://example.com/", "One"),
                TabDraft::new("https://example.com/", "Two"),
            ])
            .expect("save");
        assert_eq!(saved[0].id, saved[1].id);
        assert_eq!(db.count_tabs().expect("count"), 1);
    }

    #[test]
    fn invalid_draft_rejects_whole_batch() {
        let (_dir, db) = open();
        let result = db.save_tabs(&[
            TabDraft::new("https://example.com/", "Valid"),
            TabDraft::new("   ", "Invalid"),
        ]);
        assert!(result.is_err());
        assert_eq!(db.count_tabs().expect("count"), 0);
    }

    #[test]
    fn get_all_is_newest_first_and_search_matches_title_or_url() {
        let (_dir, db) = open();
        let now = Utc::now();
        let mut old = TabDraft::new("https://rust-lang.org/", "Rust");
        old.saved_at = Some(now - Duration::hours(2));
        let mut new = TabDraft::new("https://tokio.rs/", "Tokio runtime");
        new.saved_at = Some(now);
        db.save_tabs(&[old, new]).expect("save");

        let all = db.get_all_tabs().expect("all");
        assert_eq!(all[0].url, "https://tokio.rs/");
        assert_eq!(all[1].url, "https://rust-lang.org/");

        let by_title = db.search_tabs("RUNTIME").expect("search");
        assert_eq!(by_title.len(), 1);
        let by_url = db.search_tabs("rust-lang").expect("search");
        assert_eq!(by_url.len(), 1);
        assert!(db.search_tabs("100%").expect("search").is_empty());

        let by_domain = db.list_tabs(TabSort::Domain).expect("sorted");
        assert_eq!(by_domain[0].domain, "rust-lang.org");
    }

    #[test]
    fn put_rejects_url_owned_by_another_record() {
        let (_dir, db) = open();
        let saved = db
            .save_tabs(&[
                TabDraft::new("https://a.example/", "A"),
                TabDraft::new("https://b.example/", "B"),
            ])
            .expect("save");
        let mut clash = saved[1].clone();
        clash.url = "https://a.example/".to_string();
        assert!(db.put_tab(&clash).is_err());

        let mut renamed = saved[1].clone();
        renamed.title = "B renamed".to_string();
        db.put_tab(&renamed).expect("put by key");
        assert_eq!(db.get_tab(&renamed.id).expect("get").expect("tab").title, "B renamed");
    }

    #[test]
    fn purge_by_group_removes_members_and_domain_group_tabs() {
        let (_dir, db) = open();
        let saved = db
            .save_tabs(&[
                TabDraft::new("https://a.example/1", "A1"),
                TabDraft::new("https://a.example/2", "A2"),
                TabDraft::new("https://b.example/", "B"),
            ])
            .expect("save");
        db.create_group("Dev").expect("group");
        db.assign_tab_to_group(&saved[2].id, "Dev").expect("assign");
        db.assign_tab_to_group(&saved[1].id, "Dev").expect("assign");

        assert_eq!(db.purge_tabs_by_group("a.example").expect("domain delete"), 1);
        assert_eq!(db.purge_tabs_by_group("Dev").expect("group delete"), 2);
        assert_eq!(db.count_tabs().expect("count"), 0);
        assert!(!db.delete_tab_by_id("missing").expect("idempotent delete"));
    }

    #[test]
    fn details_update_trims_and_reports_missing() {
        let (_dir, db) = open();
        let saved = db
            .save_tabs(&[TabDraft::new("https://a.example/", "A")])
            .expect("save");
        let tab = db
            .update_tab_details(&saved[0].id, Some("  Alpha "), Some(""))
            .expect("update");
        assert_eq!(tab.display_name.as_deref(), Some("Alpha"));
        assert!(tab.sort_key.is_none());
        assert!(db.update_tab_details("missing", None, None).is_err());
    }
}
