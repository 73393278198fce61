use super::groups::union_memberships;
use super::{
    delete_tab_rows, domain_of, fetch_tab_by_url, query_tabs, sync_legacy_group, write_memberships, Database,
    TAB_COLUMNS,
};
use crate::errors::AppResult;
use crate::models::{MergeDetail, NormalizationReport, NormalizationRule, TabRecord, TabSort};
use crate::normalization::RuleSet;
use rusqlite::params;
use std::collections::HashMap;

struct MergeGroup {
    normalized_url: String,
    members: Vec<TabRecord>,
}

impl Database {
    /// Merges active records whose urls normalize to the same value.
    ///
    /// Urls are grouped by the result of applying the rules until they stop
    /// changing, so rewritten urls are already stable on the next run. Urls
    /// the rules never settle on are left alone. Within a group the newest
    /// record survives (earliest insertion on a `saved_at` tie), absorbs the
    /// custom groups of the others and takes the normalized url. The rest are deleted outright. Running it again with the
    /// same rules merges nothing.
    pub fn apply_normalization_to_existing(&self, rules: &[NormalizationRule]) -> AppResult<NormalizationReport> {
        let (rule_set, skipped_rules) = RuleSet::compile(rules);
        let mut report = NormalizationReport {
            skipped_rules,
            ..NormalizationReport::default()
        };
        if rule_set.is_empty() {
            return Ok(report);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let tabs = query_tabs(
            &tx,
            &format!("SELECT {} FROM tabs ORDER BY {}", TAB_COLUMNS, TabSort::SavedAt.order_by()),
            &[],
        )?;

        let mut groups: Vec<MergeGroup> = Vec::new();
        let mut index_by_url: HashMap<String, usize> = HashMap::new();
        for tab in tabs {
            let normalized_url = match rule_set.normalize_to_fixpoint(&tab.url) {
                Some(url) => url,
                None => {
                    tracing::warn!(
                        tab_id = %tab.id,
                        url = %tab.url,
                        "normalization rules do not settle for url; leaving it unchanged"
                    );
                    tab.url.clone()
                }
            };
            match index_by_url.get(&normalized_url) {
                Some(&index) => groups[index].members.push(tab),
                None => {
                    index_by_url.insert(normalized_url.clone(), groups.len());
                    groups.push(MergeGroup {
                        normalized_url,
                        members: vec![tab],
                    });
                }
            }
        }

        for group in &groups {
            let Some((canonical, removed)) = group.members.split_first() else {
                continue;
            };
            if removed.is_empty() {
                continue;
            }
            let absorbed: Vec<String> = removed
                .iter()
                .flat_map(|tab| tab.custom_groups.iter().cloned())
                .collect();
            let merged_groups = union_memberships(&tx, &canonical.id, &absorbed)?;
            for tab in removed {
                delete_tab_rows(&tx, &tab.id)?;
            }
            write_memberships(&tx, &canonical.id, &merged_groups)?;

            report.merged_count += removed.len();
            report.details.push(MergeDetail {
                kept_url: group.normalized_url.clone(),
                removed_urls: removed.iter().map(|tab| tab.url.clone()).collect(),
            });
        }

        for group in &groups {
            let Some(canonical) = group.members.first() else {
                continue;
            };
            if canonical.url == group.normalized_url {
                continue;
            }
            if let Some(holder) = fetch_tab_by_url(&tx, &group.normalized_url)? {
                if holder.id != canonical.id {
                    tracing::warn!(
                        tab_id = %canonical.id,
                        url = %canonical.url,
                        normalized_url = %group.normalized_url,
                        holder_id = %holder.id,
                        "normalized url already held by another record; leaving url unchanged"
                    );
                    continue;
                }
            }
            tx.execute(
                "UPDATE tabs SET url = ?1, domain = ?2 WHERE id = ?3",
                params![group.normalized_url, domain_of(&group.normalized_url), canonical.id],
            )?;
            sync_legacy_group(&tx, &canonical.id)?;
            report.rewritten_count += 1;
        }
        tx.commit()?;

        tracing::info!(
            merged = report.merged_count,
            rewritten = report.rewritten_count,
            skipped_rules = report.skipped_rules.len(),
            "applied normalization rules"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Database;
    use crate::models::{NormalizationRule, TabDraft};
    use chrono::{Duration, Utc};

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("tabs.sqlite")).expect("db");
        (dir, db)
    }

    fn numeric_rule() -> NormalizationRule {
        NormalizationRule {
            id: "r1".to_string(),
            enabled: true,
            name: "strip ids".to_string(),
            pattern: r"^https://a\.com/(\d+)$".to_string(),
            replacement: "https://a.com/".to_string(),
        }
    }

    fn draft_at(url: &str, minutes_ago: i64) -> TabDraft {
        let mut draft = TabDraft::new(url, url);
        draft.saved_at = Some(Utc::now() - Duration::minutes(minutes_ago));
        draft
    }

    #[test]
    fn merges_into_single_record_at_normalized_url() {
        let (_dir, db) = open();
        let saved = db
            .save_tabs(&[draft_at("https://a.com/1", 10), draft_at("https://a.com/2", 5)])
            .expect("save");
        db.create_group("Old").expect("group");
        db.assign_tab_to_group(&saved[0].id, "Old").expect("assign");

        let report = db.apply_normalization_to_existing(&[numeric_rule()]).expect("normalize");
        assert_eq!(report.merged_count, 1);
        assert_eq!(report.rewritten_count, 1);
        assert_eq!(report.details.len(), 1);
        assert_eq!(report.details[0].kept_url, "https://a.com/");
        assert_eq!(report.details[0].removed_urls, vec!["https://a.com/1".to_string()]);

        let all = db.get_all_tabs().expect("all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, saved[1].id);
        assert_eq!(all[0].url, "https://a.com/");
        assert_eq!(all[0].custom_groups, vec!["Old".to_string()]);
    }

    #[test]
    fn second_run_merges_nothing() {
        let (_dir, db) = open();
        db.save_tabs(&[
            draft_at("https://a.com/1", 3),
            draft_at("https://a.com/2", 2),
            draft_at("https://a.com/3", 1),
            draft_at("https://b.com/1", 1),
        ])
        .expect("save");

        let first = db.apply_normalization_to_existing(&[numeric_rule()]).expect("first");
        assert_eq!(first.merged_count, 2);
        let second = db.apply_normalization_to_existing(&[numeric_rule()]).expect("second");
        assert_eq!(second.merged_count, 0);
        assert_eq!(second.rewritten_count, 0);
        assert_eq!(db.count_tabs().expect("count"), 2);
    }

    #[test]
    fn chained_rule_output_is_stable_on_second_run() {
        let (_dir, db) = open();
        db.save_tabs(&[
            draft_at("https://a.com/12", 3),
            draft_at("https://a.com/22", 2),
            draft_at("https://a.com/3", 1),
        ])
        .expect("save");
        let chained = NormalizationRule {
            id: "chain".to_string(),
            enabled: true,
            name: "drop leading digit".to_string(),
            pattern: r"^https://a\.com/\d(\d*)$".to_string(),
            replacement: "https://a.com/$1".to_string(),
        };

        let first = db
            .apply_normalization_to_existing(std::slice::from_ref(&chained))
            .expect("first");
        assert_eq!(first.merged_count, 2);
        let urls: Vec<String> = db.get_all_tabs().expect("all").into_iter().map(|tab| tab.url).collect();
        assert_eq!(urls, vec!["https://a.com/".to_string()]);

        let second = db.apply_normalization_to_existing(&[chained]).expect("second");
        assert_eq!(second.merged_count, 0);
        assert_eq!(second.rewritten_count, 0);
    }

    #[test]
    fn cycling_rules_leave_urls_untouched() {
        let (_dir, db) = open();
        db.save_tabs(&[draft_at("https://x.com/", 2), draft_at("https://y.com/", 1)])
            .expect("save");
        let rules = vec![
            NormalizationRule {
                id: "x".to_string(),
                enabled: true,
                name: "x to y".to_string(),
                pattern: r"^https://x\.com/$".to_string(),
                replacement: "https://y.com/".to_string(),
            },
            NormalizationRule {
                id: "y".to_string(),
                enabled: true,
                name: "y to x".to_string(),
                pattern: r"^https://y\.com/$".to_string(),
                replacement: "https://x.com/".to_string(),
            },
        ];

        let report = db.apply_normalization_to_existing(&rules).expect("normalize");
        assert_eq!(report.merged_count, 0);
        assert_eq!(report.rewritten_count, 0);
        assert_eq!(db.count_tabs().expect("count"), 2);
    }

    #[test]
    fn equal_saved_at_keeps_earliest_insertion() {
        let (_dir, db) = open();
        let at = Utc::now() - Duration::minutes(1);
        let mut first = TabDraft::new("https://a.com/7", "seven");
        first.saved_at = Some(at);
        let mut second = TabDraft::new("https://a.com/8", "eight");
        second.saved_at = Some(at);
        let saved = db.save_tabs(&[first, second]).expect("save");

        db.apply_normalization_to_existing(&[numeric_rule()]).expect("normalize");
        let all = db.get_all_tabs().expect("all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, saved[0].id);
    }

    #[test]
    fn broken_rule_is_reported_and_others_still_apply() {
        let (_dir, db) = open();
        db.save_tabs(&[draft_at("https://a.com/1", 2), draft_at("https://a.com/2", 1)])
            .expect("save");
        let broken = NormalizationRule {
            id: "bad".to_string(),
            enabled: true,
            name: "broken".to_string(),
            pattern: "(".to_string(),
            replacement: String::new(),
        };

        let report = db
            .apply_normalization_to_existing(&[broken, numeric_rule()])
            .expect("normalize");
        assert_eq!(report.skipped_rules.len(), 1);
        assert_eq!(report.merged_count, 1);
    }
}
