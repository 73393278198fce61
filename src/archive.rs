use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::link_checker::{HttpProbe, LinkChecker, LinkProbe};
use crate::models::{
    AppSettings, BatchOutcome, CheckProgress, CustomGroupMeta, DeleteOutcome, GeneratedPattern, LinkCategory,
    LinkCheckResult, LinkTarget, NormalizationReport, NormalizationRule, RuleIssue, TabDraft, TabRecord, TabSort,
    TrashedTab,
};
use crate::normalization;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

const STORE_FILE_NAME: &str = "tabs.sqlite";

/// Entry point for every archive operation.
///
/// Store operations are synchronous and serialize on the store's connection
/// lock. Link checking runs on the tokio runtime and is driven through the
/// async methods.
#[derive(Clone)]
pub struct ArchiveCore {
    db: Arc<Database>,
    settings: Arc<RwLock<AppSettings>>,
    checker: LinkChecker,
    data_dir: PathBuf,
}

impl ArchiveCore {
    pub fn new(data_dir: PathBuf, settings: AppSettings) -> AppResult<Arc<Self>> {
        settings.validate()?;
        let probe = HttpProbe::new()?;
        Self::with_probe(data_dir, settings, Arc::new(probe))
    }

    /// Opens the archive with a caller-supplied link probe.
    pub fn with_probe(data_dir: PathBuf, settings: AppSettings, probe: Arc<dyn LinkProbe>) -> AppResult<Arc<Self>> {
        settings.validate()?;
        let db = Arc::new(Database::new(&data_dir.join(STORE_FILE_NAME))?);
        let checker = LinkChecker::new(probe);
        for issue in normalization::validate_rules(&settings.normalization_rules) {
            tracing::warn!(rule_id = %issue.rule_id, error = %issue.message, "configured normalization rule is invalid");
        }
        Ok(Arc::new(Self {
            db,
            settings: Arc::new(RwLock::new(settings)),
            checker,
            data_dir,
        }))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn schema_version(&self) -> u32 {
        self.db.schema_version()
    }

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        self.settings
            .read()
            .map(|settings| settings.clone())
            .map_err(|_| AppError::Internal("settings lock poisoned".to_string()))
    }

    /// Replaces the settings used by later operations. A running link check
    /// keeps the concurrency it was started with.
    pub fn update_settings(&self, settings: AppSettings) -> AppResult<AppSettings> {
        settings.validate()?;
        let mut writer = self
            .settings
            .write()
            .map_err(|_| AppError::Internal("settings lock poisoned".to_string()))?;
        *writer = settings.clone();
        tracing::info!(
            retention_days = settings.retention_days,
            concurrency = settings.effective_concurrency(),
            rules = settings.normalization_rules.len(),
            "settings updated"
        );
        Ok(settings)
    }

    // Tabs

    pub fn get_all_tabs(&self) -> AppResult<Vec<TabRecord>> {
        self.db.get_all_tabs()
    }

    /// Lists tabs in the configured default order.
    pub fn list_tabs(&self) -> AppResult<Vec<TabRecord>> {
        let sort = self.get_settings()?.default_sort;
        self.db.list_tabs(sort)
    }

    pub fn list_tabs_sorted(&self, sort: TabSort) -> AppResult<Vec<TabRecord>> {
        self.db.list_tabs(sort)
    }

    pub fn get_tab(&self, id: &str) -> AppResult<Option<TabRecord>> {
        self.db.get_tab(id)
    }

    pub fn get_tab_by_url(&self, url: &str) -> AppResult<Option<TabRecord>> {
        self.db.get_tab_by_url(url)
    }

    pub fn search_tabs(&self, query: &str) -> AppResult<Vec<TabRecord>> {
        self.db.search_tabs(query)
    }

    pub fn count_tabs(&self) -> AppResult<u64> {
        self.db.count_tabs()
    }

    pub fn save_tabs(&self, drafts: &[TabDraft]) -> AppResult<Vec<TabRecord>> {
        self.db.save_tabs(drafts)
    }

    pub fn save_tabs_for_custom_group(&self, drafts: &[TabDraft], group: &str) -> AppResult<Vec<TabRecord>> {
        let group = group.trim();
        if group.is_empty() {
            return Err(AppError::InvalidInput("group name must not be empty".to_string()));
        }
        self.db.save_tabs_for_custom_group(drafts, group)
    }

    pub fn update_tab_details(
        &self,
        id: &str,
        display_name: Option<&str>,
        sort_key: Option<&str>,
    ) -> AppResult<TabRecord> {
        self.db.update_tab_details(id, display_name, sort_key)
    }

    /// Deletes a tab through the trash, or permanently when retention is off.
    pub fn delete_tab(&self, id: &str) -> AppResult<DeleteOutcome> {
        let retention_days = self.get_settings()?.retention_days;
        self.db.move_to_trash(id, retention_days)
    }

    pub fn delete_tabs_by_group(&self, name: &str) -> AppResult<BatchOutcome> {
        let ids = self.db.tab_ids_in_group(name)?;
        self.move_many_to_trash(&ids)
    }

    /// Wipes the whole archive and drops any link check session.
    pub async fn reset(&self) -> AppResult<()> {
        self.checker.reset().await;
        self.db.clear_all()
    }

    // Groups

    pub fn list_groups(&self) -> AppResult<Vec<CustomGroupMeta>> {
        self.db.list_groups()
    }

    pub fn create_custom_group(&self, name: &str) -> AppResult<CustomGroupMeta> {
        self.db.create_group(name)
    }

    pub fn rename_custom_group(&self, old_name: &str, new_name: &str) -> AppResult<usize> {
        self.db.rename_group(old_name, new_name)
    }

    pub fn delete_custom_group(&self, name: &str) -> AppResult<usize> {
        self.db.delete_group(name)
    }

    pub fn update_custom_group_order(&self, names: &[String]) -> AppResult<Vec<CustomGroupMeta>> {
        self.db.update_group_order(names)
    }

    pub fn assign_tab_to_group(&self, tab_id: &str, name: &str) -> AppResult<TabRecord> {
        self.db.assign_tab_to_group(tab_id, name)
    }

    pub fn unassign_tab(&self, tab_id: &str, name: Option<&str>) -> AppResult<TabRecord> {
        self.db.unassign_tab(tab_id, name)
    }

    pub fn set_group_color(&self, name: &str, color: Option<&str>) -> AppResult<CustomGroupMeta> {
        self.db.set_group_color(name, color)
    }

    pub fn set_group_sort_override(&self, name: &str, sort: Option<TabSort>) -> AppResult<CustomGroupMeta> {
        self.db.set_group_sort_override(name, sort)
    }

    pub fn list_group_tabs(&self, name: &str) -> AppResult<Vec<TabRecord>> {
        let fallback = self.get_settings()?.default_sort;
        self.db.list_group_tabs(name, fallback)
    }

    // Trash

    pub fn move_to_trash(&self, id: &str) -> AppResult<DeleteOutcome> {
        self.delete_tab(id)
    }

    pub fn move_many_to_trash(&self, ids: &[String]) -> AppResult<BatchOutcome> {
        let retention_days = self.get_settings()?.retention_days;
        Ok(self.db.move_many_to_trash(ids, retention_days))
    }

    pub fn restore_from_trash(&self, id: &str) -> AppResult<TabRecord> {
        self.db.restore_from_trash(id)
    }

    pub fn restore_many(&self, ids: &[String]) -> BatchOutcome {
        self.db.restore_many(ids)
    }

    pub fn delete_from_trash(&self, id: &str) -> AppResult<bool> {
        self.db.delete_from_trash(id)
    }

    pub fn delete_many_from_trash(&self, ids: &[String]) -> BatchOutcome {
        self.db.delete_many_from_trash(ids)
    }

    pub fn empty_trash(&self) -> AppResult<usize> {
        self.db.empty_trash()
    }

    pub fn get_trashed_tabs(&self) -> AppResult<Vec<TrashedTab>> {
        self.db.get_trashed_tabs()
    }

    pub fn get_trash_count(&self) -> AppResult<u64> {
        self.db.get_trash_count()
    }

    /// Purges trash entries older than the configured retention window.
    pub fn run_trash_sweep(&self) -> AppResult<usize> {
        let retention_days = self.get_settings()?.retention_days;
        let removed = self.db.delete_expired_trash(retention_days, Utc::now())?;
        tracing::info!(retention_days, removed, "trash sweep finished");
        Ok(removed)
    }

    // Normalization

    pub fn apply_url_normalization(&self, url: &str) -> AppResult<String> {
        let rules = self.get_settings()?.normalization_rules;
        Ok(normalization::apply_url_normalization(url, &rules))
    }

    pub fn validate_rules(&self, rules: &[NormalizationRule]) -> Vec<RuleIssue> {
        normalization::validate_rules(rules)
    }

    pub fn generate_regex_from_urls(&self, urls: &[String]) -> AppResult<GeneratedPattern> {
        normalization::generate_regex_from_urls(urls)
    }

    /// Merges existing records using the configured rules.
    pub fn apply_normalization_to_existing(&self) -> AppResult<NormalizationReport> {
        let rules = self.get_settings()?.normalization_rules;
        self.db.apply_normalization_to_existing(&rules)
    }

    pub fn apply_normalization_with_rules(&self, rules: &[NormalizationRule]) -> AppResult<NormalizationReport> {
        self.db.apply_normalization_to_existing(rules)
    }

    // Link checking

    /// Starts checking every active tab as of now, with the concurrency and
    /// probe timeout currently configured.
    pub async fn start_link_check(&self) -> AppResult<CheckProgress> {
        let settings = self.get_settings()?;
        let probe_timeout = Duration::from_millis(settings.probe_timeout_ms);
        let targets = self
            .db
            .get_all_tabs()?
            .into_iter()
            .map(|tab| LinkTarget {
                tab_id: tab.id,
                url: tab.url,
            })
            .collect();
        self.checker
            .start(targets, settings.effective_concurrency(), probe_timeout)
            .await
    }

    pub async fn pause_link_check(&self) -> AppResult<CheckProgress> {
        self.checker.pause().await
    }

    pub async fn resume_link_check(&self) -> AppResult<CheckProgress> {
        self.checker.resume().await
    }

    pub async fn cancel_link_check(&self) -> AppResult<CheckProgress> {
        self.checker.cancel().await
    }

    pub fn link_check_progress(&self) -> CheckProgress {
        self.checker.progress()
    }

    pub fn subscribe_link_check(&self) -> watch::Receiver<CheckProgress> {
        self.checker.subscribe()
    }

    pub async fn wait_for_link_check(&self) -> AppResult<CheckProgress> {
        self.checker.wait_until_settled().await
    }

    pub async fn link_check_results(&self) -> Vec<LinkCheckResult> {
        self.checker.results().await
    }

    pub async fn link_check_results_by_category(&self, category: LinkCategory) -> Vec<LinkCheckResult> {
        self.checker.results_by_category(category).await
    }

    /// Deletes every checked tab in `category` through the normal trash path.
    pub async fn trash_links_by_category(&self, category: LinkCategory) -> AppResult<BatchOutcome> {
        let ids: Vec<String> = self
            .checker
            .results_by_category(category)
            .await
            .into_iter()
            .map(|result| result.tab_id)
            .collect();
        let outcome = self.move_many_to_trash(&ids)?;
        tracing::info!(
            category = ?category,
            trashed = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "trashed links by category"
        );
        Ok(outcome)
    }
}
