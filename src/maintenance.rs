use crate::archive::ArchiveCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const SECONDS_PER_HOUR: u64 = 3600;

/// Runs the trash sweep once shortly after startup and then on a fixed
/// interval. Timing is read from the settings current at spawn time.
pub fn spawn_trash_sweeper(core: Arc<ArchiveCore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (startup_delay, period) = match core.get_settings() {
            Ok(settings) => (
                Duration::from_secs(settings.sweep_startup_delay_secs),
                Duration::from_secs(settings.sweep_interval_hours.max(1) * SECONDS_PER_HOUR),
            ),
            Err(error) => {
                tracing::warn!(error = %error, "trash sweeper could not read settings");
                return;
            }
        };

        tokio::time::sleep(startup_delay).await;
        if let Err(error) = core.run_trash_sweep() {
            tracing::warn!(error = %error, "startup trash sweep failed");
        }

        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            if let Err(error) = core.run_trash_sweep() {
                tracing::warn!(error = %error, "trash sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::spawn_trash_sweeper;
    use crate::archive::ArchiveCore;
    use crate::link_checker::{LinkProbe, ProbeOutcome};
    use crate::models::{AppSettings, TabDraft};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct NoProbe;

    #[async_trait]
    impl LinkProbe for NoProbe {
        async fn probe(&self, _url: &str) -> ProbeOutcome {
            ProbeOutcome::Status(200)
        }
    }

    #[tokio::test]
    async fn startup_sweep_purges_expired_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = AppSettings {
            retention_days: 7,
            sweep_startup_delay_secs: 0,
            ..AppSettings::default()
        };
        let core = ArchiveCore::with_probe(dir.path().to_path_buf(), settings, Arc::new(NoProbe)).expect("core");
        let saved = core
            .save_tabs(&[TabDraft::new("https://old.example/", "Old")])
            .expect("save");
        core.delete_tab(&saved[0].id).expect("trash");

        let conn = rusqlite::Connection::open(core.data_dir().join("tabs.sqlite")).expect("raw connection");
        conn.execute(
            "UPDATE trashed_tabs SET trashed_at = '2000-01-01T00:00:00.000Z'",
            [],
        )
        .expect("backdate");
        drop(conn);

        let handle = spawn_trash_sweeper(core.clone());
        for _ in 0..50 {
            if core.get_trash_count().expect("count") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(core.get_trash_count().expect("count"), 0);
        handle.abort();
    }
}
