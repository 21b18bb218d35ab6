//! Headless dashboard: the consumer side of the pipeline.
//!
//! Renders nothing itself. It pulls history from the repository on an
//! interval, follows the latest readings through a repository subscription
//! and reports connection state, all through `tracing`.

pub mod alerts;
pub mod stats;

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DashboardConfig;
use crate::error::PersistenceError;
use crate::mqtt::ConnectionState;
use crate::persistence::{ReadingRepository, Subscription};
use crate::reading::SensorReading;
use alerts::{Alert, Thresholds};
use stats::{Metric, ReadingStats, Trend};

#[derive(Debug, Clone, PartialEq)]
pub struct HistorySnapshot {
    /// All readings ever persisted
    pub total: u64,
    pub window: ReadingStats,
    pub window_start: DateTime<Utc>,
}

/// What the live panel shows for the newest reading.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveView {
    pub latest: SensorReading,
    pub trends: Vec<(Metric, Trend)>,
    pub alerts: Vec<Alert>,
}

impl LiveView {
    /// Builds the view from readings ordered newest-first.
    pub fn from_recent(recent: &[SensorReading], thresholds: &Thresholds) -> Option<Self> {
        let latest = recent.first()?;
        let trends = recent
            .get(1)
            .map(|previous| Trend::all(previous, latest))
            .unwrap_or_default();
        Some(Self {
            latest: latest.clone(),
            trends,
            alerts: thresholds.alerts(latest),
        })
    }

    pub fn trend_line(&self) -> String {
        self.trends
            .iter()
            .map(|(metric, trend)| format!("{metric} {}", trend.arrow()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub struct Dashboard<R> {
    repository: R,
    config: DashboardConfig,
}

impl<R: ReadingRepository + Clone> Dashboard<R> {
    pub fn new(repository: R, config: DashboardConfig) -> Self {
        Self { repository, config }
    }

    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<HistorySnapshot, PersistenceError> {
        // Windows reaching past the representable range cover the whole history.
        let window_start = i64::try_from(self.config.window_hours)
            .ok()
            .and_then(TimeDelta::try_hours)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let window = self.repository.since(window_start).await?;
        let total = self.repository.count().await?;
        Ok(HistorySnapshot {
            total,
            window: ReadingStats::from_readings(&window),
            window_start,
        })
    }

    /// Periodically logs history statistics until `cancel` fires.
    pub fn spawn_refresher(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(self.config.refresh_secs.max(1)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.refresh(Utc::now()).await {
                    Ok(snapshot) => info!(
                        total = snapshot.total,
                        window_hours = self.config.window_hours,
                        "history: {}",
                        snapshot.window
                    ),
                    Err(e) => error!("history refresh failed: {}", e),
                }
            }
        })
    }

    /// Follows the newest readings and reports trends and alerts on every change.
    pub fn follow_recent(&self) -> Subscription {
        let thresholds = self.config.thresholds.clone();
        self.repository
            .subscribe(self.config.recent_count.max(2), move |recent| {
                let Some(view) = LiveView::from_recent(&recent, &thresholds) else {
                    return;
                };
                info!(trends = %view.trend_line(), "latest stored: {}", view.latest);
                for alert in &view.alerts {
                    warn!("alert: {}", alert);
                }
            })
    }
}

/// Logs connection state transitions, including the retry countdown.
pub async fn report_connection(
    mut states: mpsc::UnboundedReceiver<ConnectionState>,
    max_attempts: u32,
) {
    while let Some(state) = states.recv().await {
        match &state {
            ConnectionState::Reconnecting { attempt, .. } => {
                warn!(attempt, max_attempts, "broker {}", state)
            }
            ConnectionState::Failed => error!("broker connection failed, not retrying"),
            ConnectionState::Lost => warn!("broker connection lost"),
            _ => info!("broker {}", state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryRepository;
    use crate::reading::fixtures::{reading, reading_at};

    #[tokio::test]
    async fn refresh_covers_configured_window() {
        let repository = MemoryRepository::new();
        let now = Utc::now();
        repository
            .create(reading_at(10.0, now - chrono::Duration::hours(48)))
            .await
            .unwrap();
        repository
            .create(reading_at(20.0, now - chrono::Duration::hours(3)))
            .await
            .unwrap();
        repository
            .create(reading_at(22.0, now - chrono::Duration::hours(1)))
            .await
            .unwrap();

        let dashboard = Dashboard::new(repository, DashboardConfig::default());
        let snapshot = dashboard.refresh(now).await.unwrap();

        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.window.samples, 2);
        assert_eq!(snapshot.window.get(Metric::Temperature).unwrap().mean, 21.0);
    }

    #[tokio::test]
    async fn oversized_window_covers_all_history() {
        let repository = MemoryRepository::new();
        let now = Utc::now();
        repository
            .create(reading_at(18.0, now - chrono::Duration::days(3650)))
            .await
            .unwrap();
        repository.create(reading_at(20.0, now)).await.unwrap();

        let config = DashboardConfig {
            window_hours: 10_000_000_000,
            ..DashboardConfig::default()
        };
        let snapshot = Dashboard::new(repository, config).refresh(now).await.unwrap();

        assert_eq!(snapshot.window_start, DateTime::<Utc>::MIN_UTC);
        assert_eq!(snapshot.window.samples, 2);
    }

    #[test]
    fn live_view_needs_two_readings_for_trends() {
        let thresholds = Thresholds::default();
        assert!(LiveView::from_recent(&[], &thresholds).is_none());

        let single = LiveView::from_recent(&[reading(21.0)], &thresholds).unwrap();
        assert!(single.trends.is_empty());

        let mut hot = reading(31.0);
        hot.status = "Warning".into();
        let view = LiveView::from_recent(&[hot, reading(21.0)], &thresholds).unwrap();
        assert_eq!(view.trends[0], (Metric::Temperature, Trend::Rising));
        assert_eq!(view.alerts.len(), 1);
        assert!(view.trend_line().starts_with("temperature ↑"));
    }
}
