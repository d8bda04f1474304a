//! Delivers queued after-webhook notifications.
//!
//! A round claims a FIFO batch in one statement, delivers it with bounded
//! concurrency, waits for every delivery, then writes each outcome partition in one
//! statement. Rows only ever move from pending to delivered or failed.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::DispatcherConfig;
use crate::core::error::CoreResult;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::outbound::{WebhookClient, is_loopback_url};
use crate::core::store::types::{NotificationRecord, NotificationStatus};
use crate::core::store::{SystemStore, new_id};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub reaped: usize,
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct NotificationDispatcher {
    round: Round,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl NotificationDispatcher {
    pub fn new(store: SystemStore, config: DispatcherConfig) -> CoreResult<Self> {
        let client = WebhookClient::new(Duration::from_secs(config.timeout_secs), config.max_response_bytes)?;
        Ok(Self {
            round: Round {
                store,
                client,
                config,
                loopback_guard: true,
            },
            cancel: CancellationToken::new(),
            worker: None,
        })
    }

    #[cfg(test)]
    fn without_loopback_guard(mut self) -> Self {
        self.round.loopback_guard = false;
        self
    }

    /// One full round: reap stale claims, claim, deliver, record.
    pub async fn run_round(&self) -> CoreResult<DispatchReport> {
        self.round.run().await
    }
}

#[derive(Clone)]
struct Round {
    store: SystemStore,
    client: WebhookClient,
    config: DispatcherConfig,
    loopback_guard: bool,
}

impl Round {
    async fn run(&self) -> CoreResult<DispatchReport> {
        let mut report = DispatchReport::default();

        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(self.config.stale_claim_secs as i64);
        report.reaped = self
            .store
            .reap_stale_claims(&cutoff.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .await?;
        if report.reaped > 0 {
            warn!("Failed {} notifications abandoned by an earlier claim", report.reaped);
        }

        let claim_id = new_id();
        report.claimed = self
            .store
            .claim_notifications(&claim_id, self.config.batch_size.max(1))
            .await?;
        if report.claimed == 0 {
            return Ok(report);
        }
        let rows = self.store.claimed_notifications(&claim_id).await?;
        debug!("Claim {} holds {} notifications", claim_id, rows.len());

        let sem = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut join_set = JoinSet::new();
        for row in rows {
            let permit = match sem.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Delivery semaphore closed: {}", e);
                    break;
                }
            };
            let this = self.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let ok = this.deliver(&row).await;
                (row.id, ok)
            });
        }

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((id, true)) => delivered.push(id),
                Ok((id, false)) => failed.push(id),
                // left claimed; the reaper fails it once the claim goes stale
                Err(e) => error!("Delivery task aborted: {}", e),
            }
        }

        report.delivered = self
            .store
            .mark_notifications(&delivered, NotificationStatus::Delivered)
            .await?;
        report.failed = self
            .store
            .mark_notifications(&failed, NotificationStatus::Failed)
            .await?;
        info!(
            "Dispatch round: {} claimed, {} delivered, {} failed",
            report.claimed, report.delivered, report.failed
        );
        Ok(report)
    }

    async fn deliver(&self, row: &NotificationRecord) -> bool {
        if self.loopback_guard && is_loopback_url(&row.url) {
            warn!("Refusing to deliver notification {} to loopback url {}", row.id, row.url);
            return false;
        }
        let payload: Value = match serde_json::from_str(&row.data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Notification {} has an unreadable payload: {}", row.id, e);
                return false;
            }
        };
        match self.client.send(&row.method, &row.url, &payload).await {
            Ok(resp) if (200..300).contains(&resp.status) => {
                if !self.config.require_echo {
                    return true;
                }
                let echoed = serde_json::from_slice::<Value>(&resp.body).ok();
                if echoed.as_ref() == Some(&payload) {
                    true
                } else {
                    warn!("Notification {}: response did not echo the payload", row.id);
                    false
                }
            }
            Ok(resp) => {
                warn!("Notification {} to {} answered {}", row.id, row.url, resp.status);
                false
            }
            Err(e) => {
                warn!("Notification {} to {} failed: {}", row.id, row.url, e);
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for NotificationDispatcher {
    async fn on_start(&mut self) -> Result<()> {
        if !self.round.config.enabled {
            info!("Notification dispatcher disabled");
            return Ok(());
        }
        let round = self.round.clone();
        let cancel = self.cancel.clone();
        let period = Duration::from_secs(round.config.interval_secs.max(1));
        info!("Notification dispatcher running every {:?}", period);

        self.worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = round.run().await {
                            error!("Dispatch round failed: {}", e);
                        }
                    }
                }
            }
            debug!("Notification dispatcher stopped");
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            worker.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;
    use crate::core::store::types::{NewNotification, Phase};
    use axum::{Json, Router, http::StatusCode, routing::post};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn notification(url: &str) -> NewNotification {
        NewNotification {
            project_id: "p1".into(),
            target: "orders".into(),
            method: "POST".into(),
            url: url.into(),
            phase: Phase::After,
            action: "create".into(),
            data: json!({"target": "orders", "action": "after_create", "data": [{"id": "o1"}]}),
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn counting(status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/hook",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    status
                }
            }),
        );
        (format!("{}/hook", serve(app).await), hits)
    }

    fn status_of(record: &NotificationRecord) -> NotificationStatus {
        NotificationStatus::from_code(record.status).unwrap()
    }

    #[tokio::test]
    async fn loopback_targets_fail_without_a_call() {
        let (store, _dir) = test_store().await;
        let (url, hits) = counting(StatusCode::OK).await;
        assert!(url.contains("://127.0.0.1"));
        let id = store.enqueue_notification(&notification(&url)).await.unwrap();

        let dispatcher = NotificationDispatcher::new(store.clone(), DispatcherConfig::default()).unwrap();
        let report = dispatcher.run_round().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        let row = store.find_notification(&id).await.unwrap().unwrap();
        assert_eq!(status_of(&row), NotificationStatus::Failed);
    }

    #[tokio::test]
    async fn partitions_outcomes_by_status() {
        let (store, _dir) = test_store().await;
        let (ok_url, ok_hits) = counting(StatusCode::NO_CONTENT).await;
        let (bad_url, _) = counting(StatusCode::SERVICE_UNAVAILABLE).await;
        let good = store.enqueue_notification(&notification(&ok_url)).await.unwrap();
        let bad = store.enqueue_notification(&notification(&bad_url)).await.unwrap();

        let dispatcher = NotificationDispatcher::new(store.clone(), DispatcherConfig::default())
            .unwrap()
            .without_loopback_guard();
        let report = dispatcher.run_round().await.unwrap();
        assert_eq!((report.delivered, report.failed), (1, 1));
        assert_eq!(ok_hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            status_of(&store.find_notification(&good).await.unwrap().unwrap()),
            NotificationStatus::Delivered
        );
        assert_eq!(
            status_of(&store.find_notification(&bad).await.unwrap().unwrap()),
            NotificationStatus::Failed
        );

        // terminal rows are never picked up again
        let again = dispatcher.run_round().await.unwrap();
        assert_eq!(again.claimed, 0);
        assert_eq!(ok_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn echo_check_requires_the_payload_back() {
        let (store, _dir) = test_store().await;
        let echo = serve(Router::new().route("/hook", post(|Json(v): Json<Value>| async move { Json(v) }))).await;
        let mute = serve(Router::new().route("/hook", post(|| async { Json(json!({"ok": true})) }))).await;
        let echoed = store.enqueue_notification(&notification(&format!("{}/hook", echo))).await.unwrap();
        let other = store.enqueue_notification(&notification(&format!("{}/hook", mute))).await.unwrap();

        let config = DispatcherConfig {
            require_echo: true,
            ..DispatcherConfig::default()
        };
        let dispatcher = NotificationDispatcher::new(store.clone(), config).unwrap().without_loopback_guard();
        dispatcher.run_round().await.unwrap();
        assert_eq!(
            status_of(&store.find_notification(&echoed).await.unwrap().unwrap()),
            NotificationStatus::Delivered
        );
        assert_eq!(
            status_of(&store.find_notification(&other).await.unwrap().unwrap()),
            NotificationStatus::Failed
        );
    }

    #[tokio::test]
    async fn batch_size_bounds_a_round() {
        let (store, _dir) = test_store().await;
        for _ in 0..3 {
            store.enqueue_notification(&notification("http://localhost/hook")).await.unwrap();
        }
        let config = DispatcherConfig {
            batch_size: 2,
            ..DispatcherConfig::default()
        };
        let dispatcher = NotificationDispatcher::new(store, config).unwrap();
        assert_eq!(dispatcher.run_round().await.unwrap().claimed, 2);
        assert_eq!(dispatcher.run_round().await.unwrap().claimed, 1);
    }

    #[tokio::test]
    async fn lifecycle_start_and_shutdown() {
        let (store, _dir) = test_store().await;
        let config = DispatcherConfig {
            interval_secs: 1,
            ..DispatcherConfig::default()
        };
        let mut dispatcher = NotificationDispatcher::new(store, config).unwrap();
        dispatcher.on_start().await.unwrap();
        dispatcher.on_shutdown().await.unwrap();
        assert!(dispatcher.worker.is_none());
    }
}
