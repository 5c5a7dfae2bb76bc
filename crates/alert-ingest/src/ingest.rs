use crate::{identity, Alert, Event, LifecycleStore, Sink, Transition};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// IngestConfig is the emission policy of an Ingest.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Prefix of emitted event tags.
    pub tag: String,
    /// Emit an "active" event only for the first occurrence of an identity,
    /// rather than for every occurrence.
    pub first_only: bool,
    /// Duration after which an identity that's not observed again becomes
    /// inactive. None or zero disables expiry.
    pub ttl: Option<Duration>,
}

impl IngestConfig {
    fn ttl(&self) -> Option<Duration> {
        self.ttl.filter(|ttl| !ttl.is_zero())
    }

    /// Whether alert identities are tracked at all. Without a TTL and with
    /// every occurrence emitted, there's nothing to track and each alert
    /// passes through under the bare tag.
    pub fn tracks_identities(&self) -> bool {
        self.first_only || self.ttl().is_some()
    }
}

/// Outcome of ingesting one batch of alerts.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub received: usize,
    pub emitted: usize,
    pub skipped: usize,
}

/// Ingest processes batches of alerts and emits derived events to a Sink.
pub struct Ingest {
    tag: String,
    first_only: bool,
    // None if the configuration doesn't track identities.
    store: Option<LifecycleStore>,
    sink: Arc<dyn Sink>,
}

impl Ingest {
    /// Build an Ingest which emits into `sink`. When identities are tracked,
    /// this spawns a task which emits the transitions of the LifecycleStore
    /// in the order they occurred, and must be called within a tokio runtime.
    pub fn new(config: IngestConfig, sink: Arc<dyn Sink>) -> Self {
        if !config.tracks_identities() {
            return Self {
                tag: config.tag,
                first_only: false,
                store: None,
                sink,
            };
        }

        let (store, transitions) = LifecycleStore::new(config.ttl(), config.first_only);
        tokio::spawn(emit_transitions(
            transitions,
            format!("{}.active", config.tag),
            format!("{}.inactive", config.tag),
            sink.clone(),
        ));

        Self {
            tag: config.tag,
            first_only: config.first_only,
            store: Some(store),
            sink,
        }
    }

    /// Process `alerts` in order. Passthrough alerts are emitted directly,
    /// while alerts of tracked identities are handed to the LifecycleStore
    /// and emitted shortly after, in the order decided by the store.
    /// Alerts having malformed labels are logged and skipped.
    pub async fn ingest(&self, alerts: Vec<Alert>) -> Summary {
        let mut summary = Summary {
            received: alerts.len(),
            ..Default::default()
        };
        metrics::counter!("alerts_received").increment(alerts.len() as u64);

        for alert in alerts {
            let Some(store) = &self.store else {
                metrics::counter!("events_emitted", "kind" => "passthrough").increment(1);
                self.sink.emit(Event::new(&self.tag, alert));
                summary.emitted += 1;
                continue;
            };

            let id = match identity::derive(&alert) {
                Ok(id) => id,
                Err(error) => {
                    tracing::warn!(%error, "skipping alert with malformed labels");
                    metrics::counter!("alerts_skipped").increment(1);
                    summary.skipped += 1;
                    continue;
                }
            };

            let was_active = store.observe(id.clone(), alert).await;

            if was_active && self.first_only {
                tracing::debug!(%id, "suppressing repeat of active alert");
                continue;
            }
            summary.emitted += 1;
        }

        summary
    }
}

// Emit an event for each transition, "active" events with the observed alert
// and "inactive" events replaying the alert which activated the identity.
// Runs until the LifecycleStore is dropped.
async fn emit_transitions(
    mut transitions: mpsc::UnboundedReceiver<Transition>,
    active_tag: String,
    inactive_tag: String,
    sink: Arc<dyn Sink>,
) {
    while let Some(transition) = transitions.recv().await {
        let (kind, tag, alert) = match transition {
            Transition::Active { alert, .. } => ("active", &active_tag, alert),
            Transition::Inactive { id, alert } => {
                tracing::debug!(%id, tag = %inactive_tag, "emitting inactive alert");
                ("inactive", &inactive_tag, alert)
            }
        };
        metrics::counter!("events_emitted", "kind" => kind).increment(1);
        sink.emit(Event::new(tag, alert));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn alerts(v: serde_json::Value) -> Vec<Alert> {
        serde_json::from_value(v).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<(String, serde_json::Value)> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|event| (event.tag, serde_json::Value::Object(event.record)))
            .collect()
    }

    fn config(first_only: bool, ttl: Option<Duration>) -> IngestConfig {
        IngestConfig {
            tag: "alerts".to_string(),
            first_only,
            ttl,
        }
    }

    #[test]
    fn test_identity_tracking_modes() {
        let cases = [
            (false, None, false),
            (false, Some(Duration::ZERO), false),
            (true, None, true),
            (false, Some(Duration::from_secs(1)), true),
            (true, Some(Duration::from_secs(1)), true),
        ];
        for (first_only, ttl, expect) in cases {
            assert_eq!(
                config(first_only, ttl).tracks_identities(),
                expect,
                "first_only: {first_only} ttl: {ttl:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_passthrough_emits_every_alert_under_bare_tag() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ingest = Ingest::new(config(false, None), Arc::new(tx));

        let summary = ingest
            .ingest(alerts(json!([
                {"Labels": {"alertname": "A"}},
                {"Labels": {"alertname": "A"}},
                {"NoLabels": true},
                {"Labels": {"alertname": "B"}},
            ])))
            .await;

        assert_eq!(
            summary,
            Summary {
                received: 4,
                emitted: 4,
                skipped: 0
            }
        );
        insta::assert_json_snapshot!(drain(&mut rx), @r###"
        [
          [
            "alerts",
            {
              "Labels": {
                "alertname": "A"
              }
            }
          ],
          [
            "alerts",
            {
              "Labels": {
                "alertname": "A"
              }
            }
          ],
          [
            "alerts",
            {
              "NoLabels": true
            }
          ],
          [
            "alerts",
            {
              "Labels": {
                "alertname": "B"
              }
            }
          ]
        ]
        "###);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_only_with_ttl() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ingest = Ingest::new(
            config(true, Some(Duration::from_millis(200))),
            Arc::new(tx),
        );
        let batch = json!([
            {"Labels": {"alertname": "A", "job": "node"}},
            {"Labels": {"job": "node", "alertname": "A"}},
            {"Labels": {"alertname": "B", "job": "node"}},
            {"Labels": "malformed"},
            {"Labels": {"alertname": "A", "job": "node"}},
        ]);

        let summary = ingest.ingest(alerts(batch.clone())).await;
        assert_eq!(
            summary,
            Summary {
                received: 5,
                emitted: 2,
                skipped: 1
            }
        );
        tokio::time::sleep(Duration::from_millis(250)).await;

        // A and B expire at the same instant, in either order.
        let mut events = drain(&mut rx);
        events.sort_by_key(|(tag, record)| (tag.clone(), record.to_string()));

        insta::assert_json_snapshot!(events, @r###"
        [
          [
            "alerts.active",
            {
              "Labels": {
                "alertname": "A",
                "job": "node"
              }
            }
          ],
          [
            "alerts.active",
            {
              "Labels": {
                "alertname": "B",
                "job": "node"
              }
            }
          ],
          [
            "alerts.inactive",
            {
              "Labels": {
                "alertname": "A",
                "job": "node"
              }
            }
          ],
          [
            "alerts.inactive",
            {
              "Labels": {
                "alertname": "B",
                "job": "node"
              }
            }
          ]
        ]
        "###);

        // Once inactive, identities are emitted again.
        let summary = ingest.ingest(alerts(batch)).await;
        assert_eq!(summary.emitted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_emit_with_ttl() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ingest = Ingest::new(
            config(false, Some(Duration::from_millis(200))),
            Arc::new(tx),
        );
        let batch = json!([{"Labels": {"alertname": "A"}}]);

        for _ in 0..3 {
            ingest.ingest(alerts(batch.clone())).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let tags: Vec<String> = drain(&mut rx).into_iter().map(|(tag, _)| tag).collect();
        assert_eq!(
            tags,
            vec![
                "alerts.active",
                "alerts.active",
                "alerts.active",
                "alerts.inactive"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_only_without_ttl_never_expires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ingest = Ingest::new(config(true, None), Arc::new(tx));
        let batch = json!([{"Labels": {"alertname": "A"}}]);

        ingest.ingest(alerts(batch.clone())).await;
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(ingest.ingest(alerts(batch)).await.emitted, 0);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let tags: Vec<String> = drain(&mut rx).into_iter().map(|(tag, _)| tag).collect();
        assert_eq!(tags, vec!["alerts.active"]);
    }
}
