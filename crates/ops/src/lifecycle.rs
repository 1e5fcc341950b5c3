//! Stream lifecycle orchestration: the four user-facing operations.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use arcane_core::{DiscoveryError, Phase, StreamError};

use crate::{PhaseWait, SettingsDiscoverer, StreamOperator};

/// Composes discovery and the stream operator into the suspend, resume,
/// backfill and restart operations.
///
/// Coordinates are re-discovered on every call; nothing is cached across
/// operations, and each operation spawns at most one background wait whose
/// result is received on every exit path.
pub struct StreamLifecycle<D, O> {
    discoverer: D,
    operator: O,
    namespace: String,
}

impl<D, O> StreamLifecycle<D, O>
where
    D: SettingsDiscoverer,
    O: StreamOperator,
{
    pub fn new(discoverer: D, operator: O, namespace: impl Into<String>) -> Self {
        Self { discoverer, operator, namespace: namespace.into() }
    }

    /// Suspend the stream. Returns as soon as the patch is accepted; the
    /// phase transition is intentionally not confirmed.
    pub async fn suspend(&self, id: &str) -> Result<(), StreamError> {
        let ns = &self.namespace;
        let coords = self
            .discoverer
            .discover_from_run(id, ns)
            .await
            .map_err(|source| StreamError::Discovery { id: id.into(), source })?;
        debug!(id = %id, coords = %coords, "discovered stream coordinates");
        self.operator
            .suspend(id, ns, &coords)
            .await
            .map_err(|source| StreamError::Mutation { op: "suspend", id: id.into(), source })
    }

    /// Resume the stream; the caller names the stream class explicitly.
    pub async fn resume(&self, id: &str, stream_class: &str) -> Result<(), StreamError> {
        let ns = &self.namespace;
        info!(id = %id, class = %stream_class, "resuming stream");
        let coords = self
            .discoverer
            .discover_from_stream_class(stream_class, ns)
            .await
            .map_err(|source| StreamError::Discovery { id: id.into(), source })?;
        self.operator
            .resume(id, ns, &coords)
            .await
            .map_err(|source| StreamError::Mutation { op: "resume", id: id.into(), source })
    }

    /// Restart the stream in backfill mode.
    ///
    /// Discovery goes through the run resource; when that is absent the
    /// stream is most likely suspended and the caller-supplied stream class
    /// is used instead. With `watch`, the phase subscription is established
    /// before the patch goes out so a fast transition cannot complete
    /// unobserved, and the call only returns once the stream is Running
    /// again.
    pub async fn backfill(
        &self,
        token: &CancellationToken,
        id: &str,
        stream_class: Option<&str>,
        watch: bool,
    ) -> Result<(), StreamError> {
        let ns = &self.namespace;
        info!(id = %id, watch, "restarting stream in backfill mode");
        let coords = match self.discoverer.discover_from_run(id, ns).await {
            Ok(coords) => coords,
            Err(DiscoveryError::NotFound) => {
                let class = stream_class
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| StreamError::MissingStreamClass { id: id.into() })?;
                warn!(id = %id, class = %class, "run not found, discovering via stream class");
                self.discoverer
                    .discover_from_stream_class(class, ns)
                    .await
                    .map_err(|source| StreamError::Discovery { id: id.into(), source })?
            }
            Err(source) => return Err(StreamError::Discovery { id: id.into(), source }),
        };
        debug!(id = %id, coords = %coords, "discovered stream coordinates");

        let pending = if watch {
            self.operator
                .watch_phase(token, Phase::Backfill, id, ns, &coords)
                .await
                .map_err(|source| StreamError::Wait { phase: Phase::Backfill, id: id.into(), source })?
        } else {
            PhaseWait::ready()
        };

        if let Err(source) = self.operator.backfill(id, ns, &coords).await {
            // The pending wait still gets its one receive; the mutation
            // error wins over whatever it reports.
            let _ = pending.done().await;
            return Err(StreamError::Mutation { op: "backfill", id: id.into(), source });
        }

        pending
            .done()
            .await
            .map_err(|source| StreamError::Wait { phase: Phase::Backfill, id: id.into(), source })?;

        if watch {
            info!(id = %id, "waiting for stream to settle after backfill");
            self.operator
                .watch_phase(token, Phase::Running, id, ns, &coords)
                .await
                .map_err(|source| StreamError::Wait { phase: Phase::Running, id: id.into(), source })?
                .done()
                .await
                .map_err(|source| StreamError::Wait { phase: Phase::Running, id: id.into(), source })?;
        }
        Ok(())
    }

    /// Restart the stream in streaming mode: suspend, confirm Suspended,
    /// resume, and optionally confirm Running. Any failure is terminal; no
    /// step is retried or reversed.
    pub async fn restart(
        &self,
        token: &CancellationToken,
        id: &str,
        wait: bool,
    ) -> Result<(), StreamError> {
        let ns = &self.namespace;
        info!(id = %id, wait, "restarting stream");
        let coords = self
            .discoverer
            .discover_from_run(id, ns)
            .await
            .map_err(|source| StreamError::Discovery { id: id.into(), source })?;
        debug!(id = %id, coords = %coords, "discovered stream coordinates");

        let pending = self
            .operator
            .watch_phase(token, Phase::Suspended, id, ns, &coords)
            .await
            .map_err(|source| StreamError::Wait { phase: Phase::Suspended, id: id.into(), source })?;

        if let Err(source) = self.operator.suspend(id, ns, &coords).await {
            let _ = pending.done().await;
            return Err(StreamError::Mutation { op: "suspend", id: id.into(), source });
        }

        pending
            .done()
            .await
            .map_err(|source| StreamError::Wait { phase: Phase::Suspended, id: id.into(), source })?;

        self.operator
            .resume(id, ns, &coords)
            .await
            .map_err(|source| StreamError::Mutation { op: "resume", id: id.into(), source })?;

        if wait {
            self.operator
                .watch_phase(token, Phase::Running, id, ns, &coords)
                .await
                .map_err(|source| StreamError::Wait { phase: Phase::Running, id: id.into(), source })?
                .done()
                .await
                .map_err(|source| StreamError::Wait { phase: Phase::Running, id: id.into(), source })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_patch;
    use arcane_core::{
        MutationError, ResourceCoordinates, WaitError, STATE_ANNOTATION, STATE_SUSPENDED,
    };
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn scenario_coords() -> ResourceCoordinates {
        ResourceCoordinates::new("streaming.sneaksanddata.com", "v1beta1", "streams")
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        annotations: Mutex<BTreeMap<String, String>>,
    }

    impl Recorder {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn apply(&self, body: &Value) {
            let mut annotations = self.annotations.lock().unwrap();
            match &body["metadata"]["annotations"][STATE_ANNOTATION] {
                Value::String(v) => {
                    annotations.insert(STATE_ANNOTATION.to_string(), v.clone());
                }
                Value::Null => {
                    annotations.remove(STATE_ANNOTATION);
                }
                other => panic!("unexpected directive {other:?}"),
            }
        }

        fn state(&self) -> Option<String> {
            self.annotations.lock().unwrap().get(STATE_ANNOTATION).cloned()
        }
    }

    enum RunOutcome {
        Found,
        NotFound,
        Fails,
    }

    struct MockDiscoverer {
        rec: Arc<Recorder>,
        run: RunOutcome,
    }

    #[async_trait::async_trait]
    impl SettingsDiscoverer for MockDiscoverer {
        async fn discover_from_run(
            &self,
            id: &str,
            namespace: &str,
        ) -> Result<ResourceCoordinates, DiscoveryError> {
            self.rec.record(format!("discover_run:{namespace}/{id}"));
            match self.run {
                RunOutcome::Found => Ok(scenario_coords()),
                RunOutcome::NotFound => Err(DiscoveryError::NotFound),
                RunOutcome::Fails => Err(DiscoveryError::ReadFailure("boom".into())),
            }
        }

        async fn discover_from_stream_class(
            &self,
            class_id: &str,
            namespace: &str,
        ) -> Result<ResourceCoordinates, DiscoveryError> {
            self.rec.record(format!("discover_class:{namespace}/{class_id}"));
            Ok(scenario_coords())
        }
    }

    #[derive(Default)]
    struct MockOperator {
        rec: Arc<Recorder>,
        fail_op: Option<&'static str>,
        wait_fails: bool,
        delayed_wait: bool,
    }

    impl MockOperator {
        fn mutate(
            &self,
            op: &'static str,
            id: &str,
            namespace: &str,
            coords: &ResourceCoordinates,
            directive: Option<&str>,
        ) -> Result<(), MutationError> {
            self.rec.record(format!("{op}:{namespace}/{}/{id}", coords.plural()));
            if self.fail_op == Some(op) {
                return Err(MutationError::PatchRejected("denied".into()));
            }
            self.rec.apply(&state_patch(directive));
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl StreamOperator for MockOperator {
        async fn suspend(
            &self,
            id: &str,
            namespace: &str,
            coords: &ResourceCoordinates,
        ) -> Result<(), MutationError> {
            self.mutate("suspend", id, namespace, coords, Some(STATE_SUSPENDED))
        }

        async fn resume(
            &self,
            id: &str,
            namespace: &str,
            coords: &ResourceCoordinates,
        ) -> Result<(), MutationError> {
            self.mutate("resume", id, namespace, coords, None)
        }

        async fn backfill(
            &self,
            id: &str,
            namespace: &str,
            coords: &ResourceCoordinates,
        ) -> Result<(), MutationError> {
            self.mutate("backfill", id, namespace, coords, Some("reload-requested"))
        }

        async fn watch_phase(
            &self,
            _token: &CancellationToken,
            target: Phase,
            _id: &str,
            _namespace: &str,
            _coords: &ResourceCoordinates,
        ) -> Result<PhaseWait, WaitError> {
            self.rec.record(format!("watch:{}", target.as_str()));
            let result = if self.wait_fails { Err(WaitError::WatchClosed) } else { Ok(()) };
            if self.delayed_wait {
                let (tx, rx) = oneshot::channel();
                let rec = self.rec.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    if tx.send(result).is_ok() {
                        rec.record("wait:delivered");
                    } else {
                        rec.record("wait:dropped");
                    }
                });
                Ok(PhaseWait::from_channel(rx))
            } else {
                Ok(PhaseWait::resolved(result))
            }
        }
    }

    fn lifecycle(
        run: RunOutcome,
        operator: MockOperator,
        rec: &Arc<Recorder>,
    ) -> StreamLifecycle<MockDiscoverer, MockOperator> {
        let discoverer = MockDiscoverer { rec: rec.clone(), run };
        StreamLifecycle::new(discoverer, operator, "arcane")
    }

    #[tokio::test]
    async fn suspend_discovers_from_run_and_patches() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::Found,
            MockOperator { rec: rec.clone(), ..Default::default() },
            &rec,
        );
        lc.suspend("orders-sync").await.expect("suspend");
        assert_eq!(
            rec.calls(),
            vec!["discover_run:arcane/orders-sync", "suspend:arcane/streams/orders-sync"]
        );
        assert_eq!(rec.state().as_deref(), Some("suspended"));
    }

    #[tokio::test]
    async fn resume_uses_the_supplied_class_without_fallback() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::Found,
            MockOperator { rec: rec.clone(), ..Default::default() },
            &rec,
        );
        lc.resume("orders-sync", "sql-mi").await.expect("resume");
        assert_eq!(
            rec.calls(),
            vec!["discover_class:arcane/sql-mi", "resume:arcane/streams/orders-sync"]
        );
    }

    #[tokio::test]
    async fn suspend_then_resume_leaves_no_directive() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::Found,
            MockOperator { rec: rec.clone(), ..Default::default() },
            &rec,
        );
        lc.suspend("orders-sync").await.expect("suspend");
        assert_eq!(rec.state().as_deref(), Some("suspended"));
        lc.resume("orders-sync", "sql-mi").await.expect("resume");
        assert_eq!(rec.state(), None);
    }

    #[tokio::test]
    async fn backfill_falls_back_to_stream_class_when_run_is_absent() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::NotFound,
            MockOperator { rec: rec.clone(), ..Default::default() },
            &rec,
        );
        let token = CancellationToken::new();
        lc.backfill(&token, "orders-sync", Some("sql-mi"), false).await.expect("backfill");
        // watch == false: no waits at all, on either discovery path.
        assert_eq!(
            rec.calls(),
            vec![
                "discover_run:arcane/orders-sync",
                "discover_class:arcane/sql-mi",
                "backfill:arcane/streams/orders-sync",
            ]
        );
    }

    #[tokio::test]
    async fn backfill_without_class_fails_before_any_mutation() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::NotFound,
            MockOperator { rec: rec.clone(), ..Default::default() },
            &rec,
        );
        let token = CancellationToken::new();
        let err = lc.backfill(&token, "orders-sync", None, true).await.unwrap_err();
        assert!(matches!(err, StreamError::MissingStreamClass { .. }));
        assert_eq!(rec.calls(), vec!["discover_run:arcane/orders-sync"]);
    }

    #[tokio::test]
    async fn backfill_empty_class_counts_as_missing() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::NotFound,
            MockOperator { rec: rec.clone(), ..Default::default() },
            &rec,
        );
        let token = CancellationToken::new();
        let err = lc.backfill(&token, "orders-sync", Some(""), false).await.unwrap_err();
        assert!(matches!(err, StreamError::MissingStreamClass { .. }));
    }

    #[tokio::test]
    async fn backfill_propagates_other_discovery_failures_without_mutating() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::Fails,
            MockOperator { rec: rec.clone(), ..Default::default() },
            &rec,
        );
        let token = CancellationToken::new();
        let err = lc.backfill(&token, "orders-sync", Some("sql-mi"), false).await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::Discovery { source: DiscoveryError::ReadFailure(_), .. }
        ));
        assert_eq!(rec.calls(), vec!["discover_run:arcane/orders-sync"]);
    }

    #[tokio::test]
    async fn backfill_watch_subscribes_before_the_patch() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::Found,
            MockOperator { rec: rec.clone(), ..Default::default() },
            &rec,
        );
        let token = CancellationToken::new();
        lc.backfill(&token, "orders-sync", None, true).await.expect("backfill");
        assert_eq!(
            rec.calls(),
            vec![
                "discover_run:arcane/orders-sync",
                "watch:Reloading",
                "backfill:arcane/streams/orders-sync",
                "watch:Running",
            ]
        );
    }

    #[tokio::test]
    async fn backfill_mutation_failure_still_drains_the_wait() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::Found,
            MockOperator {
                rec: rec.clone(),
                fail_op: Some("backfill"),
                delayed_wait: true,
                ..Default::default()
            },
            &rec,
        );
        let token = CancellationToken::new();
        let err = lc.backfill(&token, "orders-sync", None, true).await.unwrap_err();
        assert!(matches!(err, StreamError::Mutation { op: "backfill", .. }));
        assert!(rec.calls().contains(&"wait:delivered".to_string()));
    }

    #[tokio::test]
    async fn backfill_wait_failure_wraps_as_phase_error() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::Found,
            MockOperator { rec: rec.clone(), wait_fails: true, ..Default::default() },
            &rec,
        );
        let token = CancellationToken::new();
        let err = lc.backfill(&token, "orders-sync", None, true).await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::Wait { phase: Phase::Backfill, source: WaitError::WatchClosed, .. }
        ));
    }

    #[tokio::test]
    async fn restart_sequence_is_fixed() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::Found,
            MockOperator { rec: rec.clone(), ..Default::default() },
            &rec,
        );
        let token = CancellationToken::new();
        lc.restart(&token, "orders-sync", true).await.expect("restart");
        assert_eq!(
            rec.calls(),
            vec![
                "discover_run:arcane/orders-sync",
                "watch:Suspended",
                "suspend:arcane/streams/orders-sync",
                "resume:arcane/streams/orders-sync",
                "watch:Running",
            ]
        );
    }

    #[tokio::test]
    async fn restart_without_wait_skips_the_running_watch() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::Found,
            MockOperator { rec: rec.clone(), ..Default::default() },
            &rec,
        );
        let token = CancellationToken::new();
        lc.restart(&token, "orders-sync", false).await.expect("restart");
        let calls = rec.calls();
        assert_eq!(calls.last().unwrap(), "resume:arcane/streams/orders-sync");
        assert_eq!(calls.iter().filter(|c| c.starts_with("watch:")).count(), 1);
    }

    #[tokio::test]
    async fn restart_suspend_failure_never_resumes() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::Found,
            MockOperator {
                rec: rec.clone(),
                fail_op: Some("suspend"),
                delayed_wait: true,
                ..Default::default()
            },
            &rec,
        );
        let token = CancellationToken::new();
        let err = lc.restart(&token, "orders-sync", false).await.unwrap_err();
        assert!(matches!(err, StreamError::Mutation { op: "suspend", .. }));
        let calls = rec.calls();
        assert!(!calls.iter().any(|c| c.starts_with("resume:")));
        assert!(calls.contains(&"wait:delivered".to_string()));
    }

    #[tokio::test]
    async fn restart_does_not_fall_back_to_stream_class() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::NotFound,
            MockOperator { rec: rec.clone(), ..Default::default() },
            &rec,
        );
        let token = CancellationToken::new();
        let err = lc.restart(&token, "orders-sync", false).await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::Discovery { source: DiscoveryError::NotFound, .. }
        ));
        assert_eq!(rec.calls(), vec!["discover_run:arcane/orders-sync"]);
    }

    #[tokio::test]
    async fn restart_suspended_wait_failure_is_terminal() {
        let rec = Arc::new(Recorder::default());
        let lc = lifecycle(
            RunOutcome::Found,
            MockOperator { rec: rec.clone(), wait_fails: true, ..Default::default() },
            &rec,
        );
        let token = CancellationToken::new();
        let err = lc.restart(&token, "orders-sync", false).await.unwrap_err();
        assert!(matches!(err, StreamError::Wait { phase: Phase::Suspended, .. }));
        assert!(!rec.calls().iter().any(|c| c.starts_with("resume:")));
    }
}
