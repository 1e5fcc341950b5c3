//! Arcane stream operations: coordinate discovery, state patches, and
//! phase waits against the dynamic resource API.

#![forbid(unsafe_code)]

use futures::{Stream, StreamExt};
use kube::{
    api::{Patch, PatchParams, WatchParams},
    core::{DynamicObject, WatchEvent},
    Api, Client,
};
use metrics::counter;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use arcane_core::{
    DiscoveryError, MutationError, Phase, ResourceCoordinates, WaitError, STATE_ANNOTATION,
    STATE_RELOAD_REQUESTED, STATE_SUSPENDED,
};

pub mod lifecycle;

pub use lifecycle::StreamLifecycle;

/// Coordinates of the transient run (Job) resource streams execute under.
const RUN_RESOURCE: (&str, &str, &str) = ("batch", "v1", "jobs");
/// Coordinates of the persistent stream-class resource.
const CLASS_RESOURCE: (&str, &str, &str) = ("streaming.sneaksanddata.com", "v1beta1", "stream-classes");

/// Resolves the dynamic resource coordinates for a stream from one of the
/// two sources. Both reads are side-effect-free and safe to repeat.
#[async_trait::async_trait]
pub trait SettingsDiscoverer: Send + Sync {
    async fn discover_from_run(
        &self,
        id: &str,
        namespace: &str,
    ) -> Result<ResourceCoordinates, DiscoveryError>;

    async fn discover_from_stream_class(
        &self,
        class_id: &str,
        namespace: &str,
    ) -> Result<ResourceCoordinates, DiscoveryError>;
}

/// Applies state mutations to a stream and observes its phase transitions.
#[async_trait::async_trait]
pub trait StreamOperator: Send + Sync {
    async fn suspend(
        &self,
        id: &str,
        namespace: &str,
        coords: &ResourceCoordinates,
    ) -> Result<(), MutationError>;

    async fn resume(
        &self,
        id: &str,
        namespace: &str,
        coords: &ResourceCoordinates,
    ) -> Result<(), MutationError>;

    async fn backfill(
        &self,
        id: &str,
        namespace: &str,
        coords: &ResourceCoordinates,
    ) -> Result<(), MutationError>;

    /// Subscribe to the stream's change events and wait for `target`.
    ///
    /// Returns only once the server has acknowledged the subscription, so a
    /// mutation issued after this call cannot have its phase transition slip
    /// by unobserved. The wait itself runs in a background task; its single
    /// result is collected through the returned [`PhaseWait`].
    async fn watch_phase(
        &self,
        token: &CancellationToken,
        target: Phase,
        id: &str,
        namespace: &str,
        coords: &ResourceCoordinates,
    ) -> Result<PhaseWait, WaitError>;
}

/// Pending result of a background phase wait.
///
/// One producer write, one consumer read: the orchestrator receives the
/// result on every exit path, so the background task never leaks.
#[derive(Debug)]
pub struct PhaseWait {
    rx: oneshot::Receiver<Result<(), WaitError>>,
}

impl PhaseWait {
    pub fn from_channel(rx: oneshot::Receiver<Result<(), WaitError>>) -> Self {
        Self { rx }
    }

    /// An already-settled wait carrying `result`.
    pub fn resolved(result: Result<(), WaitError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// The trivially-succeeded no-op wait.
    pub fn ready() -> Self {
        Self::resolved(Ok(()))
    }

    /// Receive the wait's result.
    pub async fn done(self) -> Result<(), WaitError> {
        match self.rx.await {
            Ok(result) => result,
            // Sender dropped without delivering a result.
            Err(_) => Err(WaitError::WatchClosed),
        }
    }
}

/// Discoverer backed by the cluster's dynamic API.
pub struct KubeDiscoverer {
    client: Client,
}

impl KubeDiscoverer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn fetch(
        &self,
        resource: (&str, &str, &str),
        namespace: &str,
        name: &str,
    ) -> Result<Value, DiscoveryError> {
        let (group, version, plural) = resource;
        let ar = arcane_kubehub::api_resource(group, version, plural);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let object = api.get(name).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => DiscoveryError::NotFound,
            other => DiscoveryError::ReadFailure(other.to_string()),
        })?;
        serde_json::to_value(&object).map_err(|e| DiscoveryError::ReadFailure(e.to_string()))
    }
}

#[async_trait::async_trait]
impl SettingsDiscoverer for KubeDiscoverer {
    async fn discover_from_run(
        &self,
        id: &str,
        namespace: &str,
    ) -> Result<ResourceCoordinates, DiscoveryError> {
        let run = self.fetch(RUN_RESOURCE, namespace, id).await?;
        let coords = ResourceCoordinates::from_run_annotations(&run)?;
        debug!(id = %id, coords = %coords, "discovered coordinates from run");
        Ok(coords)
    }

    async fn discover_from_stream_class(
        &self,
        class_id: &str,
        namespace: &str,
    ) -> Result<ResourceCoordinates, DiscoveryError> {
        let class = self.fetch(CLASS_RESOURCE, namespace, class_id).await?;
        let coords = ResourceCoordinates::from_class_spec(&class)?;
        debug!(class = %class_id, coords = %coords, "discovered coordinates from stream class");
        Ok(coords)
    }
}

/// Merge-patch body setting or clearing the state directive annotation.
fn state_patch(directive: Option<&str>) -> Value {
    json!({
        "metadata": {
            "annotations": {
                STATE_ANNOTATION: directive,
            }
        }
    })
}

/// Operator backed by the cluster's dynamic API.
pub struct KubeStreamOperator {
    client: Client,
}

impl KubeStreamOperator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply_state(
        &self,
        id: &str,
        namespace: &str,
        coords: &ResourceCoordinates,
        directive: Option<&str>,
    ) -> Result<(), MutationError> {
        let api = arcane_kubehub::dynamic_api(self.client.clone(), namespace, coords);
        let body = state_patch(directive);
        api.patch(id, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| match e {
                kube::Error::SerdeError(err) => MutationError::EncodingFailure(err.to_string()),
                other => MutationError::PatchRejected(other.to_string()),
            })?;
        debug!(id = %id, directive = ?directive, "state patch accepted");
        Ok(())
    }
}

#[async_trait::async_trait]
impl StreamOperator for KubeStreamOperator {
    async fn suspend(
        &self,
        id: &str,
        namespace: &str,
        coords: &ResourceCoordinates,
    ) -> Result<(), MutationError> {
        counter!("stream_suspend_total", 1u64);
        self.apply_state(id, namespace, coords, Some(STATE_SUSPENDED)).await
    }

    async fn resume(
        &self,
        id: &str,
        namespace: &str,
        coords: &ResourceCoordinates,
    ) -> Result<(), MutationError> {
        counter!("stream_resume_total", 1u64);
        self.apply_state(id, namespace, coords, None).await
    }

    async fn backfill(
        &self,
        id: &str,
        namespace: &str,
        coords: &ResourceCoordinates,
    ) -> Result<(), MutationError> {
        counter!("stream_backfill_total", 1u64);
        self.apply_state(id, namespace, coords, Some(STATE_RELOAD_REQUESTED)).await
    }

    async fn watch_phase(
        &self,
        token: &CancellationToken,
        target: Phase,
        id: &str,
        namespace: &str,
        coords: &ResourceCoordinates,
    ) -> Result<PhaseWait, WaitError> {
        let api = arcane_kubehub::dynamic_api(self.client.clone(), namespace, coords);
        let wp = WatchParams::default().fields(&format!("metadata.name={id}"));
        let stream = api
            .watch(&wp, "0")
            .await
            .map_err(|e| WaitError::SubscribeFailed(e.to_string()))?;
        info!(id = %id, target = %target, "watch established");
        counter!("stream_phase_waits_total", 1u64);

        let (tx, rx) = oneshot::channel();
        let token = token.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let result = wait_on_events(Box::pin(stream), target, &token, &id).await;
            let _ = tx.send(result);
        });
        Ok(PhaseWait::from_channel(rx))
    }
}

/// Drive a watch event stream until `target` is observed, the stream ends,
/// an event cannot be interpreted, or the token fires.
async fn wait_on_events<S, E>(
    mut events: S,
    target: Phase,
    token: &CancellationToken,
    id: &str,
) -> Result<(), WaitError>
where
    S: Stream<Item = Result<WatchEvent<DynamicObject>, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(id = %id, target = %target, "wait cancelled");
                return Err(WaitError::Cancelled);
            }
            next = events.next() => match next {
                Some(Ok(
                    WatchEvent::Added(object)
                    | WatchEvent::Modified(object)
                    | WatchEvent::Deleted(object),
                )) => {
                    let phase = observed_phase(&object)?;
                    debug!(id = %id, phase = %phase, "phase update");
                    if target.matches(&phase) {
                        info!(id = %id, phase = %phase, "target phase reached");
                        return Ok(());
                    }
                }
                Some(Ok(WatchEvent::Bookmark(_))) => {}
                Some(Ok(WatchEvent::Error(e))) => {
                    return Err(WaitError::UnexpectedShape(format!(
                        "server error event: {}",
                        e.message
                    )));
                }
                Some(Err(e)) => {
                    warn!(id = %id, error = %e, "watch stream failed");
                    return Err(WaitError::WatchClosed);
                }
                None => return Err(WaitError::WatchClosed),
            }
        }
    }
}

fn observed_phase(object: &DynamicObject) -> Result<String, WaitError> {
    let status = match object.data.get("status") {
        Some(Value::Object(map)) => map,
        Some(_) => return Err(WaitError::UnexpectedShape("status is not an object".into())),
        None => return Err(WaitError::PhaseFieldMissing),
    };
    match status.get("phase") {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(WaitError::UnexpectedShape("status.phase is not a string".into())),
        None => Err(WaitError::PhaseFieldMissing),
    }
}
