//! Replacement of build-task placeholders with built image references.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::change::ChangeDetector;
use crate::clock::{CancellationSignal, Clock, PollPolicy};
use crate::document::{BuildTaskSlot, Document};
use crate::error::{BuildError, PlanError, Result};
use crate::state::ProvisioningState;

use super::service::{is_image_key_of, BuildRequest, BuildService, RunStatus};

/// How a placeholder was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedImage {
    /// Dotted path of the placeholder.
    pub path: String,
    /// Image reference written in its place.
    pub image: String,
    /// Build run that produced the image; `None` when a previous image was reused.
    pub run_id: Option<String>,
}

/// Outcome of resolving every placeholder in a document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolveReport {
    /// Placeholders resolved by a new build.
    pub built: Vec<ResolvedImage>,
    /// Placeholders resolved by reusing the last image for unchanged source.
    pub reused: Vec<ResolvedImage>,
}

impl ResolveReport {
    /// Total number of resolved placeholders.
    #[must_use]
    pub fn total(&self) -> usize {
        self.built.len() + self.reused.len()
    }
}

/// Resolves build tasks one at a time.
pub struct BuildResolver {
    service: Arc<dyn BuildService>,
    detector: ChangeDetector,
    clock: Arc<dyn Clock>,
    policy: PollPolicy,
    cancel: CancellationSignal,
}

impl std::fmt::Debug for BuildResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildResolver")
            .field("detector", &self.detector)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl BuildResolver {
    /// Creates a resolver with the default unbounded poll policy.
    #[must_use]
    pub fn new(service: Arc<dyn BuildService>, detector: ChangeDetector, clock: Arc<dyn Clock>) -> Self {
        Self {
            service,
            detector,
            clock,
            policy: PollPolicy::default(),
            cancel: CancellationSignal::never(),
        }
    }

    /// Sets the poll interval and deadline.
    #[must_use]
    pub const fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the cancellation signal observed while polling.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolves every build-task placeholder in `document`.
    ///
    /// Each source is checked with the change detector once per call. When
    /// it moved, every image recorded for it is forgotten. A placeholder
    /// reuses the image recorded for its exact request (source, Dockerfile,
    /// image names, arguments) if the source is unchanged or the image was
    /// built earlier in this call; otherwise a build is submitted and polled
    /// to completion. The image is recorded in `state` only after a
    /// successful build.
    ///
    /// # Errors
    ///
    /// Returns the first build, lookup or polling error. Placeholders
    /// resolved before the failure stay resolved.
    pub async fn resolve(
        &self,
        stack_id: &str,
        document: &mut Document,
        state: &mut ProvisioningState,
    ) -> Result<ResolveReport> {
        let slots = document.build_task_slots();
        let mut report = ResolveReport::default();
        if slots.is_empty() {
            debug!("Stack {stack_id}: no build tasks");
            return Ok(report);
        }

        info!("Stack {stack_id}: resolving {} build task(s)", slots.len());

        let mut moved: HashMap<String, bool> = HashMap::new();
        let mut built_now: HashSet<String> = HashSet::new();

        for slot in &slots {
            let request = {
                let task = document.build_task(slot).ok_or_else(|| PlanError::InvalidResource {
                    path: slot.path.clone(),
                    message: String::from("build task disappeared while resolving"),
                })?;
                BuildRequest::from_task(task)?
            };
            let namespace = namespace_of(slot);

            let revision_key = request.source.revision_key();
            let changed = match moved.get(&revision_key).copied() {
                Some(changed) => changed,
                None => {
                    let changed = self
                        .detector
                        .has_changes(stack_id, state, namespace, &request.source)
                        .await?;
                    if changed {
                        let dropped =
                            state.retain(namespace, |key, _| !is_image_key_of(&request.source, key));
                        if dropped > 0 {
                            debug!("Stack {stack_id}: forgot {dropped} image(s) of {}", request.source);
                        }
                    }
                    moved.insert(revision_key, changed);
                    changed
                }
            };

            let image_key = request.image_key();
            let previous = state.get(namespace, &image_key).map(str::to_string);

            let resolved = match previous {
                Some(image) if !changed || built_now.contains(&image_key) => {
                    info!("Stack {stack_id}: reusing {image} for {}", slot.path);
                    ResolvedImage {
                        path: slot.path.clone(),
                        image,
                        run_id: None,
                    }
                }
                _ => {
                    let run_id = self.service.submit(&request).await?;
                    let image = self.wait_for_run(&run_id).await?;
                    state.set(namespace, image_key.clone(), image.clone());
                    built_now.insert(image_key);
                    ResolvedImage {
                        path: slot.path.clone(),
                        image,
                        run_id: Some(run_id),
                    }
                }
            };

            if !document.resolve_build_task(slot, resolved.image.clone()) {
                warn!("Stack {stack_id}: placeholder {} vanished", slot.path);
            }

            if resolved.run_id.is_some() {
                report.built.push(resolved);
            } else {
                report.reused.push(resolved);
            }
        }

        Ok(report)
    }

    /// Polls a run until it reaches a terminal status.
    async fn wait_for_run(&self, run_id: &str) -> Result<String> {
        let started = self.clock.now();

        loop {
            if self.cancel.is_cancelled() {
                return Err(BuildError::Cancelled {
                    run_id: run_id.to_string(),
                }
                .into());
            }

            let run = self.service.run(run_id).await?;
            match run.status {
                RunStatus::Succeeded => {
                    info!("Build run {run_id} succeeded");
                    return run.output_image.ok_or_else(|| {
                        BuildError::MissingOutput {
                            run_id: run_id.to_string(),
                        }
                        .into()
                    });
                }
                status if status.is_terminal() => {
                    return Err(BuildError::Failed {
                        run_id: run_id.to_string(),
                        status: status.to_string(),
                    }
                    .into());
                }
                status => debug!("Build run {run_id} is {status}"),
            }

            let elapsed = (self.clock.now() - started).to_std().unwrap_or(Duration::ZERO);
            let wait = match self.policy.deadline {
                Some(deadline) if elapsed >= deadline => {
                    return Err(BuildError::Timeout {
                        run_id: run_id.to_string(),
                        waited_secs: elapsed.as_secs(),
                    }
                    .into());
                }
                Some(deadline) => self.policy.interval.min(deadline - elapsed),
                None => self.policy.interval,
            };

            tokio::select! {
                () = self.clock.sleep(wait) => {}
                () = self.cancel.cancelled() => {
                    return Err(BuildError::Cancelled {
                        run_id: run_id.to_string(),
                    }
                    .into());
                }
            }
        }
    }
}

/// Provider namespace owning a slot's resource kind.
fn namespace_of(slot: &BuildTaskSlot) -> &str {
    slot.kind.split_once('_').map_or(slot.kind.as_str(), |(namespace, _)| namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildRun;
    use crate::change::{ChangeLookupPolicy, MockSourceControl};
    use crate::clock::{cancellation, ManualClock};
    use crate::error::{DeployBoxError, ErrorKind};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Build service replaying scripted statuses.
    #[derive(Default)]
    struct ScriptedBuilds {
        submitted: Mutex<Vec<BuildRequest>>,
        statuses: Mutex<VecDeque<&'static str>>,
        polls: Mutex<u32>,
    }

    impl ScriptedBuilds {
        fn with_statuses(statuses: &[&'static str]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                ..Self::default()
            }
        }

        fn submissions(&self) -> usize {
            self.submitted.lock().expect("lock").len()
        }

        fn polls(&self) -> u32 {
            *self.polls.lock().expect("lock")
        }
    }

    #[async_trait]
    impl BuildService for ScriptedBuilds {
        async fn submit(&self, request: &BuildRequest) -> Result<String> {
            let mut submitted = self.submitted.lock().expect("lock");
            submitted.push(request.clone());
            Ok(format!("run-{}", submitted.len()))
        }

        async fn run(&self, run_id: &str) -> Result<BuildRun> {
            *self.polls.lock().expect("lock") += 1;
            let status = self
                .statuses
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or("Succeeded");
            Ok(BuildRun {
                status: RunStatus::parse(status),
                output_image: Some(format!("acr.azurecr.io/{run_id}:latest")),
            })
        }
    }

    fn detector(sha: &'static str) -> ChangeDetector {
        let mut source = MockSourceControl::new();
        source
            .expect_latest_commit()
            .returning(move |_| Ok(Some(sha.to_string())));
        ChangeDetector::new(Arc::new(source), ChangeLookupPolicy::FailOpen)
    }

    fn task(directory: &str) -> serde_json::Value {
        json!({"task": {
            "contextPath": "https://github.com/acme/shop.git#main",
            "contextDirectory": directory,
            "imageNames": [format!("shop-{directory}:latest")]
        }})
    }

    fn document() -> Document {
        Document::from_value(json!({
            "resource": {"azurerm_container_app": {
                "web": {"template": {"container": [{"image": task("web")}, {"image": "nginx:latest"}]}},
                "api": {"template": {"container": [{"image": task("api")}]}}
            }}
        }))
        .expect("document")
    }

    #[tokio::test]
    async fn test_resolves_every_placeholder() {
        let builds = Arc::new(ScriptedBuilds::with_statuses(&["Queued", "Running"]));
        let clock = Arc::new(ManualClock::new());
        let resolver = BuildResolver::new(builds.clone(), detector("sha-1"), clock.clone());

        let mut doc = document();
        let mut state = ProvisioningState::new();
        let report = resolver.resolve("s1", &mut doc, &mut state).await.expect("resolve");

        assert_eq!(report.built.len(), 2);
        assert!(report.reused.is_empty());
        assert!(!doc.has_build_tasks());
        assert_eq!(builds.submissions(), 2);

        let web = &doc.resource["azurerm_container_app"]["web"]["template"]["container"];
        assert!(web[0]["image"].as_str().is_some_and(|i| i.ends_with(":latest")));
        assert_eq!(web[1]["image"], "nginx:latest");

        // Two non-terminal polls for the first build, each followed by a sleep.
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(10); 2]);
        assert_eq!(state.namespace("azurerm").map(|n| n.len()), Some(4));
    }

    #[tokio::test]
    async fn test_unchanged_source_reuses_image() {
        let builds = Arc::new(ScriptedBuilds::default());
        let resolver = BuildResolver::new(builds.clone(), detector("sha-1"), Arc::new(ManualClock::new()));

        let mut state = ProvisioningState::new();
        let mut first = document();
        resolver.resolve("s1", &mut first, &mut state).await.expect("first");
        assert_eq!(builds.submissions(), 2);

        let mut second = document();
        let report = resolver.resolve("s1", &mut second, &mut state).await.expect("second");
        assert_eq!(builds.submissions(), 2);
        assert_eq!(report.reused.len(), 2);
        assert_eq!(second, first);
    }

    fn shared_directory_document() -> Document {
        let task = |dockerfile: &str, image: &str| {
            json!({"task": {
                "contextPath": "https://github.com/acme/shop.git#main:app",
                "dockerFilePath": dockerfile,
                "imageNames": [image]
            }})
        };
        Document::from_value(json!({
            "resource": {"azurerm_container_app": {
                "api": {"template": {"container": [{"image": task("Dockerfile.api", "api")}]}},
                "worker": {"template": {"container": [{"image": task("Dockerfile.worker", "worker")}]}}
            }}
        }))
        .expect("document")
    }

    fn image_of(doc: &Document, app: &str) -> String {
        doc.resource["azurerm_container_app"][app]["template"]["container"][0]["image"]
            .as_str()
            .expect("resolved image")
            .to_string()
    }

    #[tokio::test]
    async fn test_tasks_sharing_a_directory_build_separately() {
        let builds = Arc::new(ScriptedBuilds::default());
        let mut state = ProvisioningState::new();

        let resolver = BuildResolver::new(builds.clone(), detector("sha-1"), Arc::new(ManualClock::new()));
        let mut first = shared_directory_document();
        let report = resolver.resolve("s1", &mut first, &mut state).await.expect("first");
        assert_eq!(report.built.len(), 2);
        assert_eq!(builds.submissions(), 2);
        assert_ne!(image_of(&first, "api"), image_of(&first, "worker"));

        let mut second = shared_directory_document();
        let report = resolver.resolve("s1", &mut second, &mut state).await.expect("second");
        assert_eq!(report.reused.len(), 2);
        assert_eq!(second, first);

        let moved = BuildResolver::new(builds.clone(), detector("sha-2"), Arc::new(ManualClock::new()));
        let mut third = shared_directory_document();
        let report = moved.resolve("s1", &mut third, &mut state).await.expect("third");
        assert_eq!(report.built.len(), 2);
        assert_eq!(builds.submissions(), 4);
        assert_ne!(image_of(&third, "api"), image_of(&first, "api"));
        // One revision plus one image per request; images of the old revision are gone.
        assert_eq!(state.namespace("azurerm").map(|n| n.len()), Some(3));
    }

    #[tokio::test]
    async fn test_changed_request_shape_rebuilds() {
        let builds = Arc::new(ScriptedBuilds::default());
        let resolver = BuildResolver::new(builds.clone(), detector("sha-1"), Arc::new(ManualClock::new()));
        let mut state = ProvisioningState::new();

        let mut first = document();
        resolver.resolve("s1", &mut first, &mut state).await.expect("first");

        let mut renamed = document();
        let api = renamed
            .resource
            .get_mut("azurerm_container_app")
            .and_then(|apps| apps.get_mut("api"))
            .expect("api app");
        api["template"]["container"][0]["image"]["task"]["imageNames"] = json!(["shop-api:v2"]);
        let report = resolver.resolve("s1", &mut renamed, &mut state).await.expect("second");

        assert_eq!(report.built.len(), 1);
        assert_eq!(report.reused.len(), 1);
        assert_eq!(builds.submissions(), 3);
    }

    #[tokio::test]
    async fn test_failed_build_is_reported() {
        let builds = Arc::new(ScriptedBuilds::with_statuses(&["Running", "Failed"]));
        let resolver = BuildResolver::new(builds, detector("sha-1"), Arc::new(ManualClock::new()));

        let mut doc = document();
        let mut state = ProvisioningState::new();
        let err = resolver
            .resolve("s1", &mut doc, &mut state)
            .await
            .expect_err("failed");

        assert_eq!(err.kind(), ErrorKind::BuildFailure);
        assert!(err.to_string().contains("Failed"));
        assert!(doc.has_build_tasks());
    }

    #[tokio::test]
    async fn test_polling_is_unbounded_by_default() {
        let statuses = vec!["Running"; 500];
        let builds = Arc::new(ScriptedBuilds::with_statuses(&statuses));
        let clock = Arc::new(ManualClock::new());
        let resolver = BuildResolver::new(builds.clone(), detector("sha-1"), clock.clone());

        let mut doc = document();
        let mut state = ProvisioningState::new();
        resolver.resolve("s1", &mut doc, &mut state).await.expect("resolve");

        assert_eq!(builds.polls(), 502);
        assert_eq!(clock.sleeps().len(), 500);
    }

    #[tokio::test]
    async fn test_deadline_stops_polling() {
        let statuses = vec!["Running"; 100];
        let builds = Arc::new(ScriptedBuilds::with_statuses(&statuses));
        let resolver = BuildResolver::new(builds.clone(), detector("sha-1"), Arc::new(ManualClock::new()))
            .with_policy(PollPolicy::every(Duration::from_secs(10)).with_deadline(Duration::from_secs(35)));

        let mut doc = document();
        let mut state = ProvisioningState::new();
        let err = resolver
            .resolve("s1", &mut doc, &mut state)
            .await
            .expect_err("timeout");

        assert!(matches!(
            err,
            DeployBoxError::Build(BuildError::Timeout { waited_secs: 35, .. })
        ));
        assert_eq!(builds.polls(), 5);
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let builds = Arc::new(ScriptedBuilds::with_statuses(&["Running"]));
        let (handle, signal) = cancellation();
        handle.cancel();

        let resolver = BuildResolver::new(builds.clone(), detector("sha-1"), Arc::new(ManualClock::new()))
            .with_cancellation(signal);

        let mut doc = document();
        let mut state = ProvisioningState::new();
        let err = resolver
            .resolve("s1", &mut doc, &mut state)
            .await
            .expect_err("cancelled");

        assert!(matches!(err, DeployBoxError::Build(BuildError::Cancelled { .. })));
        assert_eq!(builds.polls(), 0);
    }
}
