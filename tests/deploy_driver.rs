//! End-to-end runs of the deploy driver against local storage, scripted
//! builds and a fake executor.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use deploybox::build::{BuildRequest, BuildResolver, BuildRun, BuildService, RunStatus};
use deploybox::change::{ChangeDetector, ChangeLookupPolicy, SourceControl, SourceLocation};
use deploybox::clock::ManualClock;
use deploybox::document::Document;
use deploybox::error::{DeployBoxError, ErrorKind, ExecutorError, Result, StateError};
use deploybox::executor::{InfraExecutor, Step, StepOutput};
use deploybox::orchestrator::{DeployDriver, RunPhase};
use deploybox::providers::{
    AzurePlanner, AzureProviderSettings, MongoAtlasPlanner, MongoAtlasSettings, ProviderPlanner,
};
use deploybox::stack::{FileStackRepository, Stack, StackRepository, StackStatus};
use deploybox::state::{
    BundleStore, LocalBundleStore, ProvisioningState, DOCUMENT_FILE, EXECUTION_STATE_FILE,
    PROVISIONING_STATE_FILE,
};

const SOURCE: &str = "https://github.com/acme/shop.git#main";

/// Always reports the same head commit.
struct FixedHead(&'static str);

#[async_trait]
impl SourceControl for FixedHead {
    async fn latest_commit(&self, _location: &SourceLocation) -> Result<Option<String>> {
        Ok(Some(self.0.to_string()))
    }
}

/// Succeeds every build on the second status poll.
#[derive(Default)]
struct QuickBuilds {
    submitted: AtomicUsize,
    polls: AtomicUsize,
}

#[async_trait]
impl BuildService for QuickBuilds {
    async fn submit(&self, request: &BuildRequest) -> Result<String> {
        assert_eq!(request.source.subdirectory, "web");
        let n = self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(format!("run-{n}"))
    }

    async fn run(&self, _run_id: &str) -> Result<BuildRun> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst);
        if n % 2 == 0 {
            return Ok(BuildRun {
                status: RunStatus::Running,
                output_image: None,
            });
        }
        Ok(BuildRun {
            status: RunStatus::Succeeded,
            output_image: Some(String::from("deployboxcrdev.azurecr.io/shop-web:latest")),
        })
    }
}

/// Records the documents it was asked to apply and writes a state file.
#[derive(Default)]
struct RecordingExecutor {
    fail_apply: bool,
    applied: Mutex<Vec<Value>>,
    serial: AtomicUsize,
}

#[async_trait]
impl InfraExecutor for RecordingExecutor {
    async fn run(&self, step: Step, dir: &Path) -> Result<StepOutput> {
        if step == Step::Plan {
            let document = std::fs::read_to_string(dir.join(DOCUMENT_FILE))?;
            let value: Value = serde_json::from_str(&document).expect("document json");
            self.applied.lock().expect("applied").push(value);
        }
        if step == Step::Apply {
            if self.fail_apply {
                return Err(ExecutorError::StepFailed {
                    step: step.to_string(),
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: String::from("Error: creating Container App: quota exceeded"),
                }
                .into());
            }
            let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
            std::fs::write(
                dir.join(EXECUTION_STATE_FILE),
                json!({"version": 4, "serial": serial}).to_string(),
            )?;
        }
        std::fs::create_dir_all(dir.join(".terraform/providers"))?;
        Ok(StepOutput {
            step,
            stdout: format!("{step} complete"),
            stderr: String::new(),
        })
    }
}

struct Harness {
    _dir: TempDir,
    stacks: Arc<FileStackRepository>,
    store: Arc<LocalBundleStore>,
    builds: Arc<QuickBuilds>,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let stacks = Arc::new(FileStackRepository::new(dir.path().join("stacks")));
        let store = Arc::new(LocalBundleStore::with_base_dir(dir.path().join("bundles")));

        let document = Document::from_value(json!({
            "resource": {
                "azurerm_container_app": {
                    "web": {
                        "template": {
                            "container": [{
                                "image": {"task": {
                                    "location": "eastus",
                                    "properties": {
                                        "platform": {"os": "Linux"},
                                        "step": {
                                            "type": "Docker",
                                            "contextPath": SOURCE,
                                            "contextDirectory": "web",
                                            "dockerFilePath": "Dockerfile",
                                            "imageNames": ["shop-web:latest"]
                                        }
                                    }
                                }}
                            }]
                        }
                    }
                },
                "mongodbatlas_cluster": {
                    "db": {"provider_name": "TENANT", "backing_provider_name": "AZURE"}
                }
            }
        }))
        .expect("document");

        let mut stack = Stack::new("stack123", "Shop", "proj-1")
            .with_organization("org-1")
            .with_document(document);
        stack.attributes = BTreeMap::from([(
            String::from("azurerm_container_app.web.template.container[0].env.value?name=MONGO_URI"),
            String::from("mongodb+srv://db.example.net"),
        )]);
        stacks.save(&stack).await.expect("save stack");

        Self {
            _dir: dir,
            stacks,
            store,
            builds: Arc::new(QuickBuilds::default()),
        }
    }

    fn driver(&self, executor: Arc<RecordingExecutor>) -> DeployDriver {
        let detector = ChangeDetector::new(Arc::new(FixedHead("abc123")), ChangeLookupPolicy::FailOpen);
        let resolver = BuildResolver::new(self.builds.clone(), detector, Arc::new(ManualClock::new()));

        let planners: Vec<Arc<dyn ProviderPlanner>> = vec![
            Arc::new(AzurePlanner::new(AzureProviderSettings {
                subscription_id: String::from("sub-1"),
                tenant_id: String::from("tenant-1"),
                client_id: String::from("client-1"),
                client_secret: String::from("secret"),
                location: String::from("eastus"),
                registry_name: Some(String::from("deployboxcrdev")),
                registry_password: Some(String::from("acr-pw")),
            })),
            Arc::new(MongoAtlasPlanner::new(MongoAtlasSettings {
                public_key: String::from("pub"),
                private_key: String::from("priv"),
                project_id: Some(String::from("atlas-proj")),
            })),
        ];

        DeployDriver::new(
            self.stacks.clone(),
            self.store.clone(),
            planners,
            resolver,
            executor,
        )
        .with_holder("integration")
    }
}

#[tokio::test]
async fn first_deploy_builds_applies_and_persists() {
    let harness = Harness::new().await;
    let executor = Arc::new(RecordingExecutor::default());

    let report = harness
        .driver(executor.clone())
        .deploy("stack123")
        .await
        .expect("deploy");

    assert!(report.succeeded());
    assert!(report.first_run);
    assert_eq!(report.builds.built.len(), 1);
    assert_eq!(report.phases.last(), Some(&RunPhase::Succeeded));

    let applied = executor.applied.lock().expect("applied")[0].clone();
    let app = &applied["resource"]["azurerm_container_app"]["web"];
    let container = &app["template"]["container"][0];
    assert_eq!(container["image"], "deployboxcrdev.azurecr.io/shop-web:latest");
    assert_eq!(container["env"][0]["name"], "MONGO_URI");
    assert_eq!(app["resource_group_name"], "${azurerm_resource_group.rg.name}");
    assert_eq!(applied["resource"]["azurerm_resource_group"]["rg"]["name"], "stack123-rg");
    assert_eq!(
        applied["resource"]["mongodbatlas_cluster"]["db"]["project_id"],
        "atlas-proj"
    );

    let bundle = harness
        .store
        .load("stack123-rg")
        .await
        .expect("load")
        .expect("bundle");
    let mut files: Vec<&str> = bundle.files().map(|(path, _)| path).collect();
    files.sort_unstable();
    assert_eq!(
        files,
        vec![PROVISIONING_STATE_FILE, DOCUMENT_FILE, EXECUTION_STATE_FILE]
    );

    let state = ProvisioningState::from_slice(bundle.get(PROVISIONING_STATE_FILE).expect("state"))
        .expect("parse state");
    assert_eq!(state.get("azurerm", &format!("{SOURCE}/web-sha")), Some("abc123"));
    let images: Vec<&String> = state
        .namespace("azurerm")
        .expect("azurerm state")
        .iter()
        .filter(|(key, _)| key.starts_with(&format!("{SOURCE}/web-image-")))
        .map(|(_, image)| image)
        .collect();
    assert_eq!(images, vec!["deployboxcrdev.azurecr.io/shop-web:latest"]);

    let stack = harness.stacks.require("stack123").await.expect("stack");
    assert_eq!(stack.status, StackStatus::Running);
    assert_eq!(stack.execution_state, Some(json!({"version": 4, "serial": 1})));
    assert!(stack.applied_document.is_some_and(|d| !d.has_build_tasks()));
    assert!(stack.document.has_build_tasks());
}

#[tokio::test]
async fn unchanged_source_reuses_previous_image() {
    let harness = Harness::new().await;
    let executor = Arc::new(RecordingExecutor::default());
    let driver = harness.driver(executor.clone());

    driver.deploy("stack123").await.expect("first deploy");
    let second = driver.deploy("stack123").await.expect("second deploy");

    assert!(!second.first_run);
    assert!(second.builds.built.is_empty());
    assert_eq!(second.builds.reused.len(), 1);
    assert_eq!(harness.builds.submitted.load(Ordering::SeqCst), 1);

    let applied = executor.applied.lock().expect("applied");
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0], applied[1]);
}

#[tokio::test]
async fn failed_apply_keeps_previous_bundle() {
    let harness = Harness::new().await;
    harness
        .driver(Arc::new(RecordingExecutor::default()))
        .deploy("stack123")
        .await
        .expect("first deploy");
    let before = harness.store.load("stack123-rg").await.expect("load");

    let failing = Arc::new(RecordingExecutor {
        fail_apply: true,
        ..RecordingExecutor::default()
    });
    let err = harness
        .driver(failing)
        .deploy("stack123")
        .await
        .expect_err("apply fails");

    assert_eq!(err.kind(), ErrorKind::ExecutorFailure);
    assert!(err.to_string().contains("quota exceeded"));
    assert_eq!(harness.store.load("stack123-rg").await.expect("load"), before);

    let stack = harness.stacks.require("stack123").await.expect("stack");
    assert_eq!(stack.status, StackStatus::Error);
    assert!(harness
        .store
        .get_lock_info("stack123-rg")
        .await
        .expect("lock")
        .is_none());
}

#[tokio::test]
async fn concurrent_run_is_rejected_by_lease() {
    let harness = Harness::new().await;
    let lease = harness
        .store
        .acquire_lock("stack123-rg", "another-worker")
        .await
        .expect("lease");

    let executor = Arc::new(RecordingExecutor::default());
    let err = harness
        .driver(executor.clone())
        .deploy("stack123")
        .await
        .expect_err("locked");

    assert!(matches!(
        err,
        DeployBoxError::State(StateError::LockedByOther { ref holder, .. }) if holder == "another-worker"
    ));
    assert!(executor.applied.lock().expect("applied").is_empty());
    assert_eq!(harness.builds.submitted.load(Ordering::SeqCst), 0);

    harness
        .store
        .release_lock("stack123-rg", &lease.lock_id)
        .await
        .expect("release");
    harness
        .driver(executor)
        .deploy("stack123")
        .await
        .expect("deploy after release");
}
