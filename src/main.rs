//! DeployBox CLI entrypoint.
//!
//! This is the main entrypoint for the deploybox command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use deploybox::azure::{ArmClient, ClientCredentialsProvider, ServicePrincipal};
use deploybox::billing::BillingAggregator;
use deploybox::build::{BuildResolver, RegistryBuildService, RegistryTarget};
use deploybox::change::{ChangeDetector, GitHubClient};
use deploybox::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use deploybox::clock::{cancellation, CancellationSignal, Clock, TokioClock};
use deploybox::config::{
    find_config_file, ConfigParser, ConfigValidator, EngineConfig, StateBackend,
};
use deploybox::error::{ConfigError, Result};
use deploybox::executor::TerraformExecutor;
use deploybox::orchestrator::{DeployDriver, StackRenderer};
use deploybox::providers::{
    AzurePlanner, AzureProviderSettings, MongoAtlasPlanner, MongoAtlasSettings, ProviderPlanner,
};
use deploybox::stack::{FileStackRepository, StackRepository};
use deploybox::state::{bundle_key, BundleStore, LocalBundleStore, S3BundleStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.output);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error [{}]: {e}", e.kind());
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, output: OutputFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match output {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Deploy { stack } => cmd_deploy(config_path, &stack, &formatter).await,
        Commands::Destroy { stack, yes } => cmd_destroy(config_path, &stack, yes, &formatter).await,
        Commands::Render { stack } => cmd_render(config_path, &stack, &formatter).await,
        Commands::Billing { resource_groups } => {
            cmd_billing(config_path, resource_groups, &formatter).await
        }
        Commands::Stacks => cmd_stacks(config_path, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = read_config(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let result = ConfigValidator::new().validate(&config)?;
    eprint!("{}", formatter.format_validation(&result, show_warnings));

    eprintln!("\nConfiguration summary:");
    eprintln!("  Subscription: {}", config.azure.subscription_id);
    eprintln!("  Location: {}", config.azure.location);
    eprintln!("  State backend: {:?}", config.state.backend);
    eprintln!("  Executor: {}", config.executor.binary);
    eprintln!("  Change policy: {:?}", config.change_detection.policy);

    Ok(())
}

/// Provision a stack.
async fn cmd_deploy(
    config_path: Option<&PathBuf>,
    stack_id: &str,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    ConfigParser::require_deploy_secrets(&config)?;

    let driver = create_driver(&config, &config_file, interrupt_signal()).await?;
    let report = driver.deploy(stack_id).await?;
    eprint!("{}", formatter.format_report(&report));
    Ok(())
}

/// Tear down a stack.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    stack_id: &str,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    ConfigParser::require_deploy_secrets(&config)?;

    if !auto_approve {
        eprint!("\nAll infrastructure of stack {stack_id} will be destroyed. Type 'destroy' to confirm: ");
        std::io::stderr().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if input.trim() != "destroy" {
            eprintln!("Destruction cancelled.");
            return Ok(());
        }
    }

    let driver = create_driver(&config, &config_file, interrupt_signal()).await?;
    let report = driver.destroy(stack_id).await?;
    eprint!("{}", formatter.format_report(&report));
    Ok(())
}

/// Print the planned document for a stack.
async fn cmd_render(
    config_path: Option<&PathBuf>,
    stack_id: &str,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let stacks: Arc<dyn StackRepository> = Arc::new(FileStackRepository::new(&config.stacks.dir));
    let store = create_bundle_store(&config, &config_file).await?;
    let renderer = StackRenderer::new(stacks, store, create_planners(&config));
    debug!("{renderer:?}");

    let document = renderer.render(stack_id).await?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", formatter.format_document(&document))?;
    Ok(())
}

/// Show costs per stack.
async fn cmd_billing(
    config_path: Option<&PathBuf>,
    resource_groups: Vec<String>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);

    let aggregator = BillingAggregator::new(
        create_arm_client(&config, clock.clone())?,
        &config.azure.subscription_id,
        clock,
    )
    .with_max_attempts(config.billing.max_attempts)
    .with_base_delay(Duration::from_secs(config.billing.base_delay_secs));

    let names = if resource_groups.is_empty() {
        let groups = aggregator.resource_groups().await?;
        debug!("Found {} resource group(s)", groups.len());
        groups.into_iter().map(|g| g.name).collect()
    } else {
        resource_groups
    };

    let costs = aggregator.aggregate(&names).await?;
    eprint!("{}", formatter.format_costs(&costs));
    Ok(())
}

/// List stacks.
async fn cmd_stacks(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let stacks = FileStackRepository::new(&config.stacks.dir).list().await?;
    eprint!("{}", formatter.format_stacks(&stacks));
    Ok(())
}

/// Manage stored bundles.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let store = create_bundle_store(&config, &config_file).await?;

    match command {
        StateCommands::Show { stack } => {
            let key = bundle_key(&stack);
            let bundle = store.load(&key).await?;
            let lock = store.get_lock_info(&key).await?;
            eprint!(
                "{}",
                formatter.format_bundle(&key, bundle.as_ref(), lock.as_ref())
            );
        }
        StateCommands::Unlock { stack, force } => {
            let key = bundle_key(&stack);
            match store.get_lock_info(&key).await? {
                None => eprintln!("Stack {stack} is not locked."),
                Some(lock) if force || lock.is_expired() => {
                    warn!("Removing lease on {key} held by {}", lock.holder);
                    store.force_unlock(&key).await?;
                    eprintln!("Stack {stack} unlocked.");
                }
                Some(lock) => {
                    eprintln!(
                        "Stack {stack} is locked by {} for another {}s. Use --force to remove the lease.",
                        lock.holder,
                        lock.remaining_secs()
                    );
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Reads configuration, `.env` and environment overrides without validating.
fn read_config(config_path: Option<&PathBuf>) -> Result<(EngineConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    Ok((config, config_file))
}

/// Reads and validates configuration.
fn load_config(config_path: Option<&PathBuf>) -> Result<(EngineConfig, PathBuf)> {
    let (config, config_file) = read_config(config_path)?;
    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }
    Ok((config, config_file))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Cancels build polling on Ctrl-C.
fn interrupt_signal() -> CancellationSignal {
    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling build polling");
            handle.cancel();
        }
    });
    signal
}

/// Creates the bundle store selected by the configuration.
async fn create_bundle_store(
    config: &EngineConfig,
    config_file: &Path,
) -> Result<Arc<dyn BundleStore>> {
    match config.state.backend {
        StateBackend::Local => {
            let path = config
                .state
                .path
                .clone()
                .unwrap_or_else(|| config_dir(config_file).join(".deploybox").join("bundles"));
            Ok(Arc::new(LocalBundleStore::with_base_dir(path)))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| ConfigError::validation("S3 bucket not configured", "state.bucket"))?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Ok(Arc::new(S3BundleStore::new(bucket, prefix, region).await))
        }
    }
}

/// Creates an authenticated management-plane client.
fn create_arm_client(config: &EngineConfig, clock: Arc<dyn Clock>) -> Result<ArmClient> {
    let principal = ServicePrincipal {
        tenant_id: config.azure.tenant_id.clone(),
        client_id: config.azure.client_id.clone(),
        client_secret: config.azure.client_secret.clone().ok_or_else(|| {
            ConfigError::MissingEnvVar {
                name: String::from(deploybox::config::ENV_CLIENT_SECRET),
            }
        })?,
    };

    let mut tokens = ClientCredentialsProvider::new(principal, clock)?;
    if let Some(url) = &config.azure.authority_url {
        tokens = tokens.with_authority_url(url);
    }

    let arm = ArmClient::new(Arc::new(tokens))?;
    Ok(match &config.azure.management_url {
        Some(url) => arm.with_base_url(url),
        None => arm,
    })
}

/// Builds the provider planners in merge order.
fn create_planners(config: &EngineConfig) -> Vec<Arc<dyn ProviderPlanner>> {
    vec![
        Arc::new(AzurePlanner::new(AzureProviderSettings {
            subscription_id: config.azure.subscription_id.clone(),
            tenant_id: config.azure.tenant_id.clone(),
            client_id: config.azure.client_id.clone(),
            client_secret: config.azure.client_secret.clone().unwrap_or_default(),
            location: config.azure.location.clone(),
            registry_name: config.azure.registry.as_ref().map(|r| r.name.clone()),
            registry_password: config.azure.registry.as_ref().and_then(|r| r.password.clone()),
        })),
        Arc::new(MongoAtlasPlanner::new(MongoAtlasSettings {
            public_key: config.mongodbatlas.public_key.clone(),
            private_key: config.mongodbatlas.private_key.clone().unwrap_or_default(),
            project_id: config.mongodbatlas.project_id.clone(),
        })),
    ]
}

/// Wires every collaborator of the deploy driver from configuration.
async fn create_driver(
    config: &EngineConfig,
    config_file: &Path,
    cancel: CancellationSignal,
) -> Result<DeployDriver> {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let registry = config.azure.registry.as_ref().ok_or_else(|| {
        ConfigError::validation("A container registry is required", "azure.registry")
    })?;

    let mut source = GitHubClient::new(config.change_detection.token.clone())?;
    if let Some(url) = &config.change_detection.api_url {
        source = source.with_base_url(url);
    }
    let detector = ChangeDetector::new(Arc::new(source), config.change_detection.policy);

    let builds = RegistryBuildService::new(
        create_arm_client(config, clock.clone())?,
        RegistryTarget {
            subscription_id: config.azure.subscription_id.clone(),
            resource_group: registry.resource_group.clone(),
            registry_name: registry.name.clone(),
            location: config.azure.location.clone(),
        },
    );
    let resolver = BuildResolver::new(Arc::new(builds), detector, clock)
        .with_policy(config.build.poll_policy())
        .with_cancellation(cancel);

    let planners = create_planners(config);
    let stacks: Arc<dyn StackRepository> = Arc::new(FileStackRepository::new(&config.stacks.dir));
    let store = create_bundle_store(config, config_file).await?;
    let executor = Arc::new(TerraformExecutor::new(&config.executor.binary));

    let driver = DeployDriver::new(stacks, store, planners, resolver, executor);
    debug!("{driver:?}");
    Ok(driver)
}
