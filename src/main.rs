//! konform - cluster-conformance test orchestrator CLI

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::Client;
use rand::distributions::Slice;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use konform::checks;
use konform::config::{effective_distributions, Options, OptionsFile};
use konform::metrics::MetricsSink;
use konform::provision::kube::{
    KubeClusterInspector, KubeClusterProvisioner, KubeMachineProvisioner,
};
use konform::provision::ClusterProvisioner;
use konform::runner::executor::Executor;
use konform::runner::results::{merge_results, ResultsFile};
use konform::runner::{print_summary, TestRunner};
use konform::scenario::generator::{keep_only_failed, Generator};
use konform::scenario::{CloudProvider, ContainerRuntime, KubernetesVersion, OperatingSystem};

/// konform - end-to-end cluster-conformance test orchestrator
#[derive(Parser, Debug)]
#[command(name = "konform", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Optional YAML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cloud providers to test
    #[arg(long, value_delimiter = ',')]
    providers: Vec<CloudProvider>,

    /// Operating systems to test (mutually exclusive with
    /// --exclude-distributions)
    #[arg(long, value_delimiter = ',')]
    distributions: Vec<OperatingSystem>,

    /// Operating systems to exclude from testing
    #[arg(long, value_delimiter = ',')]
    exclude_distributions: Vec<OperatingSystem>,

    /// Container runtimes to test
    #[arg(long, value_delimiter = ',')]
    runtimes: Vec<ContainerRuntime>,

    /// Kubernetes versions to test
    #[arg(long, value_delimiter = ',')]
    versions: Vec<KubernetesVersion>,

    /// Enable dual-stack networking for all scenarios
    #[arg(long)]
    dual_stack: bool,

    /// Enable the operating-system-manager
    #[arg(long)]
    enable_osm: bool,

    /// Checks to exclude from the battery
    #[arg(long, value_delimiter = ',')]
    exclude_checks: Vec<String>,

    /// Number of clusters to test in parallel
    #[arg(long)]
    parallel: Option<usize>,

    /// Number of worker nodes per cluster
    #[arg(long)]
    nodes: Option<u32>,

    /// Prefix for all generated cluster names
    #[arg(long)]
    name_prefix: Option<String>,

    /// Existing project to use; a fresh one is created and deleted when
    /// not given
    #[arg(long)]
    project: Option<String>,

    /// Directory receiving one JUnit XML report per scenario
    #[arg(long)]
    reports_root: Option<PathBuf>,

    /// Results-status file; written after the run, read by --retry-failed
    #[arg(long)]
    results_file: Option<PathBuf>,

    /// Only run scenarios that did not pass in the previous run
    #[arg(long)]
    retry_failed: bool,

    /// Keep clusters after testing instead of tearing them down
    #[arg(long)]
    keep_clusters: bool,

    /// Control-plane readiness timeout in seconds
    #[arg(long)]
    control_plane_timeout: Option<u64>,

    /// Node readiness budget in seconds, shared by the node and workload
    /// waits
    #[arg(long)]
    node_ready_timeout: Option<u64>,

    /// Per-check timeout in seconds
    #[arg(long)]
    check_timeout: Option<u64>,

    /// OTLP endpoint for runtime metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Expand a provider option tree into flavor files
    ///
    /// Reads a YAML tree of option-name to list-of-values (nested maps group
    /// options) and emits one flavor per combination of leaf choices, named
    /// deterministically from the chosen values.
    Flavors(FlavorsArgs),
}

/// Flavor expansion arguments
#[derive(Parser, Debug)]
struct FlavorsArgs {
    /// YAML file holding the option tree
    #[arg(short = 'f', long = "options")]
    options_file: PathBuf,

    /// Directory to write one `<name>.yaml` file per combination into;
    /// names are printed to stdout when omitted
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,
}

/// Expand an option tree into flavor files or a flavor listing
async fn run_flavors(args: FlavorsArgs) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(&args.options_file)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read options file {:?}: {e}", args.options_file))?;
    let tree: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|e| anyhow::anyhow!("invalid options file: {e}"))?;

    let combinations =
        konform::scenario::matrix::expand(&tree).map_err(|e| anyhow::anyhow!("{e}"))?;

    match &args.output {
        Some(dir) => {
            tokio::fs::create_dir_all(dir).await?;
            for combination in &combinations {
                let path = dir.join(format!("{}.yaml", combination.name));
                let body = serde_yaml::to_string(&combination.choices)
                    .map_err(|e| anyhow::anyhow!("failed to serialize flavor: {e}"))?;
                tokio::fs::write(&path, body).await?;
            }
            info!(count = combinations.len(), dir = %dir.display(), "Wrote flavor files");
        }
        None => {
            for combination in &combinations {
                println!("{}", combination.name);
            }
        }
    }
    Ok(())
}

impl Cli {
    /// Layer the flags over `options`; only explicitly given flags override
    fn apply(&self, options: &mut Options) -> anyhow::Result<()> {
        if !self.providers.is_empty() {
            options.providers = self.providers.iter().copied().collect();
        }
        if !self.distributions.is_empty() || !self.exclude_distributions.is_empty() {
            options.distributions =
                effective_distributions(&self.distributions, &self.exclude_distributions)
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        if !self.runtimes.is_empty() {
            options.container_runtimes = self.runtimes.iter().copied().collect();
        }
        if !self.versions.is_empty() {
            options.versions = self.versions.clone();
        }
        if self.dual_stack {
            options.dual_stack = true;
        }
        if self.enable_osm {
            options.operating_system_manager = true;
        }
        if !self.exclude_checks.is_empty() {
            options.excluded_checks = self.exclude_checks.iter().cloned().collect();
        }
        if let Some(parallel) = self.parallel {
            options.parallelism = parallel;
        }
        if let Some(nodes) = self.nodes {
            options.node_count = nodes;
        }
        if let Some(prefix) = &self.name_prefix {
            options.name_prefix = prefix.clone();
        }
        if let Some(project) = &self.project {
            options.project = Some(project.clone());
        }
        if let Some(root) = &self.reports_root {
            options.reports_root = root.clone();
        }
        if let Some(file) = &self.results_file {
            options.results_file = Some(file.clone());
        }
        if self.retry_failed {
            options.retry_failed = true;
        }
        if self.keep_clusters {
            options.delete_cluster_after_tests = false;
        }
        if let Some(secs) = self.control_plane_timeout {
            options.control_plane_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.node_ready_timeout {
            options.node_ready_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.check_timeout {
            options.check_timeout = Duration::from_secs(secs);
        }
        if let Some(endpoint) = &self.otlp_endpoint {
            options.metrics.otlp_endpoint = Some(endpoint.clone());
        }
        Ok(())
    }
}

/// Fill dimensions neither the file nor the flags set
fn apply_defaults(options: &mut Options) {
    if options.providers.is_empty() {
        options.providers = CloudProvider::all().iter().copied().collect();
    }
    if options.distributions.is_empty() {
        options.distributions = [OperatingSystem::Ubuntu, OperatingSystem::Flatcar].into();
    }
    if options.versions.is_empty() {
        options.versions = ["1.30", "1.31", "1.32", "1.33"]
            .iter()
            .map(|v| v.parse().expect("default versions parse"))
            .collect();
    }
}

fn random_project_name() -> String {
    const CHARSET: &[char] = &[
        'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
        's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
    ];
    let sampler = Slice::new(CHARSET).expect("charset is non-empty");
    let suffix: String = rand::thread_rng().sample_iter(&sampler).take(5).collect();
    format!("e2e-{suffix}")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut cli = Cli::parse();

    if let Some(Commands::Flavors(args)) = cli.command.take() {
        return run_flavors(args).await;
    }

    // Resolve configuration: defaults, then file, then flags
    let mut options = Options::default();
    if let Some(path) = &cli.config {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read config file {path:?}: {e}"))?;
        OptionsFile::from_yaml(&content)
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .apply(&mut options);
    }
    cli.apply(&mut options)?;
    apply_defaults(&mut options);
    options.validate().map_err(|e| anyhow::anyhow!("{e}"))?;

    // CI metadata travels with the runtime metrics
    options.metrics.job_name = std::env::var("JOB_NAME").ok();
    options.metrics.job_run_id = std::env::var("JOB_RUN_ID").ok();

    info!(
        providers = ?options.providers,
        distributions = ?options.distributions,
        runtimes = ?options.container_runtimes,
        versions = ?options.versions,
        dualstack = options.dual_stack,
        parallelism = options.parallelism,
        "Runner configuration"
    );

    tokio::fs::create_dir_all(&options.reports_root)
        .await
        .map_err(|e| anyhow::anyhow!("failed to create reports root: {e}"))?;

    // Generate the scenario matrix
    let mut generator = Generator::new()
        .with_providers(options.providers.iter().copied())
        .with_operating_systems(options.distributions.iter().copied())
        .with_container_runtimes(options.container_runtimes.iter().copied())
        .with_versions(options.versions.iter().copied())
        .with_dual_stack(options.dual_stack)
        .with_operating_system_manager(options.operating_system_manager);
    for (provider, datacenter) in &options.datacenters {
        generator = generator.with_datacenter(*provider, datacenter.clone());
    }
    let mut scenarios = generator.generate().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Optionally restrict to scenarios that did not pass previously
    let mut previous_results = None;
    if options.retry_failed {
        let path = options
            .results_file
            .as_ref()
            .expect("validated: retry-failed requires a results file");
        previous_results = ResultsFile::load(path).map_err(|e| anyhow::anyhow!("{e}"))?;
        if let Some(previous) = &previous_results {
            scenarios = keep_only_failed(scenarios, previous, &options.test_configuration());
        }
        if scenarios.is_empty() {
            info!("Every scenario passed in the previous run, nothing to do");
            return Ok(());
        }
    }

    // Root cancellation signal; teardown deliberately ignores it
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling in-flight scenarios");
            signal_token.cancel();
        }
    });

    // Wire up the collaborators
    let metrics = Arc::new(
        MetricsSink::new(&options.metrics).map_err(|e| anyhow::anyhow!("{e}"))?,
    );
    let host = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let (project, created_project) = match &options.project {
        Some(existing) => (existing.clone(), false),
        None => (random_project_name(), true),
    };
    let provisioner = Arc::new(KubeClusterProvisioner::new(host.clone(), project.clone()));
    if created_project {
        provisioner
            .create_project(&project)
            .await
            .map_err(|e| anyhow::anyhow!("failed to create project: {e}"))?;
    }
    info!(project = %project, "Using project");

    let check_battery = checks::default_checks(&options.excluded_checks);
    let check_names: BTreeSet<String> = check_battery.iter().map(|c| c.name()).collect();
    info!(checks = ?check_names, "Enabled checks");

    let executor = Executor::new(
        provisioner.clone(),
        Arc::new(KubeMachineProvisioner),
        Arc::new(KubeClusterInspector::new(host)),
        check_battery,
        metrics.clone(),
        options.executor_options(),
    );
    let runner = TestRunner::new(Arc::new(executor), options.parallelism);

    // Run the whole suite; the pool drains regardless of failures
    info!("Running conformance scenarios...");
    let started = std::time::Instant::now();
    let results = runner.run(scenarios, &cancel).await;

    // Persist the results-status file, never shrinking it
    if let Some(path) = &options.results_file {
        let mut file = ResultsFile::from_results(options.test_configuration(), &results);
        if let Some(previous) = &previous_results {
            file = merge_results(previous, &file);
        }
        info!(path = %path.display(), "Writing results file");
        if let Err(err) = file.write(path) {
            warn!(error = %err, "Failed to write results file");
        }
    }

    let tally = print_summary(&results);
    info!(elapsed = ?started.elapsed(), "Suite finished");

    // The project is cleaned up even after an interrupt
    if created_project {
        if let Err(err) = provisioner.delete_project(&project).await {
            warn!(project = %project, error = %err, "Failed to delete project");
        }
    }

    metrics.shutdown();

    if tally.has_failures() {
        anyhow::bail!("some scenarios failed");
    }
    Ok(())
}
