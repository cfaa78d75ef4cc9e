use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use request_pipeline::http::Request;
use request_pipeline::lockfile::generate_lock;
use request_pipeline::manifest::Manifest;
use request_pipeline::observability::log_snapshot;
use request_pipeline::pipeline::StageRegistry;
use request_pipeline::stages;
use request_pipeline::validation::validate_manifest;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Dispatch {
            manifest,
            request,
            method,
            path,
            params,
            headers,
            body,
            print_metrics,
            metrics_json,
            metrics_prometheus,
        } => {
            let overrides = RequestOverrides {
                method,
                path,
                params,
                headers,
                body,
            };
            dispatch(
                manifest,
                request,
                overrides,
                print_metrics,
                metrics_json,
                metrics_prometheus,
            )
        }
        Commands::ListStages => {
            list_stages();
            Ok(())
        }
        Commands::Validate { manifest } => validate_manifest_cmd(manifest),
        Commands::Lock { manifest, output } => lock_manifest(manifest, output),
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "request-pipeline",
                &mut io::stdout(),
            );
            Ok(())
        }
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

struct RequestOverrides {
    method: Option<String>,
    path: Option<String>,
    params: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

fn load_request(request_path: Option<&Path>, overrides: RequestOverrides) -> Result<Request> {
    let mut request = match request_path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read request file: {}", path.display()))?;
            serde_json::from_str::<Request>(&content)
                .with_context(|| format!("Failed to parse request JSON: {}", path.display()))?
        }
        None => Request::new("GET", "/"),
    };

    if let Some(method) = overrides.method {
        request.method = method;
    }
    if let Some(path) = overrides.path {
        request.path = path;
    }
    if let Some(body) = overrides.body {
        request.body = body;
    }
    request.params.extend(overrides.params);
    request.headers.extend(overrides.headers);
    request.normalize();

    if request.method.is_empty() {
        bail!("Request method cannot be empty");
    }
    Ok(request)
}

fn dispatch(
    manifest_path: PathBuf,
    request_path: Option<PathBuf>,
    overrides: RequestOverrides,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
) -> Result<()> {
    let manifest = Manifest::load(&manifest_path)?;
    let registry = build_registry();
    let pipeline = manifest
        .build(&registry)
        .with_context(|| format!("Failed to build pipeline from {}", manifest_path.display()))?;
    info!(
        manifest = manifest.display_name(),
        stages = ?pipeline.stage_names(),
        "Pipeline ready"
    );

    let request = load_request(request_path.as_deref(), overrides)?;
    let response = pipeline.handle(request);
    info!(status = response.status, "Request dispatched");

    to_writer_pretty(io::stdout(), &response).context("Failed to write response")?;
    println!();

    if print_metrics || metrics_json.is_some() || metrics_prometheus.is_some() {
        let snapshot = pipeline.metrics().snapshot();
        if print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = metrics_json {
            ensure_parent(&path, "metrics")?;
            let file = File::create(&path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            to_writer_pretty(file, &snapshot)
                .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = metrics_prometheus {
            ensure_parent(&path, "metrics")?;
            let content = snapshot.to_prometheus();
            std::fs::write(&path, content).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    Ok(())
}

fn ensure_parent(path: &Path, label: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create {label} directory: {}", parent.display())
        })?;
    }
    Ok(())
}

fn list_stages() {
    let registry = build_registry();
    println!("Available stages:");
    for name in registry.known_stages() {
        println!("- {name}");
    }
}

fn validate_manifest_cmd(manifest_path: PathBuf) -> Result<()> {
    let manifest = Manifest::load(&manifest_path)?;
    let registry = build_registry();
    let report = validate_manifest(&manifest, &registry);

    for warning in &report.warnings {
        warn!(file = %manifest_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %manifest_path.display(), "Manifest validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %manifest_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Manifest validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn lock_manifest(manifest_path: PathBuf, output_path: PathBuf) -> Result<()> {
    let manifest = Manifest::load(&manifest_path)?;
    let registry = build_registry();
    let report = validate_manifest(&manifest, &registry);

    for warning in &report.warnings {
        warn!(file = %manifest_path.display(), "{warning}");
    }

    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %manifest_path.display(), "{error_msg}");
        }
        return Err(anyhow!(
            "Cannot generate lockfile due to {} validation error(s)",
            report.errors.len()
        ));
    }

    ensure_parent(&output_path, "lockfile")?;
    generate_lock(&manifest, &output_path)?;
    info!(
        lockfile = %output_path.display(),
        "Lockfile generated successfully"
    );
    Ok(())
}

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.trim().is_empty() {
        return Err(format!("key cannot be empty in '{raw}'"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

#[derive(Parser)]
#[command(
    name = "request-pipeline",
    version,
    about = "Middleware pipeline runner: load a stage manifest and dispatch requests through it"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch one request through the manifest's pipeline and print the response as JSON
    Dispatch {
        manifest: PathBuf,
        /// JSON file describing the request
        #[arg(long)]
        request: Option<PathBuf>,
        #[arg(long)]
        method: Option<String>,
        #[arg(long)]
        path: Option<String>,
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        params: Vec<(String, String)>,
        #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_key_value)]
        headers: Vec<(String, String)>,
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
    },
    ListStages,
    Validate {
        manifest: PathBuf,
    },
    Lock {
        manifest: PathBuf,
        output: PathBuf,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
