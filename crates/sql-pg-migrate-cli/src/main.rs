//! sql-pg-migrate CLI - SQL Server and MySQL to PostgreSQL migration.

use clap::{Parser, Subcommand};
use sql_pg_migrate::config::CONFIG_TEMPLATE;
use sql_pg_migrate::{
    Config, ItemStatus, JsonLinesListener, MigrateError, MigrationReport, Orchestrator,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sql-pg-migrate")]
#[command(about = "Migrate SQL Server or MySQL schemas, data and routines to PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a migration
    Run {
        /// Override source schema
        #[arg(long)]
        source_schema: Option<String>,

        /// Override target schema
        #[arg(long)]
        target_schema: Option<String>,

        /// Override rows per transfer batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Dry run: introspect and print the planned statements without executing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate row counts between source and target
    Validate,

    /// Test database connections
    HealthCheck,

    /// Write a commented configuration template
    Init {
        /// Output path for configuration file [default: config.yaml]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, MigrateError> {
    let cli = Cli::parse();

    // Init does not need an existing config
    if let Commands::Init { output, force } = &cli.command {
        let output_path = output.clone().unwrap_or_else(|| PathBuf::from("config.yaml"));
        write_template(&output_path, *force)?;
        println!("Wrote configuration template to {}", output_path.display());
        return Ok(0);
    }

    setup_logging(&cli.verbosity, &cli.log_format).map_err(MigrateError::Config)?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Init { .. } => Ok(0),

        Commands::Run {
            source_schema,
            target_schema,
            batch_size,
            dry_run,
        } => {
            if let Some(schema) = source_schema {
                config.source.schema = Some(schema);
            }
            if let Some(schema) = target_schema {
                config.target.schema = schema;
            }
            if let Some(n) = batch_size {
                config.migration.batch_size = Some(n);
            }
            config.validate()?;

            let mut orchestrator = Orchestrator::new(config).await?;
            if cli.progress {
                orchestrator = orchestrator.with_progress(Arc::new(JsonLinesListener::stderr()));
            }

            if dry_run {
                let plan = orchestrator.plan().await?;
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&plan)?);
                } else {
                    for sql in &plan.statements {
                        println!("{};\n", sql);
                    }
                    println!("-- Transfer order: {}", plan.transfer_order.join(", "));
                    for routine in &plan.routines {
                        match &routine.stub_reason {
                            Some(reason) => {
                                println!("-- {} {}: stub ({})", routine.kind, routine.name, reason)
                            }
                            None => {
                                println!("-- {} {}", routine.kind, routine.name);
                                for sql in &routine.statements {
                                    println!("{};\n", sql);
                                }
                            }
                        }
                    }
                }
                return Ok(0);
            }

            let report = orchestrator.run().await?;
            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                print_report(&report);
            }
            Ok(report.exit_code())
        }

        Commands::Validate => {
            let orchestrator = Orchestrator::new(config).await?;
            let results = orchestrator.validate().await?;
            let mismatches = results.iter().filter(|r| !r.matches).count();

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                for r in &results {
                    println!(
                        "  {:<40} source={:<10} target={:<10} {}",
                        r.table,
                        r.source_rows,
                        r.target_rows,
                        if r.matches { "OK" } else { "MISMATCH" }
                    );
                }
            }

            if mismatches > 0 {
                return Err(MigrateError::Validation(format!(
                    "{} of {} tables have mismatched row counts",
                    mismatches,
                    results.len()
                )));
            }
            println!("Validation completed successfully");
            Ok(0)
        }

        Commands::HealthCheck => {
            let result = Orchestrator::health_check(&config).await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source ({}): {} ({}ms)",
                    config.source.r#type,
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::pool("health check failed", "connecting"));
            }
            Ok(0)
        }
    }
}

fn write_template(path: &Path, force: bool) -> Result<(), MigrateError> {
    if path.exists() && !force {
        return Err(MigrateError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    std::fs::write(path, CONFIG_TEMPLATE)?;
    Ok(())
}

fn print_report(report: &MigrationReport) {
    println!("\nMigration {}", report.status().replace('_', " "));
    println!("  Run ID: {}", report.run_id);
    println!("  Duration: {:.2}s", report.duration_seconds);
    println!("  Rows: {}", report.rows_transferred);
    for s in &report.summary {
        println!(
            "  {:<14} {} succeeded, {} failed, {} stubbed, {} skipped",
            format!("{:?}:", s.category),
            s.succeeded,
            s.failed,
            s.stubbed,
            s.skipped
        );
    }
    let problems: Vec<_> = report
        .outcomes
        .iter()
        .filter(|o| matches!(o.status, ItemStatus::Failed | ItemStatus::Stubbed))
        .collect();
    if !problems.is_empty() {
        println!("\n  Items needing attention:");
        for o in problems {
            println!(
                "    [{:?}] {} {}: {}",
                o.category,
                o.item,
                if o.status == ItemStatus::Stubbed { "stubbed" } else { "failed" },
                o.message.as_deref().unwrap_or("")
            );
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        other => return Err(format!("invalid verbosity '{}'", other)),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("invalid log format '{}'", other)),
    }
    Ok(())
}
