//! Muster CLI: inspect SOP templates and run plans from the command line.
//!
//! Uses the same engine (muster-core) that embedding services use; `plan run`
//! wires simulated workers to every role so a template can be dry-run end to
//! end.

use clap::{Parser, Subcommand};
use muster_cli::commands;

/// Muster: SOP plan execution engine
#[derive(Parser)]
#[command(name = "muster", version, about = "Muster: SOP plan execution engine")]
pub struct Cli {
    /// Engine configuration file (YAML or JSON)
    #[arg(long, env = "MUSTER_CONFIG")]
    config: Option<String>,

    /// SQLite file for artifacts (in-memory when unset)
    #[arg(long, env = "MUSTER_DB_PATH")]
    db: Option<String>,

    /// Additional template directory
    #[arg(long, env = "MUSTER_TEMPLATE_DIR")]
    template_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect plan templates
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },

    /// Instantiate and run plans
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },

    /// Inspect stored artifacts
    Artifact {
        #[command(subcommand)]
        action: ArtifactAction,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// List registered templates (built-in and from template directories)
    List,
    /// Validate a template file without registering it
    Validate {
        /// Path to the template YAML/JSON file
        file: String,
    },
    /// Show the steps and dependencies of a template
    Show {
        /// Template name
        name: String,
        /// Template version (latest when omitted)
        #[arg(long)]
        version: Option<String>,
    },
}

#[derive(Subcommand)]
enum PlanAction {
    /// Run a plan to completion with simulated workers
    Run {
        /// Template name
        template: String,
        /// Template version (latest when omitted)
        #[arg(long)]
        version: Option<String>,
        /// Initial context entries as key=value (repeatable)
        #[arg(long = "context", short = 'c')]
        context: Vec<String>,
        /// Roles whose simulated worker fails its tasks (comma-separated)
        #[arg(long, value_delimiter = ',')]
        fail_role: Vec<String>,
        /// Simulated work time per task in milliseconds
        #[arg(long, default_value_t = 100)]
        delay_ms: u64,
        /// Print progress events while the plan runs
        #[arg(long, short = 'w')]
        watch: bool,
        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ArtifactAction {
    /// List artifact keys under a prefix
    List {
        /// Key prefix, e.g. `tasks/plan-…_`
        #[arg(long, default_value = "tasks/")]
        prefix: String,
    },
    /// Print one artifact
    Show {
        /// Artifact key
        key: String,
        /// Expected content type
        #[arg(long, default_value = "application/json")]
        content_type: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "muster_core=warn,muster_cli=info".into()),
        )
        .init();

    let options = commands::EngineOptions {
        config: cli.config,
        db: cli.db,
        template_dir: cli.template_dir,
    };

    let result = match cli.command {
        Commands::Template { action } => match action {
            TemplateAction::List => match commands::init_engine(&options) {
                Ok(engine) => commands::template::list(&engine),
                Err(e) => Err(e),
            },
            TemplateAction::Validate { file } => commands::template::validate(&file),
            TemplateAction::Show { name, version } => match commands::init_engine(&options) {
                Ok(engine) => commands::template::show(&engine, &name, version.as_deref()),
                Err(e) => Err(e),
            },
        },

        Commands::Plan { action } => match action {
            PlanAction::Run {
                template,
                version,
                context,
                fail_role,
                delay_ms,
                watch,
                json,
            } => match commands::init_engine(&options) {
                Ok(engine) => {
                    let run = commands::plan::RunOptions {
                        template,
                        version,
                        context,
                        fail_roles: fail_role,
                        delay_ms,
                        watch,
                        json,
                    };
                    commands::plan::run(engine, run).await
                }
                Err(e) => Err(e),
            },
        },

        Commands::Artifact { action } => match commands::init_engine(&options) {
            Ok(engine) => match action {
                ArtifactAction::List { prefix } => commands::artifact::list(&engine, &prefix).await,
                ArtifactAction::Show { key, content_type } => {
                    commands::artifact::show(&engine, &key, &content_type).await
                }
            },
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
