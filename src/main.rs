use clap::{Parser, Subcommand};
use lsp_types::Diagnostic;
use omnisharp_client::config::ClientOptions;
use omnisharp_client::install::Provisioner;
use omnisharp_client::logging::{LogConfig, init_logging};
use omnisharp_client::session::ClientSession;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use url::Url;

/// Provision, launch and query an OmniSharp-style analysis server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON options file (camelCase keys, see ClientOptions)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Server specifier: an absolute path, "latest" or a version (overrides the config file)
    #[arg(long, value_name = "SPEC", global = true)]
    server_path: Option<String>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Log file path (overrides OMNISHARP_CLIENT_LOG_FILE env var)
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the server the configured specifier resolves to
    Resolve,

    /// Install the configured server version if it is missing
    Install {
        /// Reinstall even when the version is already present
        #[arg(long)]
        force: bool,
    },

    /// Start a server for WORKSPACE and print diagnostics as JSON
    Check {
        /// Workspace directory, solution or project file
        workspace: PathBuf,

        /// Documents to validate; the whole workspace when none are given
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config = LogConfig::from_env().with_overrides(args.log_level, args.log_file);
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let options = match ClientOptions::load(args.config.as_deref()) {
        Ok(options) => options.with_overrides(args.server_path),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let result = match args.command {
        Command::Resolve => resolve(&options).await,
        Command::Install { force } => install(&options, force).await,
        Command::Check { workspace, files } => check(options, &workspace, &files).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn resolve(options: &ClientOptions) -> Result<(), Box<dyn std::error::Error>> {
    let resolved = Provisioner::from_options(options)
        .resolve(&options.path)
        .await?;
    print_json(&resolved)
}

async fn install(options: &ClientOptions, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let provisioned = Provisioner::from_options(options)
        .provision(&options.path, force)
        .await?;
    print_json(&provisioned)
}

async fn check(
    options: ClientOptions,
    workspace: &Path,
    files: &[PathBuf],
) -> Result<(), Box<dyn std::error::Error>> {
    let workspace = std::fs::canonicalize(workspace)?;
    let (session, _updates) = ClientSession::new(options);

    let diagnostics = run_then_shutdown(&session, async {
        let provisioned = session.start(&workspace).await?;
        info!(
            "Checking {} with server {}",
            workspace.display(),
            provisioned
                .server
                .version
                .as_ref()
                .map_or_else(|| "(custom)".to_string(), |v| v.to_string())
        );
        collect_diagnostics(&session, files).await
    })
    .await?;

    print_json(&diagnostics)
}

/// Run `work`, then stop the session whatever the outcome
async fn run_then_shutdown<T>(
    session: &ClientSession,
    work: impl Future<Output = Result<T, Box<dyn std::error::Error>>>,
) -> Result<T, Box<dyn std::error::Error>> {
    let outcome = work.await;
    let stopped = session.shutdown().await;
    let value = outcome?;
    stopped?;
    Ok(value)
}

async fn collect_diagnostics(
    session: &ClientSession,
    files: &[PathBuf],
) -> Result<BTreeMap<String, Vec<Diagnostic>>, Box<dyn std::error::Error>> {
    session.supervisor().wait_until_started().await?;

    if files.is_empty() {
        session.validate_workspace();
    }
    for file in files {
        let path = std::fs::canonicalize(file)?;
        let Ok(uri) = Url::from_file_path(&path) else {
            warn!("Skipping {}", path.display());
            continue;
        };
        let text = std::fs::read_to_string(&path)?;
        if !session.document_opened(&uri, "csharp", text).await {
            warn!("Not a C# document: {}", path.display());
        }
    }

    session.flush().await;
    Ok(session
        .diagnostics()
        .into_iter()
        .map(|(uri, diagnostics)| (uri.to_string(), diagnostics))
        .collect())
}

fn print_json(value: &impl Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
