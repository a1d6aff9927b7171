use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use webpilot_browser::{CommandResult, Dispatcher};
use webpilot_core::{Config, Paths};

#[derive(Parser)]
#[command(name = "webpilot")]
#[command(about = "AI-assisted browser automation over the Chrome DevTools Protocol", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a URL in the managed browser
    Navigate {
        /// URL to open
        url: String,
    },

    /// Perform a natural-language action on the current page
    Act {
        /// Instruction, e.g. "click the login button"
        #[arg(required = true, num_args = 1..)]
        instruction: Vec<String>,
    },

    /// Extract structured data from the current page
    Extract {
        /// What to extract, e.g. "get the product price"
        instruction: String,
        /// Optional flat JSON schema, e.g. '{"price":"number"}'
        schema: Option<String>,
    },

    /// List the actions available on the current page
    Observe {
        /// Query, e.g. "what can I click here"
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
    },

    /// Capture a screenshot of the current page
    Screenshot,

    /// Close the browser and clear ephemeral state (profile is preserved)
    Close,

    /// Delete the persistent browser profile
    CleanProfile,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                let _ = e.print();
                std::process::exit(0);
            }
            fail_fast(&e.to_string());
        }
    };

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    // Diagnostics go to stderr; stdout carries only the result JSON.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let paths = Paths::new();
    if let Err(e) = paths.ensure_dirs() {
        fail_fast(&format!("Cannot create {}: {}", paths.base.display(), e));
    }
    let config = match Config::load_or_default(&paths) {
        Ok(config) => config,
        Err(e) => fail_fast(&e.to_string()),
    };
    if let Err(e) = config.require_api_key() {
        fail_fast(&e.to_string());
    }
    if let Err(e) = webpilot_browser::session::require_browser(&paths).await {
        fail_fast(&e.to_string());
    }

    let mut dispatcher = Dispatcher::new(paths, &config);
    let result = run_command(&mut dispatcher, cli.command).await;
    print_result(&result);
}

/// Run the requested command, racing an interrupt. An interrupt takes the
/// same shutdown path as `close` so the browser is never orphaned.
async fn run_command(dispatcher: &mut Dispatcher, command: Commands) -> CommandResult {
    tokio::select! {
        result = dispatch(dispatcher, command) => result,
        _ = tokio::signal::ctrl_c() => {
            dispatcher.shutdown_on_interrupt().await;
            fail_fast("Interrupted");
        }
    }
}

async fn dispatch(dispatcher: &mut Dispatcher, command: Commands) -> CommandResult {
    match command {
        Commands::Navigate { url } => dispatcher.navigate(&url).await,
        Commands::Act { instruction } => dispatcher.act(&instruction.join(" ")).await,
        Commands::Extract { instruction, schema } => {
            dispatcher.extract(&instruction, schema.as_deref()).await
        }
        Commands::Observe { query } => dispatcher.observe(&query.join(" ")).await,
        Commands::Screenshot => dispatcher.screenshot().await,
        Commands::Close => dispatcher.close().await,
        Commands::CleanProfile => dispatcher.clean_profile().await,
    }
}

/// Handled results exit 0 either way; success JSON goes to stdout, failure
/// JSON to stderr.
fn print_result(result: &CommandResult) {
    let body = serde_json::to_string_pretty(result)
        .unwrap_or_else(|_| r#"{"success":false,"error":"serialization failure"}"#.to_string());
    if result.success {
        println!("{}", body);
    } else {
        eprintln!("{}", body);
    }
}

/// Top-level failure (usage error, unknown command, missing environment):
/// JSON error body on stderr, exit 1.
fn fail_fast(error: &str) -> ! {
    let body = json!({ "success": false, "error": error });
    eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    std::process::exit(1);
}
