use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lessonforge::cli::CommandContext;
use lessonforge::cli::commands::{self, submit::SubmitArgs};

#[derive(Parser)]
#[command(name = "lessonforge")]
#[command(
    version,
    about = "Generate structured lessons with a multi-agent LLM pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of the global/project chain
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, short, global = true)]
    quiet: bool,
}

#[derive(Args)]
struct LessonArgs {
    #[arg(help = "Lesson topic")]
    topic: String,
    #[arg(short = 'n', long, default_value = "4", help = "Number of sections")]
    sections: u32,
    #[arg(long, help = "Extra guidance for the planner")]
    details: Option<String>,
    #[arg(long, help = "Learner level (beginner, intermediate, advanced)")]
    level: Option<String>,
    #[arg(long, value_delimiter = ',', help = "Teaching styles, comma separated")]
    styles: Vec<String>,
    #[arg(long, value_delimiter = ',', help = "Output languages, comma separated")]
    languages: Vec<String>,
    #[arg(long, value_delimiter = ',', help = "Allowed widget kinds, comma separated")]
    widgets: Vec<String>,
    #[arg(long, help = "Blueprint name")]
    blueprint: Option<String>,
    #[arg(long, env = "LESSONFORGE_USER", help = "User the job is billed to")]
    user: Option<String>,
}

impl From<LessonArgs> for SubmitArgs {
    fn from(args: LessonArgs) -> Self {
        Self {
            topic: args.topic,
            sections: args.sections,
            details: args.details,
            level: args.level,
            styles: args.styles,
            languages: args.languages,
            widgets: args.widgets,
            blueprint: args.blueprint,
            user: args.user,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize lessonforge in the current directory
    Init {
        #[arg(long, short, help = "Re-initialize an existing project")]
        force: bool,
    },

    /// Generate a lesson in-process and print the document
    Run {
        #[command(flatten)]
        lesson: LessonArgs,
        #[arg(long, short, help = "Write the lesson JSON to this file")]
        output: Option<PathBuf>,
    },

    /// Queue a lesson job for a worker
    Submit {
        #[command(flatten)]
        lesson: LessonArgs,
        #[arg(short = 'f', long, default_value = "text", help = "Output format: text, json")]
        format: String,
    },

    /// Process queued jobs
    Worker {
        #[arg(long, help = "Process one batch and exit")]
        once: bool,
    },

    /// Show a job, or list recent jobs
    Status {
        #[arg(help = "Job id")]
        id: Option<String>,
        #[arg(long, help = "Filter the list by status")]
        status: Option<String>,
        #[arg(short = 'l', long, default_value = "20", help = "Maximum jobs listed")]
        limit: usize,
        #[arg(short = 'f', long, default_value = "text", help = "Output format: text, json")]
        format: String,
    },

    /// Cancel a queued or running job
    Cancel {
        #[arg(help = "Job id")]
        id: String,
    },

    /// Requeue a failed or canceled job
    Retry {
        #[arg(help = "Job id")]
        id: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration (merged from all sources)
    Show {
        #[arg(short = 'f', long, default_value = "toml", help = "Output format: toml, json")]
        format: String,
    },
    /// Show configuration file paths
    Path,
    /// Write the default project config
    Init,
}

/// Set up panic handler for graceful error reporting
fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("\n\x1b[1;31m━━━ PANIC ━━━\x1b[0m");
        eprintln!("\x1b[31mlessonforge encountered an unexpected error:\x1b[0m");
        eprintln!("  {}", message);

        if let Some(location) = panic_info.location() {
            eprintln!(
                "\x1b[90mLocation: {}:{}:{}\x1b[0m",
                location.file(),
                location.line(),
                location.column()
            );
        }
        eprintln!();

        // Backtrace when RUST_BACKTRACE=1
        default_hook(panic_info);
    }));
}

fn main() -> ExitCode {
    setup_panic_handler();

    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\x1b[31mError:\x1b[0m {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "lessonforge=debug,info"
    } else if cli.quiet {
        "error"
    } else {
        "warn,lessonforge=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
        }
        Commands::Run { lesson, output } => {
            let ctx = CommandContext::load(config_path)?;
            let rt = Runtime::new()?;
            rt.block_on(commands::run::run(&ctx, &SubmitArgs::from(lesson), output.as_deref()))?;
        }
        Commands::Submit { lesson, format } => {
            let ctx = CommandContext::load(config_path)?;
            commands::submit::run(&ctx, &SubmitArgs::from(lesson), &format)?;
        }
        Commands::Worker { once } => {
            let ctx = CommandContext::load(config_path)?;
            let rt = Runtime::new()?;
            rt.block_on(commands::worker::run(&ctx, once))?;
        }
        Commands::Status {
            id,
            status,
            limit,
            format,
        } => {
            let ctx = CommandContext::load(config_path)?;
            match id {
                Some(id) => commands::status::show(&ctx, &id, &format)?,
                None => commands::status::list(&ctx, status.as_deref(), limit, &format)?,
            }
        }
        Commands::Cancel { id } => {
            let ctx = CommandContext::load(config_path)?;
            commands::cancel::run(&ctx, &id)?;
        }
        Commands::Retry { id } => {
            let ctx = CommandContext::load(config_path)?;
            commands::retry::run(&ctx, &id)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { format } => {
                commands::config::show(config_path, &format)?;
            }
            ConfigAction::Path => {
                commands::config::path()?;
            }
            ConfigAction::Init => {
                commands::config::init()?;
            }
        },
    }

    Ok(())
}
