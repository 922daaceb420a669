// Main binary for the hiveflow engine
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

mod cmd;

#[derive(Parser, Debug)]
#[command(author, version, about = "Hiveflow crowd workflow engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a development engine over in-memory storage
    Serve(cmd::serve::ServeArgs),
    /// Show version and build information
    Status,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hiveflow={default_level}")));
    registry().with(filter).with(fmt::layer()).init();

    match cli.command {
        Some(Commands::Serve(args)) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(cmd::serve::run(args))
        }
        Some(Commands::Status) | None => {
            print_status();
            Ok(())
        }
    }
}

fn print_status() {
    println!("Hiveflow {}", env!("CARGO_PKG_VERSION"));
    println!("Run 'hiveflow serve' to start a development engine.");
}
