use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use console::{style, Emoji};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dicom_printscp::config::ServerConfig;
use dicom_printscp::job::FileJobSink;
use dicom_printscp::server::PrintServer;

static PRINTER: Emoji<'_, '_> = Emoji("🖨  ", "");

/// Exit code for invalid configuration.
const EXIT_CONFIG: i32 = 64;
/// Exit code for a failed bind.
const EXIT_BIND: i32 = 70;

#[derive(Parser)]
#[command(name = "printscp")]
#[command(about = "A DICOM Basic Print Management SCP")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the print SCP
    Serve(ServeArgs),
}

#[derive(Args, Clone)]
struct ServeArgs {
    /// JSON configuration file (defaults to $PRINTSCP_CONFIG if set)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// AE title of this SCP
    #[arg(short = 'a', long)]
    ae_title: Option<String>,

    /// Maximum number of concurrent associations
    #[arg(long = "max-assoc")]
    max_assoc: Option<usize>,

    /// Maximum PDU length offered during negotiation, in bytes
    #[arg(long = "pdu-size")]
    pdu_size: Option<u32>,

    /// Seconds without traffic before an open association is aborted
    #[arg(long = "idle-timeout")]
    idle_timeout: Option<u64>,

    /// Directory for assembled pages and job records
    #[arg(short, long = "output-dir")]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_env("PRINTSCP_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) {
    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ae_title) = args.ae_title {
        config.ae_title = ae_title;
    }
    if let Some(max_assoc) = args.max_assoc {
        config.max_associations = max_assoc;
    }
    if let Some(pdu_size) = args.pdu_size {
        config.max_pdu_length = pdu_size;
    }
    if let Some(idle_timeout) = args.idle_timeout {
        config.idle_timeout_secs = idle_timeout;
    }
    if let Some(output_dir) = args.output_dir {
        config.output_dir = output_dir;
    }

    if let Err(e) = config.validate() {
        eprintln!("configuration error: {e}");
        std::process::exit(EXIT_CONFIG);
    }

    println!("{}DICOM Print SCP", PRINTER);
    println!("AE Title:   {}", style(&config.ae_title).green());
    println!("Port:       {}", style(config.port).green());
    println!("Output dir: {}", style(config.output_dir.display()).green());

    let sink = Arc::new(FileJobSink::new(config.output_dir.clone()));
    let server = match PrintServer::bind(config, sink).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("could not bind listener: {e}");
            std::process::exit(EXIT_BIND);
        }
    };

    info!("print SCP starting");
    if let Err(e) = server.run().await {
        eprintln!("server error: {e:#}");
        std::process::exit(1);
    }
}

fn load_config(args: &ServeArgs) -> Result<ServerConfig, anyhow::Error> {
    match &args.config {
        Some(path) => Ok(ServerConfig::from_file(path)?),
        None => Ok(ServerConfig::from_env()?),
    }
}
