//! Prism CLI - send commands to editor instances through the relay.
//!
//! Retryable errors are absorbed by the client transport's backoff
//! budget; only the terminal outcome reaches the user. Exit code 0 on
//! success, 1 otherwise.

use clap::{Parser, Subcommand};
use serde_json::Value;

use prism_client::{CallOptions, RelayClient};

#[derive(Parser)]
#[command(name = "prism")]
#[command(about = "Send commands to editor instances through the Prism relay")]
#[command(version)]
struct Cli {
    /// Relay host.
    #[arg(long, global = true, default_value = "127.0.0.1")]
    host: String,

    /// Relay port.
    #[arg(long, global = true, default_value_t = prism_proto::DEFAULT_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a command on an editor instance
    Call {
        /// Command name (opaque to the relay)
        command: String,

        /// Command parameters as a JSON object
        #[arg(short = 'P', long, default_value = "{}")]
        params: String,

        /// Target instance (defaults to the relay's default instance)
        #[arg(short, long)]
        instance: Option<String>,

        /// Per-call timeout in milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// List connected editor instances
    Instances,

    /// Set the default instance for untargeted calls
    SetDefault {
        /// Instance identifier (the project path)
        instance_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = RelayClient::new(&cli.host, cli.port);

    let result: Result<(), anyhow::Error> = match cli.command {
        Commands::Call {
            command,
            params,
            instance,
            timeout_ms,
        } => run_call(&client, &command, &params, instance, timeout_ms).await,
        Commands::Instances => run_instances(&client).await,
        Commands::SetDefault { instance_id } => {
            client.set_default(&instance_id).await.map_err(Into::into)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run_call(
    client: &RelayClient,
    command: &str,
    params: &str,
    instance: Option<String>,
    timeout_ms: Option<u64>,
) -> Result<(), anyhow::Error> {
    let params: Value = serde_json::from_str(params)
        .map_err(|e| anyhow::anyhow!("--params is not valid JSON: {e}"))?;

    let options = CallOptions {
        instance_id: instance,
        timeout_ms,
    };

    let data = client.call(command, params, options).await?;
    match data {
        Some(data) => println!("{}", data.get()),
        None => println!("{{}}"),
    }
    Ok(())
}

async fn run_instances(client: &RelayClient) -> Result<(), anyhow::Error> {
    let instances = client.list_instances().await?;
    println!("{}", serde_json::to_string_pretty(&instances)?);
    Ok(())
}
