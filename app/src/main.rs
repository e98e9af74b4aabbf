use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use app_lib::relay::{self, RelayConfig};
use app_lib::{HostError, TalkOptions};
use vl_core::domain::types::SynthesisStrategy;

/// voice-loop - speech in, model reply out, speech back
#[derive(Parser)]
#[command(name = "voice-loop", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum SynthesisArg {
    Native,
    Worker,
}

impl From<SynthesisArg> for SynthesisStrategy {
    fn from(arg: SynthesisArg) -> Self {
        match arg {
            SynthesisArg::Native => SynthesisStrategy::Native,
            SynthesisArg::Worker => SynthesisStrategy::Worker,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve the completion endpoint (POST /api/chat)
    Serve {
        /// Address to listen on
        #[arg(long, env = "VL_BIND", default_value = "127.0.0.1:3000")]
        bind: SocketAddr,
        /// Upstream API key
        #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
        /// Upstream chat-completions URL
        #[arg(long, env = "VL_UPSTREAM_URL", default_value = relay::DEFAULT_UPSTREAM_URL)]
        upstream_url: String,
        /// Upstream model
        #[arg(long, default_value = relay::DEFAULT_MODEL)]
        model: String,
        /// Upstream request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },
    /// Run the voice loop on the console; typed lines act as speech
    Talk {
        /// Settings file (defaults to the user config dir)
        #[arg(long, env = "VL_SETTINGS_PATH")]
        settings: Option<PathBuf>,
        /// Completion endpoint URL
        #[arg(long, env = "VL_COMPLETION_ENDPOINT")]
        endpoint: Option<String>,
        /// Speech synthesis strategy
        #[arg(long, value_enum)]
        synthesis: Option<SynthesisArg>,
        /// Completion timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Recognition and speech language
        #[arg(long)]
        language: Option<String>,
        /// Console speech pace, milliseconds per word
        #[arg(long, default_value = "150")]
        word_ms: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "info,vl_core=debug,app_lib=debug",
        _ => "debug",
    };

    // stdout はイベント行専用
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), HostError> {
    match cli.command {
        Command::Serve {
            bind,
            api_key,
            upstream_url,
            model,
            timeout_secs,
        } => {
            let config = RelayConfig {
                api_key,
                upstream_url,
                model,
                timeout: Duration::from_secs(timeout_secs),
            };
            relay::serve(bind, config).await
        }
        Command::Talk {
            settings,
            endpoint,
            synthesis,
            timeout_secs,
            language,
            word_ms,
        } => {
            app_lib::talk(TalkOptions {
                settings_path: settings,
                endpoint,
                synthesis: synthesis.map(Into::into),
                timeout_secs,
                language,
                word_ms,
            })
            .await
        }
    }
}
