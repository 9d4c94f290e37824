use anyhow::Result;
use clap::{Parser, Subcommand};
use corvid_core::{ChatError, Orchestrator, SecurityGate, ToolRegistry, config, tools};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "corvid")]
#[command(about = "corvid - session chat backend with tool-calling", long_about = None)]
struct Cli {
    /// Acting user identity (the transport normally supplies this).
    #[arg(short, long, default_value = "local", global = true)]
    user: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message, or start an interactive session.
    Chat {
        #[arg(short, long)]
        message: Option<String>,
        #[arg(short, long)]
        session: Option<String>,
    },
    /// List active sessions.
    Sessions,
    /// Print a session transcript.
    History {
        session: String,
    },
    /// Delete a session.
    Delete {
        session: String,
    },
    /// Security gate counters.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Chat {
        message: None,
        session: None,
    });

    let cfg = config::Config::load_or_init()?;
    let orchestrator = build_orchestrator(&cfg).await?;

    match command {
        Commands::Chat { message, session } => {
            if let Some(message) = message {
                run_turn(&orchestrator, &cli.user, session.as_deref(), &message).await;
            } else {
                interactive_loop(&orchestrator, &cli.user, session).await;
            }
        }
        Commands::Sessions => {
            let sessions = orchestrator.list_sessions(&cli.user).await?;
            if sessions.is_empty() {
                println!("No active sessions.");
            }
            for session in sessions {
                println!(
                    "{}  {}  (last active {})",
                    session.id,
                    session.title,
                    session.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::History { session } => {
            let messages = orchestrator
                .session_messages(&cli.user, &session, None, None)
                .await?;
            for message in messages {
                println!("[{}] {}", message.role, message.content);
            }
        }
        Commands::Delete { session } => {
            orchestrator.delete_session(&cli.user, &session).await?;
            println!("Session deleted.");
        }
        Commands::Stats => {
            let stats = orchestrator.security_stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

async fn build_orchestrator(cfg: &config::Config) -> Result<Arc<Orchestrator>> {
    let provider = corvid_core::create_provider(cfg)?;
    let store = corvid_core::create_store(cfg).await?;

    let registry = Arc::new(ToolRegistry::new(Duration::from_secs(
        cfg.limits.tool_invocation_timeout_secs,
    )));
    registry.register(Box::new(tools::CalculatorTool));
    registry.register(Box::new(tools::ClockTool));
    registry.register(Box::new(tools::WebSearchTool::new()));
    let weather_key = cfg
        .weather_api_key
        .clone()
        .or_else(|| std::env::var("OPENWEATHER_API_KEY").ok());
    registry.register(Box::new(tools::WeatherTool::new(weather_key)));

    let gate = Arc::new(SecurityGate::new(cfg.security));

    Ok(Arc::new(Orchestrator::new(
        provider,
        store,
        registry,
        gate,
        cfg.limits,
    )))
}

async fn run_turn(
    orchestrator: &Orchestrator,
    user: &str,
    session: Option<&str>,
    message: &str,
) -> Option<String> {
    match orchestrator.submit_message(user, session, message, None).await {
        Ok(outcome) => {
            println!("{}", outcome.reply);
            if let Some(tokens) = outcome.tokens_used {
                println!("  ({} tokens, session {})", tokens, outcome.session_id);
            }
            Some(outcome.session_id)
        }
        Err(e) => {
            report_error(&e);
            session.map(|s| s.to_string())
        }
    }
}

async fn interactive_loop(orchestrator: &Orchestrator, user: &str, mut session: Option<String>) {
    println!("corvid chat");
    println!("Type your message (Ctrl+D to exit):\n");

    use std::io::{self, BufRead};
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut stdout_lock = stdout.lock();

    loop {
        print!("> ");
        let _ = stdout_lock.flush();

        let mut input = String::new();
        let mut reader = stdin.lock();

        match reader.read_line(&mut input) {
            Ok(0) => {
                println!("\n👋 Goodbye!");
                break;
            }
            Ok(_) => {
                let input = input.trim();
                if input.is_empty() {
                    continue;
                }
                session = run_turn(orchestrator, user, session.as_deref(), input).await;
                println!();
            }
            Err(_) => {
                println!("\n👋 Goodbye!");
                break;
            }
        }
    }
}

fn report_error(e: &ChatError) {
    eprintln!("❌ {}", e.user_message());
}
