use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use kinetic_graph::helpdesk::build_helpdesk;
use kinetic_graph::{ConfigLoader, EngineConfig, Update};
use tokio_stream::StreamExt;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer a question with the help-desk workflow
    Run {
        /// Path to an engine config file (YAML)
        #[arg(short, long)]
        config: Option<String>,

        /// The question to answer
        #[arg(short, long)]
        question: String,

        /// Print the state after every step
        #[arg(short, long)]
        stream: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    match args.command {
        Commands::Run {
            config,
            question,
            stream,
        } => {
            let config = match config {
                Some(path) => ConfigLoader::new()
                    .load_config(&path)
                    .with_context(|| format!("failed to load config from {}", path))?,
                None => EngineConfig::default(),
            };
            log::info!(
                "Using max_steps={} retry ceiling={}",
                config.graph.max_steps,
                config.retry.ceiling
            );

            let graph = build_helpdesk(&config).context("failed to build help-desk graph")?;
            let input = Update::new().with("question", question);

            if stream {
                let mut snapshots = graph.stream(input);
                while let Some(snapshot) = snapshots.next().await {
                    let snapshot = snapshot?;
                    println!(
                        "[step {}] {} @ {}",
                        snapshot.step,
                        snapshot.nodes.join(", "),
                        snapshot.completed_at.to_rfc3339()
                    );
                    println!("{}", serde_json::to_string_pretty(&snapshot.state.to_json())?);
                }
            } else {
                let state = graph.invoke(input).await?;
                println!("{}", serde_json::to_string_pretty(&state.to_json())?);
                if let Some(answer) = state.get("last_answer").and_then(|v| v.as_str()) {
                    println!("\nAnswer:\n{}", answer);
                }
            }
        }
    }

    Ok(())
}
