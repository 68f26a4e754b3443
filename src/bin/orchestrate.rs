//! Interactive smoke-test REPL for the orchestrator, in the spirit of
//! `src/main.rs`'s conversational loop upstream.

use std::io::{self, Write};
use std::sync::Arc;

use agent_orchestrator::{Orchestrator, OrchestratorConfig, RunContext, ServiceRegistry};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = OrchestratorConfig::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if config.debug { Level::DEBUG } else { Level::INFO })
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    println!("\n{}", "=".repeat(60));
    println!("Agent Orchestrator");
    println!("{}\n", "=".repeat(60));

    let key = match config.encryption_key {
        Some(key) => key,
        None => orchestrator_core::registry::load_or_generate_key(None, &config.key_file)?,
    };
    let registry = Arc::new(ServiceRegistry::new(config.catalog_path.clone(), key).await?);
    info!(services = registry.list().await.len(), "service registry ready");

    let orchestrator = Orchestrator::new(registry, &config);

    println!("Commands: 'quit' | 'health' | 'trace'\n");

    let session_id = uuid::Uuid::new_v4().to_string();
    loop {
        print!("you> ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let query = input.trim();

        if query.is_empty() {
            continue;
        }

        match query {
            "quit" | "exit" => {
                println!("goodbye");
                break;
            }
            "health" => {
                let health = orchestrator.health().await;
                println!("{:#?}\n", health);
                continue;
            }
            "trace" => {
                let traces = orchestrator.traces(Default::default()).await;
                println!("{} recent runs recorded\n", traces.len());
                continue;
            }
            _ => {}
        }

        let context = RunContext {
            session_id: session_id.clone(),
            user_id: "local".to_string(),
            ..Default::default()
        };

        let result = orchestrator.process(query, context, None, None).await;
        println!("\n{}", "-".repeat(50));
        match result.response {
            Some(answer) => println!("{answer}"),
            None => println!("(no response, see trace for {} node outcomes)", result.trace.len()),
        }
        println!("{}\n", "-".repeat(50));
    }

    Ok(())
}
