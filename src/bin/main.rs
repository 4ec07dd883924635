use advisory_orchestrator::{
    agent::{Collaborators, Orchestrator},
    config::Settings,
    models::InvestmentProfile,
    observer::TracingObserver,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SAMPLE_QUESTION: &str = "Should I invest in AAPL right now?";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let question = if args.is_empty() {
        SAMPLE_QUESTION.to_string()
    } else {
        args.join(" ")
    };

    info!("Advisory orchestrator starting");

    let collaborators = Collaborators::from_settings(&settings)?;
    let orchestrator = Orchestrator::new(settings.orchestrator.clone(), collaborators)?;

    info!(question = %question, "Running orchestrator");

    match orchestrator
        .run(&question, InvestmentProfile::default(), &TracingObserver)
        .await
    {
        Ok(report) => {
            println!("\n=== ANALYSIS RESULT ===");
            println!("Run ID: {}", report.run_id);
            println!("Steps: {}", report.steps);
            println!("Context hash: {}", report.context_hash);
            println!("\n{}", report.answer);

            if !report.agents.is_empty() {
                println!("\nAgents:");
                for outcome in &report.agents {
                    println!(
                        "  {}: {} run(s), all tools used: {}, on topic: {}",
                        outcome.agent, outcome.runs, outcome.all_tools_used, outcome.adherence_passed
                    );
                }
            }

            if let Some(historical) = &report.historical {
                println!(
                    "  HistoricalData: {} queries, {} query errors, {} format errors",
                    historical.executed_queries, historical.query_errors, historical.format_errors
                );
            }

            println!("\nReasoning Trace:");
            for (i, trace) in report.reasoning_trace.iter().enumerate() {
                println!("  {}: {}", i + 1, trace);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Analysis failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
