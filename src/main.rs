//! chatpilot: drive a browser-only chat aggregator from the terminal.

use anyhow::Context;
use chatpilot_lib::autonomy::{AutonomyEvent, ExecuteOptions};
use chatpilot_lib::config::{load_config, load_config_from};
use chatpilot_lib::acquisition::TokenEvent;
use chatpilot_lib::{PilotError, SessionContext};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc};

#[derive(Parser)]
#[command(name = "chatpilot")]
#[command(about = "Browser-driven client for a browser-only AI chat aggregator")]
#[command(version)]
struct Cli {
    /// Configuration file path (default: <config dir>/chatpilot/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Working directory for autonomy tools
    #[arg(short, long, global = true)]
    work_dir: Option<PathBuf>,

    /// Run Chrome without a window
    #[arg(long, global = true)]
    headless: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the models that can be selected
    Models,

    /// Send one message and stream the answer
    Ask {
        /// Model id (default from config)
        #[arg(short, long)]
        model: Option<String>,

        /// Message text
        #[arg(required = true)]
        text: Vec<String>,
    },

    /// Break a goal into steps without executing them
    Plan {
        goal: String,

        /// Project context handed to the planner
        #[arg(long)]
        context: Option<String>,
    },

    /// Plan a goal and execute every step
    Run {
        goal: String,

        #[arg(long)]
        context: Option<String>,

        /// Stop after this step number (1-based)
        #[arg(long)]
        stop_after: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
    .context("Failed to load configuration")?;
    if let Some(dir) = cli.work_dir {
        config.autonomy.work_dir = dir;
    }
    if cli.headless {
        config.browser.headless = true;
    }

    let ctx = SessionContext::new(config);
    let result = match cli.command {
        Commands::Models => {
            list_models(&ctx);
            Ok(())
        }
        Commands::Ask { model, text } => ask(&ctx, model.as_deref(), &text.join(" ")).await,
        Commands::Plan { goal, context } => plan(&ctx, &goal, context.as_deref()).await,
        Commands::Run {
            goal,
            context,
            stop_after,
        } => run(&ctx, &goal, context.as_deref(), stop_after).await,
    };

    ctx.shutdown().await;
    result
}

fn list_models(ctx: &SessionContext) {
    for model in ctx.client.available_models() {
        println!("{:<50} {:<32} {}", model.id, model.name, model.modality);
    }
}

async fn ask(ctx: &SessionContext, model: Option<&str>, text: &str) -> anyhow::Result<()> {
    let selection = ctx.client.initialize(model).await?;
    tracing::info!("Asking {}", selection.model);

    let client = ctx.client.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            client.stop();
        }
    });

    let (tx, mut rx) = mpsc::channel::<TokenEvent>(ctx.config.acquisition.token_channel_capacity);
    let printer = tokio::spawn(async move {
        let mut out = std::io::stdout();
        while let Some(token) = rx.recv().await {
            let _ = write!(out, "{}", token.delta);
            let _ = out.flush();
        }
    });

    let result = ctx.client.send_message(text, tx).await;
    let _ = printer.await;
    interrupt.abort();

    match result {
        Ok(completion) => {
            // Image link and sources are not part of the token stream
            if let Some(extra) = completion.text.strip_prefix(completion.raw_text.as_str()) {
                print!("{}", extra);
            }
            println!();
            Ok(())
        }
        Err(PilotError::Cancelled { .. }) => {
            println!("\n[stopped]");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn plan(ctx: &SessionContext, goal: &str, context: Option<&str>) -> anyhow::Result<()> {
    let plan = ctx
        .autonomy
        .generate_plan(goal, context.unwrap_or_default())
        .await?;
    println!("Plan {} ({} steps)", plan.id, plan.steps.len());
    for (i, step) in plan.steps.iter().enumerate() {
        match &step.model {
            Some(model) => println!("{:>3}. {} [{}]", i + 1, step.action, model),
            None => println!("{:>3}. {}", i + 1, step.action),
        }
    }
    Ok(())
}

async fn run(
    ctx: &SessionContext,
    goal: &str,
    context: Option<&str>,
    stop_after: Option<usize>,
) -> anyhow::Result<()> {
    let printer = tokio::spawn(print_events(ctx.autonomy.subscribe()));

    let autonomy = ctx.autonomy.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            autonomy.halt();
        }
    });

    let result = async {
        ctx.autonomy
            .generate_plan(goal, context.unwrap_or_default())
            .await?;
        ctx.autonomy
            .execute_plan(ExecuteOptions {
                start_from_step: 0,
                stop_after_step: stop_after.map(|n| n.saturating_sub(1)),
            })
            .await
    }
    .await;

    interrupt.abort();
    printer.abort();

    let status = result?;
    let report = ctx.autonomy.status();
    let failed = report.step_results.iter().filter(|r| !r.success).count();
    println!(
        "\nPlan {:?}: {}/{} steps run, {} failed",
        status,
        report.step_results.len(),
        report.total_steps,
        failed
    );
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<AutonomyEvent>) {
    let mut out = std::io::stdout();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Dropped {} progress events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            AutonomyEvent::Status(msg) => eprintln!("» {}", msg),
            AutonomyEvent::StepStart {
                step,
                total,
                action,
                model,
            } => println!("\n[{}/{}] {} ({})", step, total, action, model),
            AutonomyEvent::Token(delta) => {
                let _ = write!(out, "{}", delta);
                let _ = out.flush();
            }
            AutonomyEvent::ToolResult(outcome) => {
                let first = outcome.output.lines().next().unwrap_or_default();
                println!(
                    "\n  {} {}: {}",
                    if outcome.success { "✓" } else { "✗" },
                    outcome.tool,
                    first
                );
            }
            AutonomyEvent::StepComplete(_) => println!(),
            AutonomyEvent::StepFailed(result) => println!(
                "\n  ✗ step {} failed: {}",
                result.step_index + 1,
                result.error.unwrap_or_default()
            ),
            AutonomyEvent::Complete {
                succeeded, failed, ..
            } => println!("\nCompleted: {} succeeded, {} failed", succeeded, failed),
        }
    }
}
