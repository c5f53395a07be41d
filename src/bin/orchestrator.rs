//! Headless driver for the orchestration core. Not the primary way to
//! embed the crate (that's `AutonomousManager` itself), but a small CLI
//! useful for smoke-testing a deployment or driving it from a script.

use std::sync::Arc;

use orchestrator_core::config::OrchestratorConfig;
use orchestrator_core::logger::Logger;
use orchestrator_core::manager::AutonomousManager;
use orchestrator_core::notify::NotifyCallback;

fn cli_notify() -> NotifyCallback {
    Arc::new(|user_id, message| {
        Box::pin(async move {
            println!("[notify {user_id}] {message}");
        })
    })
}

fn usage() -> ! {
    eprintln!(
        "usage: orchestrator <user-id> <project-name> <command> [args]\n\n\
         commands:\n\
         \x20 breakdown <request text...>   decompose a request into a PRD and start work\n\
         \x20 status                         print the current loop status\n\
         \x20 start | stop | pause | resume  control the dispatch loop\n\
         \x20 learnings                      list stored learnings for the project"
    );
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    let mut args = std::env::args().skip(1);
    let user_id = args.next().unwrap_or_else(|| usage());
    let project_name = args.next().unwrap_or_else(|| usage());
    let command = args.next().unwrap_or_else(|| usage());
    let rest: Vec<String> = args.collect();

    let mut config = OrchestratorConfig::from_env();
    config.validate();
    let logger_path = config.db_path.with_file_name("orchestrator-logs.db");
    let logger = Arc::new(Logger::new(logger_path)?);

    let manager = AutonomousManager::new(config, logger, cli_notify(), user_id.clone()).await?;

    match command.as_str() {
        "breakdown" => {
            if rest.is_empty() {
                usage();
            }
            let request = rest.join(" ");
            let prd = manager.complex(&user_id, &project_name, &request).await?;
            println!("Created PRD #{:?}: {}", prd.id, prd.title);
        }
        "status" => {
            let status = manager.autonomous_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        "start" => manager.autonomous_start().await?,
        "stop" => manager.autonomous_stop().await,
        "pause" => manager.autonomous_pause(),
        "resume" => manager.autonomous_resume(),
        "learnings" => {
            let learnings = manager.learnings_list(&user_id, Some(&project_name), 20).await?;
            for learning in learnings {
                println!("[{:?}] {} (confidence {:.2})", learning.category, learning.title, learning.confidence);
            }
        }
        other => {
            eprintln!("unknown command: {other}");
            usage();
        }
    }

    Ok(())
}
