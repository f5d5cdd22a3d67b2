//! Line-oriented control loop on stdin.

use anyhow::Result;
use branchship_scheduler::QueueSnapshot;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use super::{Engine, check_branch, print_batch, print_branches};

const HELP: &str = "commands: build <branch>..., cancel <branch>, queue, branches [branch], quit";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Build(Vec<String>),
    Cancel(String),
    Queue,
    Branches(Option<String>),
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<String> = words.map(str::to_string).collect();

    let command = match (verb, args.as_slice()) {
        ("build", []) => return Err("build needs at least one branch".to_string()),
        ("build", _) => Command::Build(args),
        ("cancel", [branch]) => Command::Cancel(branch.clone()),
        ("cancel", _) => return Err("cancel takes exactly one branch".to_string()),
        ("queue" | "status", []) => Command::Queue,
        ("branches", []) => Command::Branches(None),
        ("branches", [branch]) => Command::Branches(Some(branch.clone())),
        ("quit" | "exit", []) => Command::Quit,
        _ => return Err(format!("unknown command: {}", line.trim())),
    };
    Ok(Some(command))
}

fn print_snapshot(snapshot: &QueueSnapshot) {
    match &snapshot.running {
        Some(running) => {
            let cancelling = if running.cancel_requested { " (cancelling)" } else { "" };
            println!(
                "running: {} since {}{}",
                running.branch,
                running.started_at.format("%H:%M:%S"),
                cancelling
            );
        }
        None if snapshot.settling => println!("running: nothing (settling)"),
        None => println!("running: nothing"),
    }

    if snapshot.waiting.is_empty() {
        println!("queue: empty");
    }
    for (i, waiting) in snapshot.waiting.iter().enumerate() {
        println!("  {}. {} (by {})", i + 1, waiting.branch, waiting.requester);
    }
}

pub async fn run(config_path: &Path, deliver_to: Option<PathBuf>, requester: &str) -> Result<()> {
    let engine = Engine::load(config_path, deliver_to)?;
    info!(project = %engine.config.project_path.display(), "Serving build requests on stdin");
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{}", message);
                println!("{}", HELP);
                continue;
            }
        };

        match command {
            Command::Build(branches) => {
                match engine
                    .scheduler
                    .admit_many(&engine.resolver, &branches, requester, "stdin")
                    .await
                {
                    Ok(batch) => print_batch(&batch),
                    Err(e) => println!("{}", e),
                }
            }
            Command::Cancel(branch) => {
                let report = engine.scheduler.cancel(&branch);
                if report.is_empty() {
                    println!("{}: nothing to cancel", branch);
                } else {
                    println!(
                        "{}: running build cancelled: {}, removed from queue: {}",
                        branch,
                        if report.cancelled_running { "yes" } else { "no" },
                        report.removed_from_queue
                    );
                }
            }
            Command::Queue => print_snapshot(&engine.scheduler.snapshot()),
            Command::Branches(name) => {
                let result = match name {
                    Some(name) => check_branch(&engine.resolver, &name).await,
                    None => print_branches(&engine.resolver).await,
                };
                if let Err(e) = result {
                    println!("{:#}", e);
                }
            }
            Command::Quit => break,
        }
    }

    if engine.scheduler.is_busy() {
        println!("Waiting for remaining builds to finish");
        engine.scheduler.wait_idle().await;
    }
    Ok(())
}
