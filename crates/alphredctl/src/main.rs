//! alphredctl - CLI client for alphredd
//!
//! Chat with the assistant and manage delegated tasks over the local HTTP API.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;

use alphred_core::TaskStatus;
use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

/// CLI client for the alphredd assistant daemon.
#[derive(Parser)]
#[command(name = "alphredctl")]
#[command(about = "Chat with Alphred and manage delegated tasks")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(
        long,
        global = true,
        env = "ALPHRED_ADDR",
        default_value = "http://127.0.0.1:8000"
    )]
    addr: String,

    /// Auth token for the HTTP API
    #[arg(long, global = true, env = "ALPHRED_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat; type `exit` or `quit` to leave
    Chat,

    /// Manage delegated tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Queue a new task for the worker
    Create {
        title: String,

        #[arg(long, short, default_value = "")]
        description: String,
    },

    /// List tasks, newest first
    List {
        /// Filter by status (pending, in_progress, completed, failed)
        #[arg(long, value_parser = parse_task_status)]
        status: Option<TaskStatus>,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show a task and its audit events
    Show { task_id: String },
}

fn parse_task_status(s: &str) -> Result<TaskStatus, String> {
    TaskStatus::parse(s).ok_or_else(|| {
        format!("invalid status '{s}', expected: pending, in_progress, completed, failed")
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = Client::new(&cli.addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Chat => run_chat(&client).await,
        Command::Task { command } => match command {
            TaskCommand::Create { title, description } => {
                task_create(&client, &title, &description).await
            }
            TaskCommand::List { status, limit } => task_list(&client, status, limit).await,
            TaskCommand::Show { task_id } => task_show(&client, &task_id).await,
        },
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run_chat(client: &Client) -> Result<(), ClientError> {
    println!("Chatting with Alphred at {} (exit or quit to leave)", client.addr());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("you> ");
        std::io::stdout()
            .flush()
            .map_err(|e| ClientError::IoError(e.to_string()))?;

        let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| ClientError::IoError(e.to_string()))?
        else {
            println!();
            return Ok(());
        };

        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if is_exit(message) {
            return Ok(());
        }

        match client.chat(message).await {
            Ok(reply) => render::print_chat_reply(&reply),
            // Connection problems end the session; anything else is shown and the REPL continues.
            Err(e @ (ClientError::ConnectionFailed { .. } | ClientError::Unauthorized)) => {
                return Err(e)
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }
}

fn is_exit(message: &str) -> bool {
    message.eq_ignore_ascii_case("exit") || message.eq_ignore_ascii_case("quit")
}

async fn task_create(client: &Client, title: &str, description: &str) -> Result<(), ClientError> {
    let task = client.create_task(title, description).await?;
    render::print_task_created(&task);
    Ok(())
}

async fn task_list(
    client: &Client,
    status: Option<TaskStatus>,
    limit: Option<u32>,
) -> Result<(), ClientError> {
    let tasks = client.list_tasks(status, limit).await?;
    render::print_task_list(&tasks);
    Ok(())
}

async fn task_show(client: &Client, task_id: &str) -> Result<(), ClientError> {
    let task = client.get_task(task_id).await?;
    let events = client.list_events(task_id).await?;
    render::print_task_details(&task, &events);
    Ok(())
}
