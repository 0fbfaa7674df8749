//! Terminal output for alphredctl.

use alphred_core::{Task, TaskEvent};

use crate::client::ChatReply;

pub fn print_chat_reply(reply: &ChatReply) {
    println!("alphred> {}", reply.reply);
    if !reply.tools_used.is_empty() {
        println!("  (tools: {})", reply.tools_used.join(", "));
    }
}

/// Print confirmation after creating a task.
pub fn print_task_created(task: &Task) {
    println!("Created task: {}", task.id);
    println!("  Title:  {}", task.title);
    println!("  Status: {}", task.status.as_str());
}

/// Print tasks in tabular format.
pub fn print_task_list(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }

    println!(
        "{:<36}  {:<30}  {:<11}  {:<19}",
        "ID", "TITLE", "STATUS", "CREATED"
    );
    println!("{}", "-".repeat(102));

    for task in tasks {
        println!(
            "{:<36}  {:<30}  {:<11}  {:<19}",
            task.id.0,
            truncate(&task.title, 30),
            task.status.as_str(),
            format_time(&task.created_at),
        );
    }

    println!();
    println!("{} task(s)", tasks.len());
}

/// Print one task and its audit trail.
pub fn print_task_details(task: &Task, events: &[TaskEvent]) {
    println!("Task: {}", task.id);
    println!();
    println!("  Title:    {}", task.title);
    println!("  Status:   {}", task.status.as_str());
    if !task.description.is_empty() {
        println!("  Details:  {}", task.description);
    }
    println!("  Created:  {}", format_time(&task.created_at));
    println!("  Updated:  {}", format_time(&task.updated_at));
    if let Some(lease) = &task.lease_expires_at {
        println!("  Lease:    {}", format_time(lease));
    }

    if let Some(result) = &task.result {
        println!();
        println!("  Result:");
        for line in result.lines() {
            println!("    {line}");
        }
    }

    if !events.is_empty() {
        println!();
        println!("  Events:");
        println!("    {:<19}  {:<16}  PAYLOAD", "TIME", "TYPE");
        println!("    {}", "-".repeat(80));
        for event in events {
            println!(
                "    {:<19}  {:<16}  {}",
                format_time(&event.timestamp),
                event.event_type,
                event.payload_json,
            );
        }
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
