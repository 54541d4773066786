use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use serde_json::json;

use iterlog_sessions::{Iteration, IterationStore, Session, ToolCall, ToolStatus};

#[derive(Subcommand, Debug)]
pub enum SessionsAction {
    /// List an agent's archived sessions
    List {
        agent: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one archived session in detail
    Show {
        agent: String,

        /// Session ID (launches interactive picker if omitted)
        id: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete an agent's archive and empty its current session
    Clear {
        agent: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

pub async fn handle_sessions_command(store: &IterationStore, action: SessionsAction) -> Result<()> {
    match action {
        SessionsAction::List { agent, json } => {
            let sessions = store.historical_sessions(&agent).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("{}", "No sessions found.".dimmed());
            } else {
                print_sessions_table(&sessions);
            }
        }
        SessionsAction::Show { agent, id, json } => {
            let sessions = store.historical_sessions(&agent).await;
            let session = resolve_session(&sessions, id)?;

            if json {
                println!("{}", serde_json::to_string_pretty(session)?);
            } else {
                print_session_detail(session);
            }
        }
        SessionsAction::Clear { agent, yes } => {
            if !yes {
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt(format!("Delete all history for {}?", agent))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    return Ok(());
                }
            }

            store.clear_all_history(&agent).await;
            println!("Cleared history for {}", agent.bold());
        }
    }

    Ok(())
}

/// Print the agent's current session and its most recent tool calls.
pub fn show_current(store: &IterationStore, agent: &str, tools: usize, json: bool) -> Result<()> {
    let session_id = store.current_session(agent);
    let iterations = store.iterations_for_agent(agent);
    let last_tools = store.last_tools(agent, tools);

    if json {
        let out = json!({
            "agentId": agent,
            "sessionId": session_id,
            "iterations": iterations,
            "lastTools": last_tools,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let Some(session_id) = session_id else {
        println!("{}", format!("{} has no current session.", agent).dimmed());
        return Ok(());
    };

    println!("{}", format!("=== {} ===", agent).bright_blue().bold());
    println!("{}  {}", "Session:".dimmed(), session_id);
    println!("{}  {}", "Iterations:".dimmed(), iterations.len());

    for iteration in &iterations {
        println!("  {}", iteration_line(iteration));
    }

    if !last_tools.is_empty() {
        println!();
        println!("{}", format!("--- Last {} tool call(s) ---", last_tools.len()).dimmed());
        for tool in &last_tools {
            println!(
                "  {} {}",
                tool.timestamp.format("%H:%M:%S").to_string().dimmed(),
                tool_label(tool)
            );
        }
    }

    Ok(())
}

pub async fn show_usage(store: &IterationStore, agent: &str, json: bool) -> Result<()> {
    let usage = store.storage_usage(agent).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&usage)?);
    } else {
        println!("{}", format!("=== Storage: {} ===", agent).bright_blue().bold());
        println!("{}  {:.2} MB", "Current Session:".dimmed(), usage.current_session_mb);
        println!("{}  {:.2} MB", "Total:".dimmed(), usage.total_history_mb);
    }

    Ok(())
}

fn resolve_session(sessions: &[Session], id: Option<String>) -> Result<&Session> {
    if let Some(id) = id {
        return sessions
            .iter()
            .find(|s| s.session_id == id)
            .ok_or_else(|| anyhow::anyhow!("Session not found: {}", id));
    }

    // Interactive picker
    if sessions.is_empty() {
        anyhow::bail!("No sessions found.");
    }

    let items: Vec<String> = sessions
        .iter()
        .map(|s| {
            format!(
                "{} | {} ({} iters, {})",
                s.start_time.format("%Y-%m-%d %H:%M"),
                s.session_id,
                s.iterations.len(),
                session_duration(s)
            )
        })
        .collect();

    let selection = dialoguer::FuzzySelect::new()
        .with_prompt("Select a session")
        .items(&items)
        .default(0)
        .interact()?;

    Ok(&sessions[selection])
}

fn print_sessions_table(sessions: &[Session]) {
    println!(
        "{:<20} {:<38} {:<6} {:<8} {}",
        "STARTED".dimmed(),
        "SESSION".dimmed(),
        "ITERS".dimmed(),
        "DURATION".dimmed(),
        "ERRORS".dimmed(),
    );

    for s in sessions {
        let errors = s.iterations.iter().filter(|i| i.has_error).count();
        let errors = if errors == 0 {
            "0".bright_green().to_string()
        } else {
            errors.to_string().bright_red().to_string()
        };

        println!(
            "{:<20} {:<38} {:<6} {:<8} {}",
            s.start_time.format("%Y-%m-%d %H:%M"),
            s.session_id,
            s.iterations.len(),
            session_duration(s),
            errors
        );
    }
}

fn print_session_detail(session: &Session) {
    println!("{}", "=== Session Detail ===".bright_blue().bold());
    println!("{}  {}", "ID:".dimmed(), session.session_id);
    println!("{}  {}", "Agent:".dimmed(), session.agent_id);
    println!(
        "{}  {}",
        "Started:".dimmed(),
        session.start_time.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(end) = session.end_time {
        println!("{}  {}", "Ended:".dimmed(), end.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    if session.iterations.is_empty() {
        return;
    }

    println!();
    println!(
        "{}",
        format!("--- Iterations ({}) ---", session.iterations.len()).dimmed()
    );
    for iteration in &session.iterations {
        println!();
        println!("  {}", iteration_line(iteration));
        if let Some(ref prompt) = iteration.model_prompt {
            println!("    {} {}", "Prompt:".dimmed(), preview(prompt, 120));
        }
        if let Some(ref images) = iteration.model_images {
            if !images.is_empty() {
                println!("    {} {}", "Images:".dimmed(), images.len());
            }
        }
        if let Some(ref response) = iteration.model_response {
            println!("    {} {}", "Response:".dimmed(), preview(response, 120));
        }
        for tool in &iteration.tools {
            println!("    {} {}", "Tool:".dimmed(), tool_label(tool));
            if let Some(ref error) = tool.error {
                println!("      {}", preview(error, 120).bright_red());
            }
        }
    }
}

/// One-line summary: number, start, duration, sensors, tools.
pub fn iteration_line(iteration: &Iteration) -> String {
    let number = format!("[{}]", iteration.session_iteration_number);
    let number = if iteration.has_error {
        number.bright_red()
    } else {
        number.bright_blue()
    };

    let duration = iteration
        .duration
        .map(format_duration)
        .unwrap_or_else(|| "...".to_string());

    let sensors: Vec<&str> = iteration.sensors.iter().map(|s| s.kind.tag()).collect();
    let tools: Vec<String> = iteration.tools.iter().map(tool_label).collect();

    format!(
        "{} {} {:>6}  {} {}  {} {}",
        number,
        iteration.start_time.format("%H:%M:%S"),
        duration,
        "sensors:".dimmed(),
        if sensors.is_empty() { "-".to_string() } else { sensors.join(", ") },
        "tools:".dimmed(),
        if tools.is_empty() { "-".to_string() } else { tools.join(", ") },
    )
}

fn tool_label(tool: &ToolCall) -> String {
    match tool.status {
        ToolStatus::Success => tool.name.bright_green().to_string(),
        ToolStatus::Error => format!("{} (failed)", tool.name).bright_red().to_string(),
    }
}

fn session_duration(session: &Session) -> String {
    session
        .end_time
        .map(|end| format_duration((end - session.start_time).num_milliseconds() as f64 / 1000.0))
        .unwrap_or_else(|| "...".to_string())
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() > max_chars {
        format!("{}...", flat.chars().take(max_chars).collect::<String>())
    } else {
        flat
    }
}

fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let mins = (secs / 60.0).floor() as u64;
        let remaining_secs = (secs % 60.0) as u64;
        format!("{}m {}s", mins, remaining_secs)
    }
}
