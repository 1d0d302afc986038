use colored::*;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Shared CLI implementation behind the `cli` binary.
pub fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args
        .first()
        .map(|s| s.as_str())
        .unwrap_or("inbox")
        .to_string();

    if args.len() < 2 {
        print_usage(&bin);
        return Ok(());
    }

    let command = &args[1];

    match command.as_str() {
        "threads" => {
            let mut status = "all";
            let mut query = Vec::new();
            for arg in &args[2..] {
                match arg.as_str() {
                    "--unread" => status = "unread",
                    "--read" => status = "read",
                    other => query.push(other),
                }
            }
            list_threads(status, &query.join(" "))?;
        }
        "open" => {
            if args.len() < 3 {
                eprintln!("{}", format!("Usage: {} open <thread_id>", bin).yellow());
                return Ok(());
            }
            open_thread(&args[2])?;
        }
        "send" => {
            if args.len() < 4 {
                eprintln!("{}", format!("Usage: {} send <thread_id> <message>", bin).yellow());
                return Ok(());
            }
            send_message(&args[2], &args[3..].join(" "))?;
        }
        "retry" | "discard" | "archive" => {
            if args.len() < 3 {
                eprintln!("{}", format!("Usage: {} {} <id>", bin, command).yellow());
                return Ok(());
            }
            simple_action(command, &args[2])?;
        }
        "read-all" => {
            let resp = call("POST", "/api/read-all", None)?;
            let marked = resp["marked"].as_u64().unwrap_or(0);
            println!("{} Marked {} conversation(s) read", "✓".green().bold(), marked.to_string().cyan());
        }
        "unread" => show_unread()?,
        "status" => show_status()?,
        "booking" => {
            if args.len() < 7 {
                eprintln!(
                    "{}",
                    format!("Usage: {} booking <booking_id> <property_id> <title> <user=name> <user=name>...", bin)
                        .yellow()
                );
                return Ok(());
            }
            add_booking(&args[2], &args[3], &args[4], &args[5..])?;
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
        }
    }

    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "📬 Inbox CLI".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!(
        "  {} [--unread|--read] [query]   List conversations",
        "threads".cyan()
    );
    println!("  {} <thread_id>                    Open a conversation", "open".cyan());
    println!("  {} <thread_id> <message>          Send a message", "send".cyan());
    println!("  {} <temp_id>                     Retry a failed send", "retry".cyan());
    println!("  {} <temp_id>                   Drop a failed send", "discard".cyan());
    println!("  {} <thread_id>                 Hide a conversation", "archive".cyan());
    println!("  {}                            Mark everything read", "read-all".cyan());
    println!("  {}                              Show unread badge total", "unread".cyan());
    println!("  {}                              Show controller status", "status".cyan());
    println!(
        "  {} <id> <property> <title> <user=name>...  Register a booking",
        "booking".cyan()
    );
}

fn api_addr() -> SocketAddr {
    let port = std::env::var("INBOX_API_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(9380);
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// One HTTP/1.1 request with `Connection: close`; returns the parsed JSON body
fn request(method: &str, path: &str, body: Option<&serde_json::Value>) -> anyhow::Result<(u16, serde_json::Value)> {
    let addr = api_addr();
    let mut stream = TcpStream::connect(addr).map_err(|e| {
        anyhow::anyhow!(
            "could not reach inbox daemon at {} ({}); is it running? Set INBOX_API_PORT if it uses another port",
            addr,
            e
        )
    })?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let payload = body.map(|b| b.to_string()).unwrap_or_default();
    write!(
        stream,
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        method,
        path,
        addr,
        payload.len(),
        payload
    )?;

    let mut raw = String::new();
    stream.read_to_string(&mut raw)?;

    let (head, body) = raw
        .split_once("\r\n\r\n")
        .ok_or_else(|| anyhow::anyhow!("malformed HTTP response"))?;
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("missing HTTP status"))?;
    let json = if body.trim().is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(body.trim())?
    };
    Ok((status, json))
}

/// Like `request`, but exits with the server's error message on failure
fn call(method: &str, path: &str, body: Option<&serde_json::Value>) -> anyhow::Result<serde_json::Value> {
    let (status, resp) = request(method, path, body)?;
    if status >= 400 {
        let error = resp["error"].as_str().unwrap_or("Unknown error");
        eprintln!("{} Error ({}): {}", "✗".red().bold(), status, error.red());
        std::process::exit(1);
    }
    Ok(resp)
}

fn thread_path(thread_id: &str, action: &str) -> String {
    format!("/api/threads/{}/{}", urlencoding::encode(thread_id), action)
}

fn short_time(value: &serde_json::Value) -> String {
    value
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&chrono::Local).format("%b %d %H:%M").to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn list_threads(status: &str, query: &str) -> anyhow::Result<()> {
    let path = format!(
        "/api/threads?status={}&q={}",
        status,
        urlencoding::encode(query)
    );
    let resp = call("GET", &path, None)?;

    let threads = resp["threads"].as_array().cloned().unwrap_or_default();
    if threads.is_empty() {
        println!("{}", "No conversations".yellow());
        return Ok(());
    }

    println!(
        "{}",
        format!("Conversations ({})", threads.len()).bright_cyan().bold()
    );
    println!("{}", "─".repeat(60).dimmed());
    for thread in &threads {
        let unread = thread["unread_count"].as_u64().unwrap_or(0);
        let badge = if unread > 0 {
            format!(" ({})", unread).red().bold().to_string()
        } else {
            String::new()
        };
        println!(
            "  {}{} · {}  {}",
            thread["property_title"].as_str().unwrap_or("?").bright_white().bold(),
            badge,
            thread["counterparty_name"].as_str().unwrap_or("?").cyan(),
            short_time(&thread["last_message_at"]).dimmed()
        );
        println!("    {}", thread["last_message"].as_str().unwrap_or("").dimmed());
        println!("    {}", thread["id"].as_str().unwrap_or("?").dimmed());
    }
    Ok(())
}

fn open_thread(thread_id: &str) -> anyhow::Result<()> {
    let resp = call("POST", &thread_path(thread_id, "select"), None)?;
    let messages = resp["messages"].as_array().cloned().unwrap_or_default();
    if messages.is_empty() {
        println!("{}", "No messages yet".yellow());
        return Ok(());
    }

    for row in &messages {
        let msg = &row["message"];
        let marker = match row["delivery"]["state"].as_str() {
            Some("pending") => " …".yellow().to_string(),
            Some("failed") => format!(
                " ✗ {}",
                row["delivery"]["temp_id"].as_str().unwrap_or("")
            )
            .red()
            .to_string(),
            _ => String::new(),
        };
        println!(
            "{} {}{}",
            format!("[{}]", short_time(&msg["created_at"])).dimmed(),
            format!("{}:", msg["sender_id"].as_str().unwrap_or("?")).cyan().bold(),
            marker
        );
        println!("  {}", msg["body"].as_str().unwrap_or(""));
    }
    Ok(())
}

fn send_message(thread_id: &str, body: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "body": body });
    let (status, resp) = request("POST", &thread_path(thread_id, "messages"), Some(&payload))?;
    if status == 503 {
        // The daemon keeps the message as failed; it can be retried from there
        let error = resp["error"].as_str().unwrap_or("Unknown error");
        eprintln!("{} Not delivered: {}", "⚠".yellow().bold(), error.yellow());
        eprintln!("  Check `status`, then `retry <temp_id>` from `open {}`", thread_id);
        std::process::exit(1);
    }
    if status >= 400 {
        let error = resp["error"].as_str().unwrap_or("Unknown error");
        eprintln!("{} Error: {}", "✗".red().bold(), error.red());
        std::process::exit(1);
    }
    let id = resp["message"]["id"].as_str().unwrap_or("?");
    println!("{} Message sent! ID: {}", "✓".green().bold(), id.cyan());
    Ok(())
}

fn simple_action(command: &str, id: &str) -> anyhow::Result<()> {
    let (method, path) = match command {
        "retry" => ("POST", format!("/api/outbox/{}/retry", urlencoding::encode(id))),
        "discard" => ("DELETE", format!("/api/outbox/{}", urlencoding::encode(id))),
        _ => ("POST", thread_path(id, "archive")),
    };
    call(method, &path, None)?;
    println!("{} {} {}", "✓".green().bold(), command, id.cyan());
    Ok(())
}

fn show_unread() -> anyhow::Result<()> {
    let resp = call("GET", "/api/unread", None)?;
    let total = resp["total"].as_u64().unwrap_or(0);
    let shown = if total > 0 {
        total.to_string().red().bold()
    } else {
        total.to_string().green()
    };
    match resp["server_total"].as_u64() {
        Some(server) if server != total => println!(
            "Unread: {} {}",
            shown,
            format!("(server still reports {})", server).dimmed()
        ),
        _ => println!("Unread: {}", shown),
    }
    Ok(())
}

fn show_status() -> anyhow::Result<()> {
    let resp = call("GET", "/api/status", None)?;
    let status = &resp["status"];

    println!(
        "{}",
        "╭─ Inbox Status ────────────────────────────────────────────────╮".bright_cyan()
    );
    println!(
        "{} {}",
        "│".bright_cyan(),
        format!("User:       {}", resp["user_id"].as_str().unwrap_or("?").cyan()).bright_white()
    );
    let bridge = status["bridge"]["state"].as_str().unwrap_or("?");
    let bridge = match bridge {
        "connected" => bridge.green(),
        "reconnecting" => bridge.yellow(),
        _ => bridge.red(),
    };
    println!("{} {}", "│".bright_cyan(), format!("Live feed:  {}", bridge).bright_white());
    println!(
        "{} {}",
        "│".bright_cyan(),
        format!(
            "Selection:  {}",
            status["selection"]["thread_id"].as_str().unwrap_or("none")
        )
        .bright_white()
    );
    println!(
        "{} {}",
        "│".bright_cyan(),
        format!(
            "Outbox:     {} pending, {} failed",
            status["pending_sends"].as_u64().unwrap_or(0).to_string().green(),
            status["failed_sends"].as_u64().unwrap_or(0).to_string().red()
        )
        .bright_white()
    );
    if let Some(err) = status["threads_error"].as_str() {
        println!("{} {}", "│".bright_cyan(), format!("List error: {}", err).yellow());
    }
    if status["read_state_degraded"].as_bool().unwrap_or(false) {
        println!("{} {}", "│".bright_cyan(), "Read markers: memory only".yellow());
    }
    println!(
        "{}",
        "╰───────────────────────────────────────────────────────────────╯".bright_cyan()
    );
    Ok(())
}

fn add_booking(booking_id: &str, property_id: &str, title: &str, people: &[String]) -> anyhow::Result<()> {
    let mut participants = Vec::new();
    for person in people {
        let (user_id, name) = person
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("participant must look like user=name, got {}", person))?;
        participants.push(serde_json::json!({ "user_id": user_id, "display_name": name }));
    }
    let payload = serde_json::json!({
        "booking_id": booking_id,
        "property_id": property_id,
        "property_title": title,
        "participants": participants,
    });
    call("POST", "/api/bookings", Some(&payload))?;
    println!("{} Booking {} registered", "✓".green().bold(), booking_id.cyan());
    Ok(())
}
