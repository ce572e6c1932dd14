//! UI helpers for the provisioning CLI.
//!
//! Provides consistent formatting for console output during provisioning.

use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use robot_metal::poll::{ProgressSink, ProgressUpdate};
use robot_metal::Server;

use crate::state::SelectedServer;

const RULE_WIDTH: usize = 70;

/// Print the banner.
pub fn print_banner() {
    println!();
    println!("{}", "  robot-provision".cyan().bold());
    println!(
        "  {}",
        "Talos clusters on Hetzner Robot dedicated servers".bright_black()
    );
    println!();
}

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(RULE_WIDTH).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(RULE_WIDTH).bright_black());
    println!();
}

/// Print a step indicator with message.
pub fn print_step(message: &str) {
    println!("{} {}", "▶".cyan(), message.bold());
}

/// Print a progress step with step number.
pub fn print_progress_step(current: u8, total: u8, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// Print a list item.
pub fn print_list_item(item: &str) {
    println!("  {} {item}", "•".bright_black());
}

/// Print an error with its full cause chain.
pub fn print_error_chain(error: &anyhow::Error) {
    print_error(&error.to_string());
    for cause in error.chain().skip(1) {
        eprintln!("    {} {cause}", "caused by:".bright_black());
    }
}

/// Print the inventory as a table.
pub fn print_inventory(servers: &[Server]) {
    println!(
        "  {:<10} {:<24} {:<16} {:<12} {:<12} {}",
        "ID".bold(),
        "NAME".bold(),
        "IP".bold(),
        "PRODUCT".bold(),
        "DC".bold(),
        "STATUS".bold()
    );
    for server in servers {
        let status = if server.cancelled {
            "cancelled".red()
        } else {
            server.status.normal()
        };
        println!(
            "  {:<10} {:<24} {:<16} {:<12} {:<12} {}",
            server.id, server.name, server.ip, server.product, server.dc, status
        );
    }
}

/// Print the selected servers with roles and private addresses.
pub fn print_selection(servers: &[SelectedServer]) {
    println!(
        "  {:<4} {:<10} {:<24} {:<16} {:<16} {}",
        "#".bold(),
        "ID".bold(),
        "NAME".bold(),
        "PUBLIC IP".bold(),
        "PRIVATE IP".bold(),
        "ROLE".bold()
    );
    for (i, server) in servers.iter().enumerate() {
        let role = if server.role.is_control_plane() {
            server.role.to_string().cyan()
        } else {
            server.role.to_string().normal()
        };
        println!(
            "  {:<4} {:<10} {:<24} {:<16} {:<16} {}",
            i + 1,
            server.id,
            server.name,
            server.ip,
            server.private_ip.to_string(),
            role
        );
    }
}

/// Print the DNS records the operator must create.
pub fn print_dns_records(name: &str, ips: &[String]) {
    println!("  {:<32} {:<6} {}", "NAME".bold(), "TYPE".bold(), "VALUE".bold());
    for ip in ips {
        println!("  {name:<32} {:<6} {ip}", "A");
    }
}

/// Print the destructive-action warning box.
pub fn print_critical_warning(cluster_name: &str) {
    let lines = [
        "CRITICAL WARNING",
        "",
        "Provisioning is DESTRUCTIVE and runs once per cluster.",
        "Every selected server will be rebooted into the rescue system",
        "and its disks will be wiped and reinstalled with Talos Linux.",
        "Running it against a live cluster destroys that cluster,",
        "its workloads and all of its data.",
        "",
        "Do not proceed if these servers are in use.",
    ];
    let inner = RULE_WIDTH - 4;
    println!();
    println!("{}", format!("╔{}╗", "═".repeat(RULE_WIDTH - 2)).red().bold());
    for line in lines {
        println!("{}", format!("║ {line:<inner$} ║").red().bold());
    }
    println!("{}", format!("╚{}╝", "═".repeat(RULE_WIDTH - 2)).red().bold());
    println!();
    print_kv("Cluster", cluster_name);
}

/// Spinner for a long-running subprocess.
#[must_use]
pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("  {spinner:.cyan} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Renders each poll tick as a status table.
#[derive(Debug, Default, Clone, Copy)]
pub struct TableProgress;

impl ProgressSink for TableProgress {
    fn update(&self, update: &ProgressUpdate<'_>) {
        println!();
        println!(
            "  {} {} {}",
            "⟳".cyan(),
            update.stage.bold(),
            format!(
                "({}/{} ready, {}s of {}s)",
                update.done_count(),
                update.entries.len(),
                update.elapsed.as_secs(),
                update.timeout.as_secs()
            )
            .bright_black()
        );
        for entry in update.entries {
            let marker = if entry.done {
                "✓".green()
            } else {
                "…".yellow()
            };
            println!("    {marker} {:<36} {}", entry.label, entry.state);
        }
    }
}
