use blockpilot::{LogEntry, Severity};
use colored::*;

pub fn format_entry(entry: &LogEntry) -> String {
    let time = entry.timestamp.format("%H:%M:%S").to_string();
    let message = match entry.severity {
        Severity::Info => entry.message.normal(),
        Severity::Success => entry.message.green().bold(),
        Severity::Error => entry.message.red().bold(),
    };
    format!("{} {}", format!("[{time}]").dimmed(), message)
}

pub fn print_entry(entry: &LogEntry) {
    println!("{}", format_entry(entry));
}
