// Presentation helpers shared by the terminal UI and the one-shot commands

use chrono::{DateTime, NaiveDateTime};

use crate::models::Origin;
use crate::sync::identity::sender_host;

/// Human readable size: bytes, then KB and MB with one decimal.
pub fn format_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;

    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    }
}

/// `HH:MM` for server timestamps; anything unparseable is shown as is.
pub fn format_time(timestamp: &str) -> String {
    let timestamp = timestamp.trim();
    if let Ok(parsed) = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%d %H:%M:%S%.f") {
        return parsed.format("%H:%M").to_string();
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
        return parsed.format("%H:%M").to_string();
    }
    timestamp.to_string()
}

pub fn file_icon(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_lowercase();

    match ext.as_str() {
        "pdf" => "📄",
        "doc" | "docx" | "txt" => "📝",
        "jpg" | "jpeg" | "png" | "gif" | "svg" => "🖼️",
        "mp4" | "avi" | "mov" => "🎥",
        "mp3" | "wav" | "flac" => "🎵",
        "zip" | "rar" | "7z" => "📦",
        "xls" | "xlsx" | "csv" => "📊",
        _ => "📎",
    }
}

/// "You" for our own messages, otherwise the sender's host.
pub fn sender_label(origin: Origin, sender_endpoint: &str) -> &str {
    match origin {
        Origin::Sent => "You",
        Origin::Received => sender_host(sender_endpoint),
    }
}
