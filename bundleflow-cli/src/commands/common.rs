//! Helpers shared across CLI commands.

use bundleflow::diff::DownloadScope;
use bundleflow::manifest::ManifestEntry;

/// Format a byte count for display.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Download scope from `--tags`. No tags means everything.
pub fn scope_from_tags(tags: Vec<String>) -> DownloadScope {
    if tags.is_empty() {
        DownloadScope::All
    } else {
        DownloadScope::Tags(tags)
    }
}

/// Print one bundle per line with its size and tags.
pub fn print_entries(entries: &[ManifestEntry]) {
    let width = entries.iter().map(|e| e.name.len()).max().unwrap_or(0);
    for entry in entries {
        let tags = if entry.tags.is_empty() {
            String::new()
        } else {
            format!("  [{}]", entry.tags.join(", "))
        };
        println!(
            "  {:width$}  {:>10}{}",
            entry.name,
            format_size(entry.size_bytes),
            tags,
            width = width
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024 / 2), "1.50 MB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.00 GB");
    }

    #[test]
    fn test_empty_tags_means_all() {
        assert_eq!(scope_from_tags(Vec::new()), DownloadScope::All);
        assert_eq!(
            scope_from_tags(vec!["hd".to_string()]),
            DownloadScope::Tags(vec!["hd".to_string()])
        );
    }
}
