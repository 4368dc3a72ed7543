// System status display: detector availability, list sizes, cache sizes.

use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use crate::config::Config;
use crate::detectors::Availability;
use crate::phash::ListKind;
use crate::pipeline::Pipeline;
use crate::state::SharedState;

/// Display system status to the terminal.
pub fn show(config: &Config, state: &SharedState, pipeline: &Pipeline) -> Result<()> {
    println!("{}", "=== modgate status ===".bold());
    println!("Data dir: {}", config.data_dir.display());

    println!("\n{}", "Detectors".bold());
    for detector in pipeline.detectors() {
        match detector.availability() {
            Availability::Ready => println!("  {:<22} {}", detector.name(), "ready".green()),
            Availability::Unavailable(reason) => println!(
                "  {:<22} {}",
                detector.name(),
                format!("unavailable: {reason}").dimmed()
            ),
        }
    }

    println!("\n{}", "pHash lists".bold());
    for kind in [ListKind::Allow, ListKind::Block] {
        let path = config.list_path(kind);
        if !path.exists() {
            println!("  {:<10} {} (not created yet)", kind.as_str(), path.display());
            continue;
        }
        let entries = state.phash.len(path, kind.default_label())?;
        println!(
            "  {:<10} {} ({} entries, {})",
            kind.as_str(),
            path.display(),
            entries,
            file_size(path)
        );
    }

    println!("\n{}", "API caches".bold());
    for guard in [&state.openai, &state.sightengine] {
        let cache = guard.cache();
        if !cache.is_enabled() {
            println!("  {:<12} disabled", guard.vendor());
            continue;
        }
        let location = cache
            .path()
            .map(|p| format!("{} ({})", p.display(), file_size(p)))
            .unwrap_or_else(|| "in memory".to_string());
        println!("  {:<12} {} entries, {}", guard.vendor(), cache.len(), location);
    }

    Ok(())
}

fn file_size(path: &Path) -> String {
    std::fs::metadata(path)
        .map(|m| format_bytes(m.len()))
        .unwrap_or_else(|_| "missing".to_string())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
