use std::io::Write;
use std::path::Path;
use std::time::Duration;

use owo_colors::OwoColorize;
use paperfetch_core::{CacheResult, CacheStats, Paper, ResultSource};

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

fn source_label(source: ResultSource) -> &'static str {
    match source {
        ResultSource::Ephemeral => "memory cache",
        ResultSource::Durable => "durable cache",
        ResultSource::Upstream => "upstream",
        ResultSource::None => "nothing",
    }
}

pub fn print_run_header(
    w: &mut dyn Write,
    run: usize,
    total: usize,
    color: ColorMode,
) -> std::io::Result<()> {
    let header = format!("── Run {}/{} ──", run, total);
    if color.enabled() {
        writeln!(w, "{}", header.bold())
    } else {
        writeln!(w, "{}", header)
    }
}

fn print_paper(
    w: &mut dyn Write,
    index: usize,
    paper: &Paper,
    cached: bool,
    color: ColorMode,
) -> std::io::Result<()> {
    let year = paper.year.map(|y| format!(" ({})", y)).unwrap_or_default();
    let marker = if cached { " [cached]" } else { "" };
    if color.enabled() {
        writeln!(w, "{:>3}. {}{}{}", index + 1, paper.title.bold(), year, marker.dimmed())?;
    } else {
        writeln!(w, "{:>3}. {}{}{}", index + 1, paper.title, year, marker)?;
    }

    if !paper.authors.is_empty() {
        let names: Vec<&str> = paper.authors.iter().take(3).map(|a| a.name.as_str()).collect();
        let more = if paper.authors.len() > 3 { ", et al." } else { "" };
        writeln!(w, "     {}{}", names.join(", "), more)?;
    }
    let mut details = Vec::new();
    if let Some(ref venue) = paper.venue {
        details.push(venue.clone());
    }
    if let Some(c) = paper.citation_count {
        details.push(format!("{} citations", c));
    }
    if !details.is_empty() {
        let line = details.join(" · ");
        if color.enabled() {
            writeln!(w, "     {}", line.dimmed())?;
        } else {
            writeln!(w, "     {}", line)?;
        }
    }
    if let Some(url) = paper.pdf_url.as_ref().or(paper.url.as_ref()) {
        writeln!(w, "     {}", url)?;
    }
    Ok(())
}

/// Print one orchestrated search result.
pub fn print_result(
    w: &mut dyn Write,
    result: &CacheResult,
    elapsed: Duration,
    color: ColorMode,
) -> std::io::Result<()> {
    if let Some(ref failure) = result.failure {
        let msg = format!("Search failed ({}): {}", failure.class, failure.message);
        if color.enabled() {
            writeln!(w, "{}", msg.red())?;
        } else {
            writeln!(w, "{}", msg)?;
        }
    }

    for (i, paper) in result.successful.iter().enumerate() {
        let cached = result
            .from_cache
            .iter()
            .any(|p| p.paper_id == paper.paper_id);
        print_paper(w, i, paper, cached, color)?;
    }

    let summary = format!(
        "{} of {} results from {} in {:.0?} ({} already cached)",
        result.successful.len(),
        result.total_requested,
        source_label(result.source),
        elapsed,
        result.from_cache.len(),
    );
    writeln!(w)?;
    if color.enabled() {
        writeln!(w, "{}", summary.green())?;
    } else {
        writeln!(w, "{}", summary)?;
    }

    if result.rate_limited > 0 {
        let msg = format!(
            "{} result(s) skipped: upstream rate limit. Set S2_API_KEY for a higher quota.",
            result.rate_limited
        );
        if color.enabled() {
            writeln!(w, "{}", msg.yellow())?;
        } else {
            writeln!(w, "{}", msg)?;
        }
    }
    writeln!(w)?;
    Ok(())
}

pub fn print_cache_stats(
    w: &mut dyn Write,
    stats: &CacheStats,
    color: ColorMode,
) -> std::io::Result<()> {
    let line = format!(
        "Memory cache: {} entries, {} bytes, hit rate {:.0}% ({} hits / {} misses)",
        stats.total_entries,
        stats.total_size_bytes,
        stats.hit_rate * 100.0,
        stats.hits,
        stats.misses
    );
    if color.enabled() {
        writeln!(w, "{}", line.dimmed())
    } else {
        writeln!(w, "{}", line)
    }
}

pub fn print_store_counts(
    w: &mut dyn Write,
    path: &Path,
    entries: usize,
    papers: usize,
    color: ColorMode,
) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{} {}", "Durable cache:".bold(), path.display())?;
    } else {
        writeln!(w, "Durable cache: {}", path.display())?;
    }
    writeln!(w, "  Searches: {}", entries)?;
    writeln!(w, "  Papers:   {}", papers)?;
    Ok(())
}

pub fn print_purged(
    w: &mut dyn Write,
    path: &Path,
    color: ColorMode,
) -> std::io::Result<()> {
    let msg = format!("Cleared durable cache at {}", path.display());
    if color.enabled() {
        writeln!(w, "{}", msg.green())
    } else {
        writeln!(w, "{}", msg)
    }
}

pub fn print_config_written(
    w: &mut dyn Write,
    path: &Path,
    color: ColorMode,
) -> std::io::Result<()> {
    let msg = format!("Wrote config to {}", path.display());
    if color.enabled() {
        writeln!(w, "{}", msg.green())
    } else {
        writeln!(w, "{}", msg)
    }
}
