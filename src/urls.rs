//! URL list resolution: direct arguments or a batch file with one URL per
//! line.

use anyhow::{Context, Result, bail};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Reads URLs from a batch file, skipping blank lines and `#` comments.
/// An entirely empty list is an error because the batch would be a no-op.
pub fn load_url_file(path: &Path) -> Result<Vec<String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading URL file {}", path.display()))?;
    let urls: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect();

    if urls.is_empty() {
        bail!("No usable URLs found in {}", path.display());
    }
    Ok(urls)
}

/// Drops syntactically invalid entries and exact duplicates, preserving the
/// input order. Duplicates would race two yt-dlp workers on the same output
/// template.
pub fn sanitize(raw: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::with_capacity(raw.len());

    for entry in raw {
        if url::Url::parse(&entry).is_err() {
            tracing::warn!("Skipping invalid URL: {}", entry);
            continue;
        }
        if !seen.insert(entry.clone()) {
            tracing::warn!("Skipping duplicate URL: {}", entry);
            continue;
        }
        urls.push(entry);
    }

    urls
}
