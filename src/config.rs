//! Optional env-file defaults for the CLI.
//!
//! The file is a plain `KEY=VALUE` list (quotes optional, `#` comments
//! allowed). Every key is optional and an explicit command-line flag always
//! wins over the file.

use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ytbatch-env";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
pub const DEFAULT_OUTPUT_DIR: &str = ".";

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub ytdlp_bin: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub cookies_file: Option<PathBuf>,
    pub quality: Option<u32>,
    pub parallel: Option<usize>,
}

/// Reads the env file, returning `None` when it does not exist. Unknown keys
/// are ignored so the same file can carry deployment-specific extras.
pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            if value.is_empty() {
                continue;
            }
            match key {
                "YTDLP_BIN" => cfg.ytdlp_bin = Some(PathBuf::from(value)),
                "OUTPUT_DIR" => cfg.output_dir = Some(PathBuf::from(value)),
                "COOKIES_FILE" => cfg.cookies_file = Some(PathBuf::from(value)),
                "QUALITY" => {
                    let quality: u32 = value
                        .parse()
                        .with_context(|| format!("Parsing QUALITY from {}", path.display()))?;
                    cfg.quality = Some(quality);
                }
                "PARALLEL" => {
                    let parallel: usize = value
                        .parse()
                        .with_context(|| format!("Parsing PARALLEL from {}", path.display()))?;
                    cfg.parallel = Some(parallel);
                }
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}
