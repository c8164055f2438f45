use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AResult};
use clap::Parser;
use serde::Deserialize;

/// Command-line options. Every option can also be set from the config
/// file; the command line wins.
#[derive(Parser, Debug)]
#[command(name = "scry", about = "Mirror an Android device over forwarded sockets")]
pub struct Cli {
    /// Path to a TOML config file (defaults to ./scry.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Forwarded video stream address
    #[arg(long)]
    pub video_addr: Option<String>,

    /// Forwarded audio stream address
    #[arg(long)]
    pub audio_addr: Option<String>,

    /// Forwarded control socket address
    #[arg(long)]
    pub control_addr: Option<String>,

    /// Disable audio forwarding
    #[arg(long)]
    pub no_audio: bool,

    /// Audio buffering target, in milliseconds
    #[arg(long)]
    pub audio_buffer: Option<u32>,

    /// Audio device buffer size, in milliseconds
    #[arg(long)]
    pub audio_output_buffer: Option<u32>,

    /// Extra video buffering delay, in milliseconds
    #[arg(long)]
    pub video_buffer: Option<u32>,

    /// Record the session to this file
    #[arg(long)]
    pub record: Option<PathBuf>,

    /// Container format, when not deducible from the record file name
    #[arg(long)]
    pub record_format: Option<String>,

    /// Record orientation, in degrees (0, 90, 180 or 270)
    #[arg(long)]
    pub record_orientation: Option<u32>,

    /// End the session after this many seconds
    #[arg(long)]
    pub time_limit: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub video_addr: String,
    pub audio_addr: String,
    pub control_addr: String,
    pub audio: bool,
    pub audio_buffer: u32,
    pub audio_output_buffer: u32,
    pub video_buffer: u32,
    pub record: Option<PathBuf>,
    pub record_format: Option<String>,
    pub record_orientation: u32,
    pub time_limit: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video_addr: "127.0.0.1:27183".into(),
            audio_addr: "127.0.0.1:27184".into(),
            control_addr: "127.0.0.1:27185".into(),
            audio: true,
            audio_buffer: 50,
            audio_output_buffer: 5,
            video_buffer: 0,
            record: None,
            record_format: None,
            record_orientation: 0,
            time_limit: None,
        }
    }
}

impl Config {
    pub fn load(cli: &Cli) -> AResult<Config> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None if Path::new("scry.toml").exists() => Self::from_file(Path::new("scry.toml"))?,
            None => Config::default(),
        };

        if let Some(addr) = &cli.video_addr {
            config.video_addr = addr.clone();
        }
        if let Some(addr) = &cli.audio_addr {
            config.audio_addr = addr.clone();
        }
        if let Some(addr) = &cli.control_addr {
            config.control_addr = addr.clone();
        }
        if cli.no_audio {
            config.audio = false;
        }
        if let Some(ms) = cli.audio_buffer {
            config.audio_buffer = ms;
        }
        if let Some(ms) = cli.audio_output_buffer {
            config.audio_output_buffer = ms;
        }
        if let Some(ms) = cli.video_buffer {
            config.video_buffer = ms;
        }
        if let Some(path) = &cli.record {
            config.record = Some(path.clone());
        }
        if let Some(format) = &cli.record_format {
            config.record_format = Some(format.clone());
        }
        if let Some(orientation) = cli.record_orientation {
            config.record_orientation = orientation;
        }
        if let Some(limit) = cli.time_limit {
            config.time_limit = Some(limit);
        }

        anyhow::ensure!(
            config.record_orientation % 90 == 0 && config.record_orientation < 360,
            "record orientation must be one of 0, 90, 180, 270"
        );

        Ok(config)
    }

    fn from_file(path: &Path) -> AResult<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.audio);
        assert_eq!(config.audio_buffer, 50);
        assert_eq!(config.video_buffer, 0);
    }

    #[test]
    fn test_toml_round_trip() {
        let config: Config = toml::from_str(
            r#"
            video_addr = "127.0.0.1:1234"
            audio = false
            record = "/tmp/out.mkv"
            "#,
        )
        .unwrap();

        assert_eq!(config.video_addr, "127.0.0.1:1234");
        assert!(!config.audio);
        assert_eq!(config.record.as_deref(), Some(Path::new("/tmp/out.mkv")));
        // unset keys fall back to the defaults
        assert_eq!(config.audio_buffer, 50);
    }
}
