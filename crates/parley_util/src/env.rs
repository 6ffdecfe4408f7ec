#![forbid(unsafe_code)]

//! Config file and environment override helpers shared by both binaries.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context as _, anyhow};
use serde::de::DeserializeOwned;

/// `~/.parley/<file_name>`.
pub fn default_config_path(file_name: &str) -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join(file_name))
}

/// Parse a TOML file; a missing file yields `None`.
pub fn read_toml_if_exists<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: T = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

pub fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

/// Trimmed, non-empty value of `key`.
pub fn env_string(key: &str) -> Option<String> {
	std::env::var(key)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

/// Parsed value of `key`; unparsable values are ignored.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
	env_string(key).and_then(|v| v.parse::<T>().ok())
}

pub fn env_bool(key: &str) -> Option<bool> {
	env_string(key).and_then(|v| parse_env_bool(&v))
}

/// Non-empty, trimmed string from an optional file value.
pub fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
