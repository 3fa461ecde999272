use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::logger::log;

pub const DEFAULT_API_BASE_URL: &str = "https://fastrack-api.laiosys.dev";
pub const APP_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

pub fn get_api_base_url() -> String {
    std::env::var("FASTRACK_API_URL").unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string())
}

fn token_claims(token: &str) -> anyhow::Result<serde_json::Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(anyhow::anyhow!("Invalid token format"));
    }

    let decoded = URL_SAFE_NO_PAD.decode(parts[1])?;
    Ok(serde_json::from_slice(&decoded)?)
}

pub fn get_user_id_from_token(token: &str) -> anyhow::Result<String> {
    let claims = token_claims(token)?;
    let sub = claims["sub"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("No sub in token"))?;
    Ok(sub.to_string())
}

pub fn get_user_email_from_token(token: &str) -> anyhow::Result<String> {
    let claims = token_claims(token)?;
    let email = claims["email"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("No email in token"))?;
    Ok(email.to_string())
}

pub fn get_email_verified_from_token(token: &str) -> anyhow::Result<bool> {
    let claims = token_claims(token)?;
    Ok(claims["email_verified"].as_bool().unwrap_or(false))
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct TokenData {
    pub id_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default)]
    pub offline_mode: bool,
    /// When true, the derived key is wrapped under the device key and cached
    /// so a returning user does not re-enter the passphrase.
    #[serde(default = "default_remember_device")]
    pub remember_device: bool,
}

fn default_remember_device() -> bool {
    true
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            offline_mode: false,
            remember_device: true,
        }
    }
}

pub fn get_config_dir() -> PathBuf {
    let mut path = dirs::home_dir().expect("Could not find home directory");
    path.push(".fastrack");
    path
}

/// Location of the non-exportable device wrapping key. Stays 0o600 and never
/// leaves this machine.
pub fn get_device_key_path() -> PathBuf {
    let mut path = get_config_dir();
    path.push("device.key");
    path
}

fn write_private(path: &PathBuf, bytes: &[u8]) -> anyhow::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    Ok(())
}

fn config_path() -> PathBuf {
    let mut path = get_config_dir();
    path.push("config.toml");
    path
}

pub fn load_config() -> AppConfig {
    fs::create_dir_all(get_config_dir()).ok();
    let path = config_path();

    if !path.exists() {
        let default_config = AppConfig::default();
        let _ = save_config_to(&path, &default_config);
        return default_config;
    }

    match fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to parse config.toml: {}.", e);
                let backup_path = path.with_extension("toml.bak");
                if let Err(backup_err) = fs::rename(&path, &backup_path) {
                    eprintln!("Failed to backup corrupted config: {}", backup_err);
                } else {
                    eprintln!("Corrupted config backed up to {:?}", backup_path);
                }
                eprintln!("Using default configuration.");
                AppConfig::default()
            }
        },
        Err(e) => {
            eprintln!("Failed to read config file: {}. Using default.", e);
            AppConfig::default()
        }
    }
}

fn save_config_to(path: &PathBuf, config: &AppConfig) -> anyhow::Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    write_private(path, toml_str.as_bytes())
}

pub fn save_config(config: &AppConfig) -> anyhow::Result<()> {
    fs::create_dir_all(get_config_dir())?;
    save_config_to(&config_path(), config)
}

pub fn get_token_data() -> TokenData {
    let mut path = get_config_dir();
    path.push("token.json");

    if let Ok(content) = fs::read_to_string(&path) {
        if let Ok(data) = serde_json::from_str::<TokenData>(&content) {
            return data;
        }
        log("get_token_data: token.json exists but failed to parse");
    }

    TokenData::default()
}

pub fn get_token() -> String {
    get_token_data().id_token
}

pub fn save_token_data(id_token: &str, refresh_token: &str) -> anyhow::Result<()> {
    let data = TokenData {
        id_token: id_token.to_string(),
        refresh_token: refresh_token.to_string(),
    };
    let json = serde_json::to_string(&data)?;

    let config_dir = get_config_dir();
    fs::create_dir_all(&config_dir)?;

    let mut token_path = config_dir;
    token_path.push("token.json");

    match write_private(&token_path, json.as_bytes()) {
        Ok(()) => {
            log("save_token_data: Saved to token.json");
            Ok(())
        }
        Err(e) => {
            log(&format!("save_token_data: Failed: {}", e));
            Err(e)
        }
    }
}

pub fn delete_token_data() -> anyhow::Result<()> {
    let mut path = get_config_dir();
    path.push("token.json");
    if path.exists() {
        fs::remove_file(path)?;
        log("delete_token_data: token.json deleted");
    }
    Ok(())
}
