use anyhow::{anyhow, bail, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db;
use crate::models::GenerationParams;
use crate::session::TurnConfig;

const KEY_PROVIDER: &str = "provider_id";
const KEY_MODEL: &str = "model";
const KEY_TEMPERATURE: &str = "temperature";
const KEY_MAX_TOKENS: &str = "max_tokens";
const KEY_STREAM: &str = "stream";
const KEY_SYSTEM_PROMPT: &str = "system_prompt";
const KEY_TELEMETRY: &str = "telemetry_enabled";

/**
 * \brief 用户设置：当前 Provider、模型、生成参数与系统提示词。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub provider_id: String,
    pub model: Option<String>,
    pub params: GenerationParams,
    pub system_prompt: Option<String>,
    pub telemetry_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider_id: "openrouter".to_string(),
            model: None,
            params: GenerationParams::default(),
            system_prompt: None,
            telemetry_enabled: false,
        }
    }
}

impl Settings {
    /**
     * \brief 从 app_config 读取设置，缺失或无法解析的项使用默认值。
     */
    pub fn load(conn: &Connection) -> Result<Self> {
        let defaults = Self::default();
        let provider_id = db::get_config(conn, KEY_PROVIDER)?
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.provider_id);
        let model = db::get_config(conn, KEY_MODEL)?.filter(|s| !s.trim().is_empty());
        let temperature = db::get_config(conn, KEY_TEMPERATURE)?
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.params.temperature);
        let max_tokens = db::get_config(conn, KEY_MAX_TOKENS)?
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.params.max_tokens);
        let stream = db::get_bool_config(conn, KEY_STREAM, defaults.params.stream)?;
        let system_prompt =
            db::get_config(conn, KEY_SYSTEM_PROMPT)?.filter(|s| !s.trim().is_empty());
        let telemetry_enabled = db::get_bool_config(conn, KEY_TELEMETRY, false)?;
        Ok(Self {
            provider_id,
            model,
            params: GenerationParams {
                temperature,
                max_tokens,
                stream,
            },
            system_prompt,
            telemetry_enabled,
        })
    }

    /**
     * \brief 写回全部设置项。
     */
    pub fn save(&self, conn: &Connection) -> Result<()> {
        db::set_config(conn, KEY_PROVIDER, &self.provider_id)?;
        match self.model.as_deref() {
            Some(model) => db::set_config(conn, KEY_MODEL, model)?,
            None => db::delete_config(conn, KEY_MODEL)?,
        }
        db::set_config(conn, KEY_TEMPERATURE, &self.params.temperature.to_string())?;
        db::set_config(conn, KEY_MAX_TOKENS, &self.params.max_tokens.to_string())?;
        db::set_bool_config(conn, KEY_STREAM, self.params.stream)?;
        match self.system_prompt.as_deref() {
            Some(prompt) => db::set_config(conn, KEY_SYSTEM_PROMPT, prompt)?,
            None => db::delete_config(conn, KEY_SYSTEM_PROMPT)?,
        }
        db::set_telemetry_enabled(conn, self.telemetry_enabled)?;
        Ok(())
    }

    /**
     * \brief 按键名修改单个设置项（命令行 `config set` 使用）。
     */
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        let optional = |v: &str| (!v.is_empty()).then(|| v.to_string());
        match key {
            KEY_PROVIDER => {
                if value.is_empty() {
                    bail!("provider_id cannot be empty");
                }
                self.provider_id = value.to_string();
            }
            KEY_MODEL => self.model = optional(value),
            KEY_TEMPERATURE => {
                let t: f32 = value
                    .parse()
                    .map_err(|_| anyhow!("temperature must be a number, got {}", value))?;
                if !(0.0..=2.0).contains(&t) {
                    bail!("temperature must be within 0.0..=2.0");
                }
                self.params.temperature = t;
            }
            KEY_MAX_TOKENS => {
                self.params.max_tokens = value
                    .parse()
                    .map_err(|_| anyhow!("max_tokens must be a positive integer, got {}", value))?;
            }
            KEY_STREAM => self.params.stream = parse_bool(value)?,
            KEY_SYSTEM_PROMPT => self.system_prompt = optional(value),
            KEY_TELEMETRY => self.telemetry_enabled = parse_bool(value)?,
            other => bail!("unknown setting {}", other),
        }
        Ok(())
    }

    /**
     * \brief 生成单轮对话所需的配置。
     */
    pub fn turn_config(&self) -> TurnConfig {
        TurnConfig {
            provider_id: self.provider_id.clone(),
            model: self.model.clone(),
            params: self.params,
            system_prompt: self.system_prompt.clone(),
            api_key: None,
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("expected a boolean, got {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::migrate(&conn).expect("migrate");
        conn
    }

    #[test]
    fn test_defaults_when_nothing_saved() {
        let conn = mem_conn();
        let settings = Settings::load(&conn).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.provider_id, "openrouter");
        assert_eq!(settings.params.max_tokens, 2048);
        assert!(settings.params.stream);
    }

    #[test]
    fn test_save_then_load() {
        let conn = mem_conn();
        let mut settings = Settings::default();
        settings.set("provider_id", "ollama").unwrap();
        settings.set("model", "llama3.1").unwrap();
        settings.set("temperature", "0.7").unwrap();
        settings.set("stream", "off").unwrap();
        settings.set("system_prompt", "Answer tersely.").unwrap();
        settings.save(&conn).unwrap();

        let loaded = Settings::load(&conn).unwrap();
        assert_eq!(loaded, settings);

        settings.set("model", "").unwrap();
        settings.save(&conn).unwrap();
        assert_eq!(Settings::load(&conn).unwrap().model, None);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut settings = Settings::default();
        assert!(settings.set("temperature", "hot").is_err());
        assert!(settings.set("temperature", "3.5").is_err());
        assert!(settings.set("max_tokens", "-1").is_err());
        assert!(settings.set("stream", "maybe").is_err());
        assert!(settings.set("colour", "blue").is_err());
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_turn_config_carries_settings() {
        let mut settings = Settings::default();
        settings.model = Some("gpt-4o-mini".into());
        let config = settings.turn_config();
        assert_eq!(config.provider_id, "openrouter");
        assert_eq!(config.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(config.params, settings.params);
        assert!(config.api_key.is_none());
    }
}
