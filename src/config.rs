//! Runtime configuration: API keys, endpoint URLs and per-conversation model settings.
//!
//! API keys are resolved from the environment first and then from a TOML
//! secrets file, so a deployment can keep keys out of the process
//! environment entirely.

use serde::{Deserialize, Serialize};
use std::{
    env, fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, warn};

use crate::constants;

const DEFAULT_SECRETS_PATH: &str = ".streamlit/secrets.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::OpenAi, Provider::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Gemini => "gemini",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OpenAI",
            Provider::Gemini => "Gemini",
        }
    }

    pub fn models(&self) -> &'static [&'static str] {
        match self {
            Provider::OpenAi => constants::OPENAI_MODELS,
            Provider::Gemini => constants::GEMINI_MODELS,
        }
    }

    /// Name used for the `<SERVICE>_API_KEY` lookup.
    fn service(&self) -> Service {
        match self {
            Provider::OpenAi => Service::OpenAi,
            Provider::Gemini => Service::Gemini,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "gemini" => Ok(Provider::Gemini),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// External services that need an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    OpenAi,
    Gemini,
    Pinecone,
}

impl Service {
    pub fn key_name(&self) -> &'static str {
        match self {
            Service::OpenAi => "OPENAI_API_KEY",
            Service::Gemini => "GEMINI_API_KEY",
            Service::Pinecone => "PINECONE_API_KEY",
        }
    }
}

/// Key/value pairs read from the secrets file. Missing or unreadable files yield an empty set.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    table: toml::Table,
}

impl Secrets {
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => {
                debug!(path = %path.display(), "No secrets file found");
                return Self::default();
            }
        };
        match raw.parse::<toml::Table>() {
            Ok(table) => Self { table },
            Err(e) => {
                warn!(path = %path.display(), "Ignoring malformed secrets file: {}", e);
                Self::default()
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.table.get(key).and_then(|v| v.as_str())
    }
}

/// Resolve `<SERVICE>_API_KEY` from the environment, falling back to the secrets file.
pub fn lookup_api_key(service: Service, secrets: &Secrets) -> String {
    let key_name = service.key_name();
    match env::var(key_name) {
        Ok(value) if !value.is_empty() => value,
        _ => secrets.get(key_name).unwrap_or_default().to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub openai_api_key: String,
    pub gemini_api_key: String,
    pub pinecone_api_key: String,
    pub openai_base_url: String,
    pub gemini_base_url: String,
    pub pinecone_control_url: String,
    pub templates_dir: PathBuf,
    pub static_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            gemini_api_key: String::new(),
            pinecone_api_key: String::new(),
            openai_base_url: constants::OPENAI_BASE_URL.to_string(),
            gemini_base_url: constants::GEMINI_BASE_URL.to_string(),
            pinecone_control_url: constants::PINECONE_CONTROL_URL.to_string(),
            templates_dir: PathBuf::from("templates"),
            static_dir: PathBuf::from("static"),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let secrets_path = env::var("CITYSENSE_SECRETS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SECRETS_PATH));
        let secrets = Secrets::load(&secrets_path);
        let defaults = Self::default();

        Self {
            openai_api_key: lookup_api_key(Service::OpenAi, &secrets),
            gemini_api_key: lookup_api_key(Service::Gemini, &secrets),
            pinecone_api_key: lookup_api_key(Service::Pinecone, &secrets),
            openai_base_url: env::var("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            gemini_base_url: env::var("GEMINI_BASE_URL").unwrap_or(defaults.gemini_base_url),
            pinecone_control_url: env::var("PINECONE_CONTROL_URL")
                .unwrap_or(defaults.pinecone_control_url),
            templates_dir: env::var("CITYSENSE_TEMPLATES")
                .map(PathBuf::from)
                .unwrap_or(defaults.templates_dir),
            static_dir: env::var("CITYSENSE_STATIC")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_dir),
        }
    }

    pub fn api_key(&self, service: Service) -> &str {
        match service {
            Service::OpenAi => &self.openai_api_key,
            Service::Gemini => &self.gemini_api_key,
            Service::Pinecone => &self.pinecone_api_key,
        }
    }

    pub fn is_api_configured(&self, service: Service) -> bool {
        !self.api_key(service).is_empty()
    }

    pub fn is_provider_configured(&self, provider: Provider) -> bool {
        self.is_api_configured(provider.service())
    }

    /// Providers with a configured key, OpenAI first.
    pub fn available_providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.is_provider_configured(*p))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub provider: Provider,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub use_context: bool,
    pub system_prompt: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        let model = if constants::OPENAI_MODELS.contains(&constants::DEFAULT_MODEL.as_str()) {
            constants::DEFAULT_MODEL.clone()
        } else {
            "gpt-3.5-turbo".to_string()
        };
        Self {
            provider: Provider::OpenAi,
            model,
            temperature: constants::TEMPERATURE
                .clamp(constants::MIN_TEMPERATURE, constants::MAX_TEMPERATURE),
            max_tokens: (*constants::MAX_TOKENS)
                .clamp(constants::MIN_MAX_TOKENS, constants::MAX_MAX_TOKENS),
            use_context: true,
            system_prompt: constants::default_system_prompt().to_string(),
        }
    }
}

/// A requested settings change. Every field is optional and unknown values are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i64>,
    pub use_context: Option<bool>,
    pub system_prompt: Option<String>,
    /// Name of a system prompt preset. Anything but `default` overrides `system_prompt`.
    pub prompt_preset: Option<String>,
}

impl ModelSettings {
    /// Apply `update` on top of these settings, validating the result.
    pub fn merged(&self, update: &SettingsUpdate) -> ModelSettings {
        let filled = SettingsUpdate {
            provider: update
                .provider
                .clone()
                .or_else(|| Some(self.provider.as_str().to_string())),
            model: update.model.clone().or_else(|| Some(self.model.clone())),
            temperature: update.temperature.or(Some(self.temperature)),
            max_tokens: update.max_tokens.or(Some(i64::from(self.max_tokens))),
            use_context: update.use_context.or(Some(self.use_context)),
            system_prompt: update
                .system_prompt
                .clone()
                .or_else(|| Some(self.system_prompt.clone())),
            prompt_preset: update.prompt_preset.clone(),
        };
        validate_model_settings(&filled)
    }
}

/// Validate and sanitize a settings request against the defaults.
pub fn validate_model_settings(update: &SettingsUpdate) -> ModelSettings {
    let mut validated = ModelSettings::default();

    if let Some(provider) = update.provider.as_deref().and_then(|p| p.parse().ok()) {
        validated.provider = provider;
    }

    let models = validated.provider.models();
    validated.model = match update.model.as_deref() {
        Some(model) if models.contains(&model) => model.to_string(),
        _ if models.contains(&validated.model.as_str()) => validated.model,
        _ => models[0].to_string(),
    };

    if let Some(temperature) = update.temperature.filter(|t| t.is_finite()) {
        validated.temperature =
            temperature.clamp(constants::MIN_TEMPERATURE, constants::MAX_TEMPERATURE);
    }

    if let Some(max_tokens) = update.max_tokens {
        validated.max_tokens = max_tokens.clamp(
            i64::from(constants::MIN_MAX_TOKENS),
            i64::from(constants::MAX_MAX_TOKENS),
        ) as u32;
    }

    if let Some(use_context) = update.use_context {
        validated.use_context = use_context;
    }

    if let Some(prompt) = update.system_prompt.as_deref() {
        let trimmed = prompt.trim();
        if !trimmed.is_empty() {
            validated.system_prompt = trimmed.to_string();
        }
    }

    if let Some(preset) = update
        .prompt_preset
        .as_deref()
        .filter(|p| *p != constants::DEFAULT_PROMPT_KEY)
        .and_then(constants::system_prompt)
    {
        validated.system_prompt = preset.to_string();
    }

    validated
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_provider_parsing() {
        assert_eq!("openai".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert_eq!(" Gemini ".parse::<Provider>().unwrap(), Provider::Gemini);
        assert!("anthropic".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Provider::OpenAi).unwrap(), "\"openai\"");
        assert_eq!(serde_json::to_string(&Provider::Gemini).unwrap(), "\"gemini\"");
    }

    #[test]
    fn test_available_providers_order() {
        let mut settings = Settings::default();
        assert!(settings.available_providers().is_empty());

        settings.gemini_api_key = "g".to_string();
        assert_eq!(settings.available_providers(), vec![Provider::Gemini]);

        settings.openai_api_key = "o".to_string();
        assert_eq!(
            settings.available_providers(),
            vec![Provider::OpenAi, Provider::Gemini]
        );
    }

    #[test]
    fn test_validate_clamps_numbers() {
        let update = SettingsUpdate {
            temperature: Some(5.0),
            max_tokens: Some(-3),
            ..Default::default()
        };
        let validated = validate_model_settings(&update);
        assert_eq!(validated.temperature, 2.0);
        assert_eq!(validated.max_tokens, 1);

        let update = SettingsUpdate {
            temperature: Some(-1.0),
            max_tokens: Some(100_000),
            ..Default::default()
        };
        let validated = validate_model_settings(&update);
        assert_eq!(validated.temperature, 0.0);
        assert_eq!(validated.max_tokens, 4000);
    }

    #[test]
    fn test_validate_rejects_model_from_other_provider() {
        let update = SettingsUpdate {
            provider: Some("gemini".to_string()),
            model: Some("gpt-4".to_string()),
            ..Default::default()
        };
        let validated = validate_model_settings(&update);
        assert_eq!(validated.provider, Provider::Gemini);
        assert_eq!(validated.model, "gemini-pro");
    }

    #[test]
    fn test_validate_ignores_unknown_provider_and_blank_prompt() {
        let update = SettingsUpdate {
            provider: Some("mystery".to_string()),
            system_prompt: Some("   ".to_string()),
            ..Default::default()
        };
        let validated = validate_model_settings(&update);
        assert_eq!(validated.provider, Provider::OpenAi);
        assert_eq!(validated.system_prompt, constants::default_system_prompt());
    }

    #[test]
    fn test_prompt_preset_overrides_custom_prompt() {
        let update = SettingsUpdate {
            system_prompt: Some("Talk like a pirate".to_string()),
            prompt_preset: Some("concise".to_string()),
            ..Default::default()
        };
        let validated = validate_model_settings(&update);
        assert!(validated.system_prompt.starts_with("You are a concise AI assistant"));

        let update = SettingsUpdate {
            system_prompt: Some("  Talk like a pirate ".to_string()),
            prompt_preset: Some("default".to_string()),
            ..Default::default()
        };
        assert_eq!(validate_model_settings(&update).system_prompt, "Talk like a pirate");
    }

    #[test]
    fn test_merged_keeps_unspecified_fields() {
        let current = ModelSettings {
            provider: Provider::Gemini,
            model: "gemini-pro-vision".to_string(),
            temperature: 1.3,
            max_tokens: 512,
            use_context: false,
            system_prompt: "Be brief".to_string(),
        };
        let merged = current.merged(&SettingsUpdate {
            temperature: Some(0.2),
            ..Default::default()
        });
        assert_eq!(merged.provider, Provider::Gemini);
        assert_eq!(merged.model, "gemini-pro-vision");
        assert_eq!(merged.temperature, 0.2);
        assert_eq!(merged.max_tokens, 512);
        assert!(!merged.use_context);
        assert_eq!(merged.system_prompt, "Be brief");
    }

    #[test]
    fn test_secrets_file_lookup() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "CITYSENSE_TEST_ONLY_KEY = \"from-file\"").unwrap();
        let secrets = Secrets::load(file.path());
        assert_eq!(secrets.get("CITYSENSE_TEST_ONLY_KEY"), Some("from-file"));
        assert_eq!(secrets.get("MISSING"), None);
    }

    #[test]
    fn test_missing_secrets_file_is_empty() {
        let secrets = Secrets::load(Path::new("/nonexistent/citysense/secrets.toml"));
        assert_eq!(secrets.get("OPENAI_API_KEY"), None);
    }
}
