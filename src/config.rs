use std::env;
use std::str::FromStr;

/// Hard ceiling on generated tokens regardless of configuration.
pub const MAX_TOKENS_CAP: usize = 4096;

/// Gateway configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the OpenAI-compatible generation server.
    pub backend_url: String,
    /// Model identifier forwarded to the backend.
    pub model_name: String,
    /// Default generation bound per request.
    pub max_new_tokens: usize,
    /// Upper bound on the number of messages accepted in one request.
    pub max_history_messages: usize,
    pub temperature: f32,
    pub top_p: f32,
    /// Total per-generation timeout, including streaming.
    pub request_timeout_secs: u64,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            backend_url: env::var("BACKEND_URL")
                .unwrap_or_else(|_| "http://localhost:8081".to_string()),
            model_name: env::var("MODEL_NAME").unwrap_or_else(|_| "local-model".to_string()),
            max_new_tokens: env_or("MAX_NEW_TOKENS", 1024).clamp(1, MAX_TOKENS_CAP),
            max_history_messages: env_or("MAX_HISTORY_MESSAGES", 256),
            temperature: env_or("TEMPERATURE", 0.7),
            top_p: env_or("TOP_P", 0.95),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 300),
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_or("PORT", 8080),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_missing_or_unparsable() {
        assert_eq!(env_or("CHAT_GATEWAY_TEST_UNSET_VAR", 42usize), 42);
        env::set_var("CHAT_GATEWAY_TEST_BAD_VAR", "not-a-number");
        assert_eq!(env_or("CHAT_GATEWAY_TEST_BAD_VAR", 7u16), 7);
        env::remove_var("CHAT_GATEWAY_TEST_BAD_VAR");
    }

    #[test]
    fn max_new_tokens_is_clamped_to_cap() {
        env::set_var("MAX_NEW_TOKENS", "1000000");
        let config = Config::from_env();
        env::remove_var("MAX_NEW_TOKENS");
        assert_eq!(config.max_new_tokens, MAX_TOKENS_CAP);
    }
}
