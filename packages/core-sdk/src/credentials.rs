use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/**
 * \brief 凭据来源。返回空字符串与返回 None 等价。
 */
pub trait CredentialStore: Send + Sync {
    fn api_key(&self, provider_id: &str) -> Option<String>;
}

impl<T: CredentialStore + ?Sized> CredentialStore for Arc<T> {
    fn api_key(&self, provider_id: &str) -> Option<String> {
        (**self).api_key(provider_id)
    }
}

/**
 * \brief 内存凭据表，适合测试与命令行临时覆盖。
 */
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    keys: RwLock<HashMap<String, String>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, provider_id: &str, key: &str) -> Self {
        self.set(provider_id, key);
        self
    }

    pub fn set(&self, provider_id: &str, key: &str) {
        if let Ok(mut guard) = self.keys.write() {
            guard.insert(provider_id.to_string(), key.to_string());
        }
    }

    pub fn remove(&self, provider_id: &str) {
        if let Ok(mut guard) = self.keys.write() {
            guard.remove(provider_id);
        }
    }
}

impl CredentialStore for MemoryCredentials {
    fn api_key(&self, provider_id: &str) -> Option<String> {
        self.keys
            .read()
            .ok()
            .and_then(|g| g.get(provider_id).cloned())
            .filter(|k| !k.trim().is_empty())
    }
}

/**
 * \brief 从环境变量读取凭据：先查 `CODEDECK_<ID>_API_KEY`，再查 `<ID>_API_KEY`。
 */
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    /** \brief 按查找顺序返回某个 Provider 对应的变量名。 */
    pub fn variable_names(provider_id: &str) -> [String; 2] {
        let id: String = provider_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        [format!("CODEDECK_{}_API_KEY", id), format!("{}_API_KEY", id)]
    }
}

impl CredentialStore for EnvCredentials {
    fn api_key(&self, provider_id: &str) -> Option<String> {
        Self::variable_names(provider_id)
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|v| !v.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_credentials_treat_blank_as_absent() {
        let creds = MemoryCredentials::new()
            .with_key("openai", "sk-1")
            .with_key("groq", "  ");
        assert_eq!(creds.api_key("openai").as_deref(), Some("sk-1"));
        assert_eq!(creds.api_key("groq"), None);
        creds.remove("openai");
        assert_eq!(creds.api_key("openai"), None);
    }

    #[test]
    fn test_env_variable_names() {
        let [scoped, plain] = EnvCredentials::variable_names("open-router");
        assert_eq!(scoped, "CODEDECK_OPEN_ROUTER_API_KEY");
        assert_eq!(plain, "OPEN_ROUTER_API_KEY");
    }

    #[test]
    fn test_env_credentials_prefer_scoped_variable() {
        std::env::set_var("CODEDECK_ENVTEST_ALPHA_API_KEY", "scoped");
        std::env::set_var("ENVTEST_ALPHA_API_KEY", "plain");
        std::env::set_var("ENVTEST_BETA_API_KEY", "plain-only");
        std::env::set_var("CODEDECK_ENVTEST_GAMMA_API_KEY", "");

        let creds = EnvCredentials;
        assert_eq!(creds.api_key("envtest_alpha").as_deref(), Some("scoped"));
        assert_eq!(creds.api_key("envtest-beta").as_deref(), Some("plain-only"));
        assert_eq!(creds.api_key("envtest_gamma"), None);
    }
}
