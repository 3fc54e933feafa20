use serde::Deserialize;

/// Notifier knobs. The signing secret is normally injected through the
/// `WEBHOOK_SECRET` environment variable; an empty secret disables signing
/// (this is how operators turn signing off without removing the variable).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub secret: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            timeout_ms: 10_000,
            max_retries: 3,
        }
    }
}

impl WebhookConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    pub fn signing_enabled(&self) -> bool {
        !self.secret.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_secret_means_unsigned() {
        let cfg = WebhookConfig::default();
        assert!(!cfg.signing_enabled());
        let cfg: WebhookConfig = toml::from_str("secret = \"s3cret\"").unwrap();
        assert!(cfg.signing_enabled());
    }
}
