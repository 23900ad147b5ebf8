use std::env;

/// Settings for the external payment processor.
///
/// `webhook_secret = None` puts the webhook endpoint into reduced-trust test
/// mode: deliveries are accepted without signature verification. That posture
/// is announced at startup and on every unverified delivery.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: Option<String>,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub gateway: GatewayConfig,
}

impl AppConfig {
    /// Build the whole configuration once at startup. Everything downstream
    /// receives it by injection; nothing reads the environment afterwards.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(3000);
        let jwt_secret = env::var("JWT_SECRET")?;

        let gateway = GatewayConfig {
            base_url: env::var("GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "https://api.gateway.example".to_string()),
            key_id: env::var("GATEWAY_KEY_ID")?,
            key_secret: env::var("GATEWAY_KEY_SECRET")?,
            webhook_secret: env::var("GATEWAY_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            currency: env::var("GATEWAY_CURRENCY").unwrap_or_else(|_| "INR".to_string()),
        };

        Ok(Self {
            database_url,
            host,
            port,
            jwt_secret,
            gateway,
        })
    }
}
