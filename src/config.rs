use bigdecimal::BigDecimal;
use serde::Deserialize;
use std::str::FromStr;

/// Which marketplace steps charge the float and consume quota.
///
/// Both view and claim charge by default; set `CHARGE_ON_CLAIM=false` for a
/// single charge per request.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FeeSchedule {
    pub charge_on_view: bool,
    pub charge_on_claim: bool,
    pub quota_on_view: i32,
    pub quota_on_claim: i32,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            charge_on_view: true,
            charge_on_claim: true,
            quota_on_view: 0,
            quota_on_claim: 1,
        }
    }
}

/// Tunables for the ledger, marketplace, assignments and bonuses.
#[derive(Debug, Clone, Deserialize)]
pub struct FloatConfig {
    pub welcome_bonus: BigDecimal,
    pub daily_quota_limit: i32,
    pub quota_day_utc_offset_minutes: i32,
    pub fees: FeeSchedule,
    pub request_ttl_hours: i64,
    pub assignment_timeout_minutes: i64,
    pub auto_reassign: bool,
    pub referrer_bonus: BigDecimal,
    pub referred_bonus: BigDecimal,
    pub tier_bonus_validity_days: i64,
    pub otp_ttl_secs: u64,
}

impl Default for FloatConfig {
    fn default() -> Self {
        Self {
            welcome_bonus: BigDecimal::from(10),
            daily_quota_limit: 20,
            // Zambia (CAT)
            quota_day_utc_offset_minutes: 120,
            fees: FeeSchedule::default(),
            request_ttl_hours: 24,
            assignment_timeout_minutes: 30,
            auto_reassign: true,
            referrer_bonus: BigDecimal::from(5),
            referred_bonus: BigDecimal::from(5),
            tier_bonus_validity_days: 30,
            otp_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub admin_api_key: String,
    pub payment_webhook_secret: String,
    pub notification_webhook_url: Option<String>,
    pub notification_token: Option<String>,
    pub sweep_interval_secs: u64,
    pub float: FloatConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            admin_api_key: required_secret("ADMIN_API_KEY", optional_var("ADMIN_API_KEY"))?,
            payment_webhook_secret: required_secret(
                "PAYMENT_WEBHOOK_SECRET",
                optional_var("PAYMENT_WEBHOOK_SECRET"),
            )?,
            notification_webhook_url: optional_var("NOTIFICATION_WEBHOOK_URL")
                .map(|raw| {
                    let parsed = url::Url::parse(&raw).map_err(|e| {
                        anyhow::anyhow!("NOTIFICATION_WEBHOOK_URL is not a valid URL: {}", e)
                    })?;
                    if parsed.scheme() != "http" && parsed.scheme() != "https" {
                        anyhow::bail!("NOTIFICATION_WEBHOOK_URL must use http or https");
                    }
                    Ok(raw)
                })
                .transpose()?,
            notification_token: optional_var("NOTIFICATION_TOKEN"),
            sweep_interval_secs: parsed_var("SWEEP_INTERVAL_SECS", 60)?,
            float: FloatConfig::from_env()?,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        if let Some(ref url) = config.notification_webhook_url {
            tracing::info!("Notification webhook configured: {}", url);
        }
        tracing::debug!("Fee schedule: {:?}", config.float.fees);
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}

impl FloatConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = Self {
            welcome_bonus: money_var("WELCOME_BONUS_ZMW", defaults.welcome_bonus)?,
            daily_quota_limit: parsed_var("DAILY_QUOTA_LIMIT", defaults.daily_quota_limit)?,
            quota_day_utc_offset_minutes: parsed_var(
                "QUOTA_DAY_UTC_OFFSET_MINUTES",
                defaults.quota_day_utc_offset_minutes,
            )?,
            fees: FeeSchedule {
                charge_on_view: parsed_var("CHARGE_ON_VIEW", defaults.fees.charge_on_view)?,
                charge_on_claim: parsed_var("CHARGE_ON_CLAIM", defaults.fees.charge_on_claim)?,
                quota_on_view: parsed_var("QUOTA_ON_VIEW", defaults.fees.quota_on_view)?,
                quota_on_claim: parsed_var("QUOTA_ON_CLAIM", defaults.fees.quota_on_claim)?,
            },
            request_ttl_hours: parsed_var("REQUEST_TTL_HOURS", defaults.request_ttl_hours)?,
            assignment_timeout_minutes: parsed_var(
                "ASSIGNMENT_TIMEOUT_MINUTES",
                defaults.assignment_timeout_minutes,
            )?,
            auto_reassign: parsed_var("AUTO_REASSIGN", defaults.auto_reassign)?,
            referrer_bonus: money_var("REFERRER_BONUS_ZMW", defaults.referrer_bonus)?,
            referred_bonus: money_var("REFERRED_BONUS_ZMW", defaults.referred_bonus)?,
            tier_bonus_validity_days: parsed_var(
                "TIER_BONUS_VALIDITY_DAYS",
                defaults.tier_bonus_validity_days,
            )?,
            otp_ttl_secs: parsed_var("OTP_TTL_SECS", defaults.otp_ttl_secs)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let zero = BigDecimal::from(0);
        if self.welcome_bonus < zero {
            anyhow::bail!("WELCOME_BONUS_ZMW cannot be negative");
        }
        if self.referrer_bonus < zero || self.referred_bonus < zero {
            anyhow::bail!("Referral bonuses cannot be negative");
        }
        if self.daily_quota_limit < 0 {
            anyhow::bail!("DAILY_QUOTA_LIMIT cannot be negative");
        }
        if self.fees.quota_on_view < 0 || self.fees.quota_on_claim < 0 {
            anyhow::bail!("QUOTA_ON_VIEW and QUOTA_ON_CLAIM cannot be negative");
        }
        if !(-720..=840).contains(&self.quota_day_utc_offset_minutes) {
            anyhow::bail!("QUOTA_DAY_UTC_OFFSET_MINUTES must be between -720 and 840");
        }
        if self.request_ttl_hours <= 0 || self.assignment_timeout_minutes <= 0 {
            anyhow::bail!("REQUEST_TTL_HOURS and ASSIGNMENT_TIMEOUT_MINUTES must be positive");
        }
        Ok(())
    }
}

/// Shared secrets guard admin review and the money-crediting webhook.
fn required_secret(name: &str, value: Option<String>) -> anyhow::Result<String> {
    let secret = value.ok_or_else(|| anyhow::anyhow!("{} environment variable required", name))?;
    if secret.trim().len() < 16 {
        anyhow::bail!("{} must be at least 16 characters", name);
    }
    Ok(secret)
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match optional_var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", name, raw)),
        None => Ok(default),
    }
}

fn money_var(name: &str, default: BigDecimal) -> anyhow::Result<BigDecimal> {
    match optional_var(name) {
        Some(raw) => BigDecimal::from_str(raw.trim())
            .map(|v| v.with_scale(2))
            .map_err(|_| anyhow::anyhow!("{} must be a decimal amount: {}", name, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_charges_view_and_claim_but_quota_once() {
        let fees = FeeSchedule::default();
        assert!(fees.charge_on_view && fees.charge_on_claim);
        assert_eq!(fees.quota_on_view, 0);
        assert_eq!(fees.quota_on_claim, 1);
    }

    #[test]
    fn secrets_are_required_and_long_enough() {
        assert!(required_secret("PAYMENT_WEBHOOK_SECRET", None).is_err());
        assert!(required_secret("PAYMENT_WEBHOOK_SECRET", Some("short".to_string())).is_err());
        assert_eq!(
            required_secret("PAYMENT_WEBHOOK_SECRET", Some("0123456789abcdef".to_string())).unwrap(),
            "0123456789abcdef"
        );
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(FloatConfig::default().validate().is_ok());
    }

    #[test]
    fn negative_welcome_bonus_is_rejected() {
        let config = FloatConfig {
            welcome_bonus: BigDecimal::from(-1),
            ..FloatConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
