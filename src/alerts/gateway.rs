//! Outbound notification gateways.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

use super::AlertPayload;
use crate::config::GatewayConfig;
use crate::detect::Severity;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait Gateway: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one alert. Errors are retried by the dispatcher.
    async fn deliver(&self, payload: &AlertPayload) -> Result<(), GatewayError>;

    /// Free-form operator notice (startup, shutdown).
    async fn announce(&self, text: &str) -> Result<(), GatewayError>;
}

/// Build the configured gateway. The HTTP client carries no timeout of its
/// own; the dispatcher bounds each attempt.
pub fn build_gateway(config: &GatewayConfig) -> Result<Arc<dyn Gateway>> {
    let client = Client::builder()
        .user_agent(concat!("pingwarden/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    Ok(match config {
        GatewayConfig::Telegram {
            bot_token,
            chat_id,
            api_base,
        } => Arc::new(TelegramGateway {
            client,
            endpoint: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), bot_token),
            chat_id: chat_id.clone(),
        }),
        GatewayConfig::Webhook { url } => Arc::new(WebhookGateway {
            client,
            url: url.clone(),
        }),
    })
}

async fn check_status(resp: reqwest::Response) -> Result<(), GatewayError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(GatewayError::Status {
        status: status.as_u16(),
        body: body.chars().take(200).collect(),
    })
}

// ---------------------------------------------------------------------------
// Telegram
// ---------------------------------------------------------------------------

pub struct TelegramGateway {
    client: Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramGateway {
    async fn send(&self, text: String) -> Result<(), GatewayError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        let resp = self.client.post(&self.endpoint).json(&body).send().await?;
        check_status(resp).await
    }
}

#[async_trait]
impl Gateway for TelegramGateway {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, payload: &AlertPayload) -> Result<(), GatewayError> {
        self.send(format_telegram(payload)).await
    }

    async fn announce(&self, text: &str) -> Result<(), GatewayError> {
        self.send(text.to_string()).await
    }
}

fn severity_marker(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "🚨",
        Severity::Warning => "🟠",
        Severity::Info => "ℹ️",
    }
}

/// Render an alert as Telegram legacy Markdown.
pub fn format_telegram(p: &AlertPayload) -> String {
    let mut text = format!(
        "{} *{}*\n\n*Target:* {}\n*Address:* {}\n*Severity:* {}\n*Loss:* {:.0}%",
        severity_marker(p.severity),
        escape_markdown(&p.title),
        code_span(&p.target),
        code_span(&p.address),
        p.severity,
        p.loss_percent
    );
    if let Some(rtt) = p.rtt_mean_ms {
        text.push_str(&format!("\n*Mean RTT:* {:.1} ms", rtt));
    }
    if let (Some(score), Some(cutoff)) = (p.score, p.cutoff) {
        text.push_str(&format!(
            "\n*Score:* {:.3} (cutoff {:.3}, {})",
            score,
            cutoff,
            escape_markdown(&p.method)
        ));
    }
    text.push_str(&format!(
        "\n*Time:* {}",
        p.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    text
}

/// Wrap `text` in a Markdown code span. Legacy Markdown has no escape
/// inside entities, so backticks are replaced rather than escaped.
pub fn code_span(text: &str) -> String {
    format!("`{}`", text.replace('`', "'"))
}

fn escape_markdown(text: &str) -> String {
    text.replace('*', "\\*")
        .replace('_', "\\_")
        .replace('`', "\\`")
        .replace('[', "\\[")
}

// ---------------------------------------------------------------------------
// Generic webhook
// ---------------------------------------------------------------------------

pub struct WebhookGateway {
    client: Client,
    url: String,
}

#[async_trait]
impl Gateway for WebhookGateway {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, payload: &AlertPayload) -> Result<(), GatewayError> {
        let resp = self.client.post(&self.url).json(payload).send().await?;
        check_status(resp).await
    }

    async fn announce(&self, text: &str) -> Result<(), GatewayError> {
        let body = serde_json::json!({ "notice": text });
        let resp = self.client.post(&self.url).json(&body).send().await?;
        check_status(resp).await
    }
}
