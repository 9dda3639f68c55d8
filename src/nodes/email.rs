//! Email node - send emails through provider HTTP APIs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::types::{Node, NodeContext, NodeMetadata, NodeResult, ParameterSpec};
use crate::error::{Error, Result};

const EMAIL_TIMEOUT_SECS: u64 = 30;

/// Email node for sending emails.
pub struct EmailNode {
    client: Client,
}

impl EmailNode {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(EMAIL_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

impl Default for EmailNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct EmailConfig {
    /// Email provider: "sendgrid", "resend", "mailgun"
    #[serde(default = "default_provider")]
    provider: String,

    /// Recipient email address(es)
    to: StringOrVec,

    /// Sender email address
    from: String,

    subject: String,

    /// Plain-text body
    #[serde(default)]
    body: Option<String>,

    #[serde(default)]
    html: Option<String>,

    #[serde(default)]
    cc: Option<StringOrVec>,

    #[serde(default)]
    bcc: Option<StringOrVec>,

    #[serde(default)]
    reply_to: Option<String>,

    /// Mailgun sending domain
    #[serde(default)]
    domain: Option<String>,

    /// Provider API base URL override
    #[serde(default)]
    api_base: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrVec {
    Single(String),
    Multiple(Vec<String>),
}

impl StringOrVec {
    fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrVec::Single(s) => vec![s.clone()],
            StringOrVec::Multiple(v) => v.clone(),
        }
    }
}

fn default_provider() -> String {
    "sendgrid".to_string()
}

const PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec::optional("provider", "string", "sendgrid | resend | mailgun"),
    ParameterSpec::required("to", "string|array", "Recipient address(es)"),
    ParameterSpec::required("from", "string", "Sender address"),
    ParameterSpec::required("subject", "string", "Subject line"),
    ParameterSpec::optional("body", "string", "Plain-text body"),
    ParameterSpec::optional("html", "string", "HTML body"),
    ParameterSpec::optional("domain", "string", "Mailgun sending domain"),
];

#[async_trait]
impl Node for EmailNode {
    fn node_type(&self) -> &str {
        "email"
    }

    fn description(&self) -> &str {
        "Send emails via SendGrid, Resend, or Mailgun"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::transform().with_parameters(PARAMETERS)
    }

    fn service_key(&self, params: &Value) -> Option<String> {
        let provider = params
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or("sendgrid");
        Some(format!("email:{}", provider))
    }

    async fn execute(&self, params: &Value, ctx: &NodeContext) -> Result<NodeResult> {
        let config: EmailConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Validation(format!("Invalid email config: {}", e)))?;

        if config.body.is_none() && config.html.is_none() {
            return Err(Error::Validation(
                "Email node requires 'body' or 'html'".to_string(),
            ));
        }

        debug!(
            provider = %config.provider,
            recipients = config.to.to_vec().len(),
            "Sending email"
        );

        ctx.check_cancelled()?;
        let output = match config.provider.as_str() {
            "sendgrid" => self.send_sendgrid(&config, ctx.require_credential("api_key")?).await?,
            "resend" => self.send_resend(&config, ctx.require_credential("api_key")?).await?,
            "mailgun" => self.send_mailgun(&config, ctx.require_credential("api_key")?).await?,
            "smtp" => {
                return Err(Error::Validation(
                    "SMTP delivery is not supported; use sendgrid, resend, or mailgun".to_string(),
                ))
            }
            other => {
                return Err(Error::Validation(format!("Unknown email provider: {}", other)))
            }
        };

        info!(provider = %config.provider, "Email sent");
        Ok(NodeResult::main(vec![output]))
    }
}

impl EmailNode {
    async fn send_sendgrid(&self, config: &EmailConfig, api_key: &str) -> Result<Value> {
        let base = config.api_base.as_deref().unwrap_or("https://api.sendgrid.com");
        let addresses = |list: &StringOrVec| -> Vec<Value> {
            list.to_vec().into_iter().map(|e| json!({"email": e})).collect()
        };

        let mut personalization = json!({ "to": addresses(&config.to) });
        if let Some(cc) = &config.cc {
            personalization["cc"] = json!(addresses(cc));
        }
        if let Some(bcc) = &config.bcc {
            personalization["bcc"] = json!(addresses(bcc));
        }

        let mut content: Vec<Value> = Vec::new();
        if let Some(body) = &config.body {
            content.push(json!({"type": "text/plain", "value": body}));
        }
        if let Some(html) = &config.html {
            content.push(json!({"type": "text/html", "value": html}));
        }

        let mut body = json!({
            "personalizations": [personalization],
            "from": { "email": config.from },
            "subject": config.subject,
            "content": content,
        });
        if let Some(reply_to) = &config.reply_to {
            body["reply_to"] = json!({"email": reply_to});
        }

        let response = self
            .client
            .post(format!("{}/v3/mail/send", base.trim_end_matches('/')))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        check_status("SendGrid", status, response).await?;

        Ok(json!({
            "success": true,
            "provider": "sendgrid",
            "status": status,
            "message_id": message_id,
            "to": config.to.to_vec(),
        }))
    }

    async fn send_resend(&self, config: &EmailConfig, api_key: &str) -> Result<Value> {
        let base = config.api_base.as_deref().unwrap_or("https://api.resend.com");
        let body = json!({
            "from": config.from,
            "to": config.to.to_vec(),
            "cc": config.cc.as_ref().map(|c| c.to_vec()),
            "bcc": config.bcc.as_ref().map(|b| b.to_vec()),
            "reply_to": config.reply_to,
            "subject": config.subject,
            "text": config.body,
            "html": config.html,
        });

        let response = self
            .client
            .post(format!("{}/emails", base.trim_end_matches('/')))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let response = check_status("Resend", status, response).await?;
        let response_body: Value = response.json().await.unwrap_or(json!({}));

        Ok(json!({
            "success": true,
            "provider": "resend",
            "id": response_body["id"],
            "to": config.to.to_vec(),
        }))
    }

    async fn send_mailgun(&self, config: &EmailConfig, api_key: &str) -> Result<Value> {
        let domain = config
            .domain
            .as_deref()
            .ok_or_else(|| Error::Validation("Mailgun requires 'domain'".to_string()))?;
        let base = config.api_base.as_deref().unwrap_or("https://api.mailgun.net");

        let mut form: Vec<(&str, String)> = vec![
            ("from", config.from.clone()),
            ("subject", config.subject.clone()),
        ];
        form.extend(config.to.to_vec().into_iter().map(|to| ("to", to)));
        if let Some(cc) = &config.cc {
            form.extend(cc.to_vec().into_iter().map(|a| ("cc", a)));
        }
        if let Some(bcc) = &config.bcc {
            form.extend(bcc.to_vec().into_iter().map(|a| ("bcc", a)));
        }
        if let Some(body) = &config.body {
            form.push(("text", body.clone()));
        }
        if let Some(html) = &config.html {
            form.push(("html", html.clone()));
        }
        if let Some(reply_to) = &config.reply_to {
            form.push(("h:Reply-To", reply_to.clone()));
        }

        let response = self
            .client
            .post(format!("{}/v3/{}/messages", base.trim_end_matches('/'), domain))
            .basic_auth("api", Some(api_key))
            .form(&form)
            .send()
            .await?;

        let status = response.status().as_u16();
        let response = check_status("Mailgun", status, response).await?;
        let response_body: Value = response.json().await.unwrap_or(json!({}));

        Ok(json!({
            "success": true,
            "provider": "mailgun",
            "id": response_body["id"],
            "to": config.to.to_vec(),
        }))
    }
}

async fn check_status(
    provider: &str,
    status: u16,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    if status < 400 {
        return Ok(response);
    }
    let error_body = response.text().await.unwrap_or_default();
    Err(Error::HttpStatus {
        status,
        message: format!("{} error: {}", provider, error_body),
    })
}
