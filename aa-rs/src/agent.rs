use anyhow::{anyhow, Context, Result};
use ethers::types::Address;
use paypai_vault::parse_address;
use serde_json::Value;

pub const DEFAULT_QWEN_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_QWEN_MODEL: &str = "qwen-plus";

const SYSTEM_PROMPT: &str = r#"You are a blockchain transaction assistant. Parse the user's natural language command into a JSON object.

Available actions:
- "send" or "transfer": Send ETH or tokens to an address

Output format (strict JSON):
{
  "action": "send",
  "recipient": "0x...",
  "amount": "0.01",
  "token": "ETH" (optional, defaults to ETH)
}

Only output the JSON object, nothing else."#;

/// A command the model parsed and we re-validated.
///
/// `recipient` and `amount` are never taken from the model verbatim: the
/// address is re-parsed and the amount re-checked for positivity before
/// anything on-chain-critical sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub action: String,
    pub recipient: Address,
    /// Decimal amount string, validated positive; unit conversion happens at
    /// submission time when the token's decimals are known.
    pub amount: String,
    pub token: String,
}

/// Boundary result of command parsing: either a fully validated command or
/// a reason. Untyped model JSON never crosses this boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Parsed(ParsedCommand),
    ParseError { reason: String },
}

/// Client for the Qwen chat-completion endpoint (OpenAI-compatible mode).
#[derive(Debug, Clone)]
pub struct AgentClient {
    url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new(url: String, api_key: String, model: String) -> Self {
        Self {
            url,
            api_key,
            model,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("QWEN_API_KEY")
            .map_err(|_| anyhow!("missing QWEN_API_KEY (required for natural-language commands)"))?;
        let url = std::env::var("QWEN_API_URL").unwrap_or_else(|_| DEFAULT_QWEN_URL.to_string());
        let model = std::env::var("QWEN_MODEL").unwrap_or_else(|_| DEFAULT_QWEN_MODEL.to_string());
        Ok(Self::new(url, api_key, model))
    }

    /// Parse a free-text command into a validated transfer request.
    ///
    /// Upstream failures (HTTP, malformed completion) are errors; a command
    /// the model understood but we reject (bad address, non-positive
    /// amount, missing fields) comes back as `ParseError` so callers can
    /// show the reason without retrying.
    pub async fn parse_command(&self, command: &str) -> Result<CommandOutcome> {
        let req = serde_json::json!({
            "model": self.model,
            "input": {
                "messages": [
                    { "role": "system", "content": SYSTEM_PROMPT },
                    { "role": "user", "content": command },
                ]
            },
            "parameters": {
                "temperature": 0.3,
                "max_tokens": 500,
                "result_format": "message"
            }
        });

        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to decode Qwen response")?;
        if !status.is_success() {
            return Err(anyhow!("Qwen API error: HTTP {}: {}", status, body));
        }

        let content = extract_content(&body)?;
        Ok(validate_command_json(&content))
    }
}

/// The Qwen endpoint has returned the completion under several shapes over
/// time; accept all of them.
fn extract_content(body: &Value) -> Result<String> {
    if let Some(s) = body
        .pointer("/output/choices/0/message/content")
        .and_then(|v| v.as_str())
    {
        return Ok(s.to_string());
    }
    if let Some(s) = body.pointer("/output/text").and_then(|v| v.as_str()) {
        return Ok(s.to_string());
    }
    if let Some(s) = body
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
    {
        return Ok(s.to_string());
    }
    Err(anyhow!(
        "unexpected Qwen response shape (no completion content): {}",
        body
    ))
}

/// Pull the first JSON object out of the completion text and re-validate
/// every field we might act on.
fn validate_command_json(content: &str) -> CommandOutcome {
    let Some(json_str) = extract_json_object(content) else {
        return CommandOutcome::ParseError {
            reason: format!("no JSON object found in model output: {content}"),
        };
    };

    let parsed: Value = match serde_json::from_str(&json_str) {
        Ok(v) => v,
        Err(e) => {
            return CommandOutcome::ParseError {
                reason: format!("model output is not valid JSON: {e}"),
            }
        }
    };

    let action = match parsed.get("action").and_then(|v| v.as_str()) {
        Some(a) if a == "send" || a == "transfer" => a.to_string(),
        Some(a) => {
            return CommandOutcome::ParseError {
                reason: format!("unsupported action: {a}"),
            }
        }
        None => {
            return CommandOutcome::ParseError {
                reason: "missing action field".to_string(),
            }
        }
    };

    let recipient_raw = match parsed.get("recipient").and_then(|v| v.as_str()) {
        Some(r) => r,
        None => {
            return CommandOutcome::ParseError {
                reason: "missing recipient field".to_string(),
            }
        }
    };
    let recipient = match parse_address(recipient_raw) {
        Ok(a) => a,
        Err(e) => return CommandOutcome::ParseError { reason: e.to_string() },
    };

    // Amount may arrive as a string or a bare number; normalize, then
    // insist it parses as a positive decimal.
    let amount = match parsed.get("amount") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return CommandOutcome::ParseError {
                reason: "missing amount field".to_string(),
            }
        }
    };
    match amount.trim().parse::<f64>() {
        Ok(v) if v > 0.0 && v.is_finite() => {}
        _ => {
            return CommandOutcome::ParseError {
                reason: format!("amount must be a positive number: {amount}"),
            }
        }
    }

    let token = parsed
        .get("token")
        .and_then(|v| v.as_str())
        .unwrap_or("ETH")
        .to_string();

    CommandOutcome::Parsed(ParsedCommand {
        action,
        recipient,
        amount,
        token,
    })
}

fn extract_json_object(content: &str) -> Option<String> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    Some(content[start..=end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RECIPIENT: &str = "0x1234567890123456789012345678901234567890";

    #[test]
    fn content_extracted_from_all_known_shapes() {
        let nested = json!({ "output": { "choices": [ { "message": { "content": "hi" } } ] } });
        assert_eq!(extract_content(&nested).unwrap(), "hi");

        let text = json!({ "output": { "text": "hi" } });
        assert_eq!(extract_content(&text).unwrap(), "hi");

        let openai = json!({ "choices": [ { "message": { "content": "hi" } } ] });
        assert_eq!(extract_content(&openai).unwrap(), "hi");

        assert!(extract_content(&json!({ "foo": "bar" })).is_err());
    }

    #[test]
    fn valid_command_with_surrounding_prose() {
        let content = format!(
            "Here you go:\n{{\"action\": \"send\", \"recipient\": \"{RECIPIENT}\", \"amount\": \"0.5\"}}\nDone."
        );
        match validate_command_json(&content) {
            CommandOutcome::Parsed(cmd) => {
                assert_eq!(cmd.action, "send");
                assert_eq!(cmd.amount, "0.5");
                assert_eq!(cmd.token, "ETH");
            }
            other => panic!("expected parse, got {other:?}"),
        }
    }

    #[test]
    fn numeric_amount_is_normalized() {
        let content =
            format!("{{\"action\": \"transfer\", \"recipient\": \"{RECIPIENT}\", \"amount\": 3}}");
        match validate_command_json(&content) {
            CommandOutcome::Parsed(cmd) => assert_eq!(cmd.amount, "3"),
            other => panic!("expected parse, got {other:?}"),
        }
    }

    #[test]
    fn model_address_is_never_trusted() {
        let content = r#"{"action": "send", "recipient": "0xnotanaddress", "amount": "1"}"#;
        assert!(matches!(
            validate_command_json(content),
            CommandOutcome::ParseError { .. }
        ));
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        for amount in ["0", "-5", "NaN"] {
            let content = format!(
                "{{\"action\": \"send\", \"recipient\": \"{RECIPIENT}\", \"amount\": \"{amount}\"}}"
            );
            assert!(
                matches!(
                    validate_command_json(&content),
                    CommandOutcome::ParseError { .. }
                ),
                "amount {amount} should be rejected"
            );
        }
    }

    #[test]
    fn unsupported_actions_and_missing_fields_fail_closed() {
        let burn = format!(
            "{{\"action\": \"burn\", \"recipient\": \"{RECIPIENT}\", \"amount\": \"1\"}}"
        );
        assert!(matches!(
            validate_command_json(&burn),
            CommandOutcome::ParseError { .. }
        ));

        assert!(matches!(
            validate_command_json("no json here"),
            CommandOutcome::ParseError { .. }
        ));

        assert!(matches!(
            validate_command_json(r#"{"action": "send", "amount": "1"}"#),
            CommandOutcome::ParseError { .. }
        ));
    }
}
