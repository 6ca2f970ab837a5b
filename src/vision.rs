use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::env;
use tracing::debug;

use crate::agent::{Action, Decider, PilotError, Snapshot};

#[derive(Clone)]
pub struct VisionConfig {
    pub endpoint: String,    // chat-completions URL, e.g. an exo or OpenAI-compatible server
    pub model: String,       // vision-capable model name
    pub temperature: f32,    // kept low to bias toward deterministic output
    pub api_key: Option<String>, // omitted entirely for local endpoints
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            endpoint: env::var("WEBPILOT_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:52415/v1/chat/completions".into()),
            model: env::var("WEBPILOT_MODEL").unwrap_or_else(|_| "llava-1.5-7b-hf".into()),
            temperature: 0.2,
            api_key: env::var("WEBPILOT_API_KEY").ok().filter(|k| !k.is_empty()),
        }
    }
}

/// The reply contract sent along with every screenshot. The decoder in
/// [`parse_action`] accepts exactly these shapes.
const ACTION_GUIDE: &str = r#"Reply with ONLY a single JSON object, no markdown and no explanation:
{"action":"click","selector":"<css selector>"}
{"action":"type","selector":"<css selector>","text":"<text to enter>"}
{"action":"navigate","url":"<url>"}
{"action":"complete"}"#;

#[derive(Clone)]
pub struct VisionClient {
    http: Client,
    cfg: VisionConfig,
}

impl VisionClient {
    pub fn new(cfg: VisionConfig) -> Self {
        Self { http: Client::new(), cfg }
    }

    fn prompt(task: &str) -> String {
        format!(
            "Task: {task}\nAnalyze this screenshot and tell me what action to take next.\n\n{ACTION_GUIDE}"
        )
    }

    /// One request, one response. The snapshot travels inline as a data URI.
    pub async fn analyze(&self, task: &str, snapshot: &Snapshot) -> Result<String, PilotError> {
        let body = json!({
            "model": self.cfg.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": Self::prompt(task) },
                    { "type": "image_url", "image_url": {
                        "url": format!("data:image/png;base64,{}", snapshot.image_base64)
                    }}
                ]
            }],
            "temperature": self.cfg.temperature,
        });

        let mut req = self.http.post(&self.cfg.endpoint).json(&body);
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| PilotError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PilotError::Transport(format!("endpoint returned {status}: {text}")));
        }
        let envelope: ChatResponse = resp
            .json()
            .await
            .map_err(|e| PilotError::Transport(format!("bad response envelope: {e}")))?;
        extract_content(envelope)
    }
}

#[async_trait]
impl Decider for VisionClient {
    async fn decide(&self, task: &str, snapshot: &Snapshot) -> Result<Action, PilotError> {
        let analysis = self.analyze(task, snapshot).await?;
        debug!(snapshot = %snapshot.id, %analysis, "model analysis");
        parse_action(&analysis)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

fn extract_content(resp: ChatResponse) -> Result<String, PilotError> {
    resp.choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| PilotError::Transport("response envelope has no choices".into()))
}

/// Decode raw model text into an [`Action`]. Anything that is not one of the
/// documented shapes is a parse failure, never a default action.
pub fn parse_action(raw: &str) -> Result<Action, PilotError> {
    // Strip possible markdown fences the model might add
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(cleaned).map_err(|e| PilotError::Parse(format!("{e}; raw: {cleaned}")))
}
