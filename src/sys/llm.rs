use std::{collections::HashMap, fmt::Display, time::Duration};

use handlebars::Handlebars;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    #[serde(rename = "system")]
    System,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = self.as_ref();
        write!(f, "{role}")
    }
}

impl AsRef<str> for Role {
    fn as_ref(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Content {
    pub role: Role,
    #[serde(rename = "content")]
    pub message: String,
}

impl Content {
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            message: message.into(),
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("model request timed out")]
    Timeout,
    #[error("model request failed: {0}")]
    Http(String),
    #[error("model endpoint returned status {0}")]
    Status(u16),
    #[error("model returned no content")]
    EmptyResponse,
    #[error("embedding has {actual} dimensions, expected {expected}")]
    Embedding { expected: usize, actual: usize },
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else if let Some(status) = e.status() {
            LlmError::Status(status.as_u16())
        } else {
            LlmError::Http(e.to_string())
        }
    }
}

/// Text completion collaborator. Implementations block the calling thread.
pub trait Completion: Send + Sync {
    fn complete(&self, prompts: &[Content]) -> Result<String, LlmError>;
}

/// Maps text to a fixed-width vector.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

/// Scales `v` to unit length so inner product equals cosine similarity.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlmOptions {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: u32,
}

const MAX_RETRIES: u32 = 10;

fn default_retries() -> u32 {
    1
}

impl Default for LlmOptions {
    fn default() -> Self {
        let mut options = Self {
            base_url: String::new(),
            model: String::new(),
            api_key_env: None,
            timeout_secs: 0,
            retries: default_retries(),
            retry_backoff_ms: 0,
            temperature: 0.,
            max_tokens: 0,
        };
        options.fill_default_value();
        options
    }
}

impl LlmOptions {
    pub fn fill_default_value(&mut self) {
        if self.base_url.is_empty() {
            self.base_url = "http://127.0.0.1:11434/v1".to_string();
        }
        if self.model.is_empty() {
            self.model = "qwen2.5:7b".to_string();
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = 60;
        }
        if self.retry_backoff_ms == 0 {
            self.retry_backoff_ms = 500;
        }
        if self.temperature == 0. {
            self.temperature = 0.7;
        }
        if self.max_tokens == 0 {
            self.max_tokens = 512;
        }
        if self.retries > MAX_RETRIES {
            log::warn!("llm.retries {} capped at {MAX_RETRIES}", self.retries);
            self.retries = MAX_RETRIES;
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Upper bound on how long one logical call may take including retries.
    pub fn deadline(&self) -> Duration {
        let attempts = self.retries as u64 + 1;
        // backoff doubles per retry: base * (2^retries - 1)
        let factor = 1u64
            .checked_shl(self.retries)
            .map_or(u64::MAX, |f| f - 1);
        let backoff = self.retry_backoff_ms.saturating_mul(factor);
        Duration::from_secs(self.timeout_secs.saturating_mul(attempts))
            .saturating_add(Duration::from_millis(backoff.saturating_add(1000)))
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct EmbeddingOptions {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub dim: usize,
    #[serde(default)]
    pub timeout_secs: u64,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        let mut options = Self {
            base_url: String::new(),
            model: String::new(),
            api_key_env: None,
            dim: 0,
            timeout_secs: 0,
        };
        options.fill_default_value();
        options
    }
}

impl EmbeddingOptions {
    pub fn fill_default_value(&mut self) {
        if self.base_url.is_empty() {
            self.base_url = "http://127.0.0.1:11434/v1".to_string();
        }
        if self.model.is_empty() {
            self.model = "nomic-embed-text".to_string();
        }
        if self.dim == 0 {
            self.dim = 768;
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = 30;
        }
    }
}

fn api_key(env: &Option<String>) -> Option<String> {
    env.as_ref().and_then(|name| std::env::var(name).ok())
}

#[derive(serde::Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Content],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: Content,
}

/// OpenAI-compatible `/chat/completions` client.
pub struct HttpCompletion {
    client: reqwest::blocking::Client,
    options: LlmOptions,
    api_key: Option<String>,
}

impl HttpCompletion {
    pub fn new(options: LlmOptions) -> Result<Self, LlmError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(options.timeout())
            .build()?;
        let api_key = api_key(&options.api_key_env);
        Ok(Self {
            client,
            options,
            api_key,
        })
    }
}

impl Completion for HttpCompletion {
    fn complete(&self, prompts: &[Content]) -> Result<String, LlmError> {
        let url = format!(
            "{}/chat/completions",
            self.options.base_url.trim_end_matches('/')
        );
        let body = ChatRequest {
            model: &self.options.model,
            messages: prompts,
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
            stream: false,
        };

        let mut request = self.client.post(url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response: ChatResponse = request.send()?.error_for_status()?.json()?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.message)
            .filter(|s| !s.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

#[derive(serde::Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(serde::Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(serde::Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` client. Output is normalized.
pub struct HttpEmbedder {
    client: reqwest::blocking::Client,
    options: EmbeddingOptions,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(options: EmbeddingOptions) -> Result<Self, LlmError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(options.timeout_secs))
            .build()?;
        let api_key = api_key(&options.api_key_env);
        Ok(Self {
            client,
            options,
            api_key,
        })
    }
}

impl Embedder for HttpEmbedder {
    fn dim(&self) -> usize {
        self.options.dim
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let url = format!("{}/embeddings", self.options.base_url.trim_end_matches('/'));
        let body = EmbeddingRequest {
            model: &self.options.model,
            input: text,
        };

        let mut request = self.client.post(url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response: EmbeddingResponse = request.send()?.error_for_status()?.json()?;

        let mut vector = response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or(LlmError::EmptyResponse)?;
        if vector.len() != self.options.dim {
            return Err(LlmError::Embedding {
                expected: self.options.dim,
                actual: vector.len(),
            });
        }
        normalize(&mut vector);
        Ok(vector)
    }
}

pub const ACTION_TEMPLATE: &str = "action";
pub const CONVERSATION_TEMPLATE: &str = "conversation";
pub const RE_CONVERSATION_TEMPLATE: &str = "re_conversation";

const DEFAULT_ACTION: &str = r#"You are {{name}}, a character in the scene "{{scene}}". {{description}}
Your mood is {{mood}}. You are at {{location}}{{#if position}} ({{position.x}}, {{position.y}}, {{position.z}}){{/if}}.{{#if time}} It is {{time}}.{{/if}}
People you can see: {{#each observation.people}}{{this}}{{#unless @last}}, {{/unless}}{{else}}nobody{{/each}}.
Items you can see: {{#each observation.items}}{{this}}{{#unless @last}}, {{/unless}}{{else}}nothing{{/each}}.
Places you can go: {{#each observation.locations}}{{this}}{{#unless @last}}, {{/unless}}{{else}}nowhere{{/each}}.
Your backpack: {{#each backpack}}{{this}}{{#unless @last}}, {{/unless}}{{else}}empty{{/each}}.
{{#if memories}}Things you remember:
{{#each memories}}- {{this}}
{{/each}}{{/if}}
{{#if last_action}}Your previous action: {{last_action.action}} {{last_action.object}}.
{{/if}}{{stimulus}}
Available actions: {{#each action_space}}{{this}}{{#unless @last}}, {{/unless}}{{/each}}.
Reply in {{language}} with exactly one action written as <action|object|parameter1,parameter2>."#;

const DEFAULT_CONVERSATION: &str = r#"Write a conversation in {{language}} between {{#each participants}}{{name}}{{#unless @last}}, {{/unless}}{{/each}} at {{location}} about "{{topic}}".
{{#each participants}}
{{name}}: {{description}} Mood: {{mood}}. Backpack: {{#each backpack}}{{this}}{{#unless @last}}, {{/unless}}{{else}}empty{{/each}}. Sees: {{#each observation.people}}{{this}}{{#unless @last}}, {{/unless}}{{else}}nobody{{/each}}.
{{#if memories}}{{name}} remembers:
{{#each memories}}- {{this}}
{{/each}}{{/if}}{{/each}}
{{#if player_desc}}The player: {{player_desc}}
{{/if}}{{#if starting}}The conversation starts with: {{starting}}
{{/if}}Write about {{line_count}} lines. Put each line on its own row in the form
Speaker@[mood]<action|object|parameters>@<what they say>@
Leave the action empty as <> when the speaker does nothing."#;

const DEFAULT_RE_CONVERSATION: &str = r#"Continue a conversation in {{language}} between {{#each participants}}{{name}}{{#unless @last}}, {{/unless}}{{/each}} at {{location}} about "{{topic}}".
{{#each participants}}
{{name}}: {{description}} Mood: {{mood}}.
{{#if memories}}{{name}} remembers:
{{#each memories}}- {{this}}
{{/each}}{{/if}}{{/each}}
{{#if player_desc}}The player: {{player_desc}}
{{/if}}So far:
{{#each history}}{{this}}
{{/each}}Then {{#if character}}{{character}}{{else}}someone{{/if}} interrupts: "{{interruption}}"
Write about {{line_count}} more lines reacting to the interruption. Put each line on its own row in the form
Speaker@[mood]<action|object|parameters>@<what they say>@
Leave the action empty as <> when the speaker does nothing."#;

/// Handlebars registry holding the three engine prompts.
pub struct Prompts {
    registry: Handlebars<'static>,
}

impl Prompts {
    pub fn new(overrides: &HashMap<String, String>) -> Result<Self, handlebars::TemplateError> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);

        for (name, default) in [
            (ACTION_TEMPLATE, DEFAULT_ACTION),
            (CONVERSATION_TEMPLATE, DEFAULT_CONVERSATION),
            (RE_CONVERSATION_TEMPLATE, DEFAULT_RE_CONVERSATION),
        ] {
            let source = overrides.get(name).map(String::as_str).unwrap_or(default);
            registry.register_template_string(name, source)?;
        }

        for name in overrides.keys() {
            if !registry.has_template(name) {
                log::warn!("ignoring unknown prompt template `{name}`");
            }
        }

        Ok(Self { registry })
    }

    pub fn render<T: serde::Serialize>(
        &self,
        name: &str,
        data: &T,
    ) -> Result<String, handlebars::RenderError> {
        let prompt = self.registry.render(name, data)?;
        log::debug!("prompt `{name}`:\n{prompt}");
        Ok(prompt)
    }
}

pub fn language_name(code: &str) -> &str {
    match code {
        "C" | "c" | "zh" => "Chinese",
        "E" | "e" | "en" => "English",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_makes_unit_vector() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0; 4];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0; 4]);
    }

    #[test]
    fn default_prompts_render_without_escaping() {
        let prompts = Prompts::new(&HashMap::new()).unwrap();
        let data = serde_json::json!({
            "name": "王大妈",
            "scene": "village",
            "description": "A kind neighbour.",
            "mood": "happy",
            "location": "李大爷家",
            "observation": {"people": ["李大爷"], "items": [], "locations": []},
            "backpack": [],
            "memories": ["I gave <tea> to 李大爷"],
            "stimulus": "Decide what to do next.",
            "action_space": ["chat", "mov"],
            "language": "English",
        });
        let prompt = prompts.render(ACTION_TEMPLATE, &data).unwrap();
        assert!(prompt.contains("You are 王大妈"));
        assert!(prompt.contains("People you can see: 李大爷."));
        assert!(prompt.contains("Items you can see: nothing."));
        assert!(prompt.contains("- I gave <tea> to 李大爷"));
        assert!(prompt.contains("Available actions: chat, mov."));
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert(ACTION_TEMPLATE.to_string(), "hi {{name}}".to_string());
        let prompts = Prompts::new(&overrides).unwrap();
        let prompt = prompts
            .render(ACTION_TEMPLATE, &serde_json::json!({"name": "x"}))
            .unwrap();
        assert_eq!(prompt, "hi x");
    }

    #[test]
    fn deadline_covers_retries() {
        let options = LlmOptions {
            timeout_secs: 10,
            retries: 2,
            retry_backoff_ms: 100,
            ..LlmOptions::default()
        };
        // 3 attempts, 100 + 200 ms backoff, 1s slack
        assert_eq!(options.deadline(), Duration::from_millis(31_300));
    }

    #[test]
    fn huge_retry_counts_are_capped_and_never_overflow() {
        let mut options = LlmOptions {
            retries: 200,
            ..LlmOptions::default()
        };
        assert!(options.deadline() > Duration::from_secs(60 * 200));
        options.fill_default_value();
        assert_eq!(options.retries, 10);
        // 11 attempts of 60s, 500ms * 1023 backoff, 1s slack
        assert_eq!(options.deadline(), Duration::from_millis(660_000 + 511_500 + 1000));
    }
}
