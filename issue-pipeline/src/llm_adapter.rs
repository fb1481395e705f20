use crate::config::OracleConfig;
use crate::types::{
    ClusterGroup, ClusterRequest, ClusterResponse, CriterionVerdict, GenerateRequest,
    GenerateResponse, PipelineError, Result, ScoreRequest, ScoreResponse,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// External, non-deterministic oracles the pipeline depends on.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Get the name of this LLM adapter
    fn adapter_name(&self) -> String;

    /// Evaluate one item against an ordered criteria list. One verdict per
    /// criterion, in request order; no aggregate.
    async fn score(&self, request: &ScoreRequest) -> Result<ScoreResponse>;

    /// Group an indexed batch of summaries by topic.
    async fn cluster(&self, request: &ClusterRequest) -> Result<ClusterResponse>;

    /// Produce a headline and body for one item.
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse>;
}

const SCORE_SYSTEM: &str = "You evaluate news items for a newsletter. For each numbered criterion, \
give an integer score from 0 to 10 and a one-sentence rationale. The weight after each criterion \
is its share of the item's total. Respond with JSON only: \
{\"criteria\": [{\"score\": <int>, \"rationale\": \"...\"}, ...]} with exactly one entry per criterion, in order.";

const CLUSTER_SYSTEM: &str = "You find news items that cover the same story. Items are given as \
\"[index] summary\". Respond with JSON only: {\"groups\": [{\"topic_signature\": \"...\", \
\"primary_index\": <int>, \"duplicate_indices\": [<int>, ...], \"explanation\": \"...\"}]}. \
Only list groups with at least one duplicate. Use an empty list when nothing repeats.";

const GENERATE_SYSTEM: &str = "You write newsletter articles from source items. Respond with JSON only: \
{\"headline\": \"...\", \"body\": \"...\"}.";

/// OpenAI-compatible chat completions client.
pub struct OpenAiAdapter {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl OpenAiAdapter {
    pub fn new(config: &OracleConfig, api_key: String) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(PipelineError::Config("ORACLE_API_KEY is not set".to_string()));
        }
        let http = reqwest::Client::builder()
            .user_agent("issue-pipeline/0.1")
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        })
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: Option<String>,
        }

        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: system,
                },
                Msg {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.2,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::Oracle(format!("oracle answered HTTP {}", status.as_u16())));
        }

        let body: Resp = resp.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| PipelineError::MalformedOracleOutput("empty completion".to_string()))
    }
}

#[async_trait]
impl LlmAdapter for OpenAiAdapter {
    fn adapter_name(&self) -> String {
        format!("OpenAI-compatible ({})", self.model)
    }

    async fn score(&self, request: &ScoreRequest) -> Result<ScoreResponse> {
        let reply = self.chat(SCORE_SYSTEM, &score_prompt(request)).await?;
        parse_json_reply(&reply)
    }

    async fn cluster(&self, request: &ClusterRequest) -> Result<ClusterResponse> {
        let user = request
            .items
            .iter()
            .map(|c| format!("[{}] {}", c.index, c.summary))
            .collect::<Vec<_>>()
            .join("\n");

        let reply = self.chat(CLUSTER_SYSTEM, &user).await?;
        parse_json_reply(&reply)
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let user = format!("Instructions: {}\n\nSource:\n{}", request.instructions, request.item_text);
        let reply = self.chat(GENERATE_SYSTEM, &user).await?;
        let response: GenerateResponse = parse_json_reply(&reply)?;
        if response.headline.trim().is_empty() {
            return Err(PipelineError::MalformedOracleOutput("empty headline".to_string()));
        }
        Ok(response)
    }
}

/// Numbered criteria with their weights, then the item.
fn score_prompt(request: &ScoreRequest) -> String {
    let mut user = String::from("Criteria:\n");
    for (n, criterion) in request.criteria.iter().enumerate() {
        user.push_str(&format!("{}. {} (weight {})\n", n + 1, criterion.instruction, criterion.weight));
    }
    user.push_str("\nItem:\n");
    user.push_str(&request.item_text);
    user
}

/// Parses a JSON object out of a model reply, tolerating code fences and
/// surrounding prose.
pub fn parse_json_reply<T: DeserializeOwned>(reply: &str) -> Result<T> {
    let trimmed = reply.trim();
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(PipelineError::MalformedOracleOutput(format!(
                "no JSON object in reply: {}",
                crate::utils::text::smart_truncate(trimmed, 120)
            )))
        }
    };
    serde_json::from_str(json).map_err(|e| PipelineError::MalformedOracleOutput(e.to_string()))
}

/// How the mock answers a scoring call for one title.
#[derive(Debug, Clone)]
enum ScoreScript {
    Uniform(i64),
    Fail,
    /// Returns one verdict fewer than requested.
    WrongCount,
}

/// Scripted oracle for tests and offline runs. Items are recognised by title.
pub struct MockLlmAdapter {
    name: String,
    response_delay_ms: u64,
    default_score: i64,
    scores: HashMap<String, ScoreScript>,
    clusters: Vec<(String, String, Vec<String>)>,
    cluster_reply: Option<std::result::Result<ClusterResponse, String>>,
    failing_generation: HashSet<String>,
    generate_calls: AtomicUsize,
    score_calls: AtomicUsize,
}

impl MockLlmAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            response_delay_ms: 0,
            default_score: 5,
            scores: HashMap::new(),
            clusters: Vec::new(),
            cluster_reply: None,
            failing_generation: HashSet::new(),
            generate_calls: AtomicUsize::new(0),
            score_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.response_delay_ms = delay_ms;
        self
    }

    /// Every criterion of `title` gets `score`.
    pub fn with_score(mut self, title: &str, score: i64) -> Self {
        self.scores.insert(title.to_string(), ScoreScript::Uniform(score));
        self
    }

    pub fn failing_score(mut self, title: &str) -> Self {
        self.scores.insert(title.to_string(), ScoreScript::Fail);
        self
    }

    pub fn malformed_score(mut self, title: &str) -> Self {
        self.scores.insert(title.to_string(), ScoreScript::WrongCount);
        self
    }

    /// Reports `duplicates` as repeats of `primary`, matching by title.
    pub fn with_duplicate_group(mut self, signature: &str, primary: &str, duplicates: &[&str]) -> Self {
        self.clusters.push((
            signature.to_string(),
            primary.to_string(),
            duplicates.iter().map(|d| d.to_string()).collect(),
        ));
        self
    }

    /// Returns exactly this clustering reply, indices and all.
    pub fn with_raw_clusters(mut self, response: ClusterResponse) -> Self {
        self.cluster_reply = Some(Ok(response));
        self
    }

    pub fn failing_cluster(mut self, message: &str) -> Self {
        self.cluster_reply = Some(Err(message.to_string()));
        self
    }

    pub fn failing_generation(mut self, title: &str) -> Self {
        self.failing_generation.insert(title.to_string());
        self
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn score_calls(&self) -> usize {
        self.score_calls.load(Ordering::SeqCst)
    }

    async fn simulate_processing(&self) {
        if self.response_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.response_delay_ms)).await;
        }
    }

    fn extract_title(text: &str) -> String {
        if let Some(title_start) = text.find("Title: ") {
            let title_portion = &text[title_start + 7..];
            match title_portion.find('\n') {
                Some(title_end) => title_portion[..title_end].trim().to_string(),
                None => title_portion.trim().to_string(),
            }
        } else {
            "Untitled Item".to_string()
        }
    }
}

fn summary_matches(summary: &str, title: &str) -> bool {
    summary == title || summary.starts_with(&format!("{} - ", title))
}

#[async_trait]
impl LlmAdapter for MockLlmAdapter {
    fn adapter_name(&self) -> String {
        format!("Mock LLM Adapter ({})", self.name)
    }

    async fn score(&self, request: &ScoreRequest) -> Result<ScoreResponse> {
        self.score_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_processing().await;

        let title = Self::extract_title(&request.item_text);
        let script = self
            .scores
            .get(&title)
            .cloned()
            .unwrap_or(ScoreScript::Uniform(self.default_score));

        let verdict = |score: i64| CriterionVerdict {
            score,
            rationale: format!("mock verdict for {}", title),
        };

        match script {
            ScoreScript::Uniform(score) => Ok(ScoreResponse {
                criteria: request.criteria.iter().map(|_| verdict(score)).collect(),
            }),
            ScoreScript::Fail => Err(PipelineError::Oracle(format!("scripted failure for {}", title))),
            ScoreScript::WrongCount => Ok(ScoreResponse {
                criteria: request
                    .criteria
                    .iter()
                    .skip(1)
                    .map(|_| verdict(self.default_score))
                    .collect(),
            }),
        }
    }

    async fn cluster(&self, request: &ClusterRequest) -> Result<ClusterResponse> {
        self.simulate_processing().await;

        match &self.cluster_reply {
            Some(Ok(response)) => return Ok(response.clone()),
            Some(Err(message)) => return Err(PipelineError::Oracle(message.clone())),
            None => {}
        }

        let index_of = |title: &str| {
            request
                .items
                .iter()
                .find(|c| summary_matches(&c.summary, title))
                .map(|c| c.index)
        };

        let mut groups = Vec::new();
        for (signature, primary, duplicates) in &self.clusters {
            let Some(primary_index) = index_of(primary.as_str()) else {
                debug!("Mock cluster primary {} not in batch", primary);
                continue;
            };
            let duplicate_indices: Vec<usize> = duplicates.iter().filter_map(|d| index_of(d.as_str())).collect();
            groups.push(ClusterGroup {
                topic_signature: signature.clone(),
                primary_index,
                duplicate_indices,
                explanation: format!("{} covers the same story", primary),
            });
        }

        info!("Mock clustering of {} items found {} groups", request.items.len(), groups.len());
        Ok(ClusterResponse { groups })
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_processing().await;

        let title = Self::extract_title(&request.item_text);
        if self.failing_generation.contains(&title) {
            return Err(PipelineError::Oracle(format!("scripted generation failure for {}", title)));
        }

        let body = request
            .item_text
            .split("\n\n")
            .nth(1)
            .unwrap_or("")
            .trim()
            .to_string();
        Ok(GenerateResponse {
            headline: title,
            body,
        })
    }
}
