//! Phase chaining transport.
//!
//! A finished phase asks for the next one and returns without waiting for
//! it. Delivery is best effort: a trigger may be lost, duplicated or arrive
//! late, and the receiving phase re-checks the issue status before acting.

use crate::config::TriggerConfig;
use crate::types::{PhaseTriggerRequest, PhaseTriggerResponse, PipelineError, Result};
use crate::workflow::Phase;
use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use reqwest::Client;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[async_trait]
pub trait PhaseTrigger: Send + Sync {
    fn name(&self) -> &'static str;

    /// Requests `phase` for the issue in `request` and returns immediately.
    async fn trigger(&self, phase: Phase, request: PhaseTriggerRequest) -> Result<()>;
}

/// Posts to the phase endpoint of a running `serve` instance.
#[derive(Clone)]
pub struct HttpPhaseTrigger {
    client: Client,
    base_url: String,
    max_retries: u32,
}

impl HttpPhaseTrigger {
    pub fn new(base_url: &str, config: &TriggerConfig) -> Result<Self> {
        url::Url::parse(base_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    /// Delivers one trigger and waits for the endpoint's answer. Connection
    /// failures are retried a bounded number of times; any non-2xx answer is
    /// returned as an error straight away.
    pub async fn send(&self, phase: Phase, request: &PhaseTriggerRequest) -> Result<PhaseTriggerResponse> {
        let url = format!("{}/phases/{}", self.base_url, phase);

        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_millis(200),
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            match self.client.post(&url).json(request).send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        return Err(PipelineError::Trigger(format!(
                            "{} for issue {} answered HTTP {}",
                            phase,
                            request.issue_id,
                            status.as_u16()
                        )));
                    }
                    return Ok(response.json::<PhaseTriggerResponse>().await?);
                }
                Err(e) if attempt < self.max_retries => match backoff.next_backoff() {
                    Some(delay) => {
                        attempt += 1;
                        warn!("Trigger attempt {} for {} failed, retrying in {:?}: {}", attempt, phase, delay, e);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e.into()),
                },
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl PhaseTrigger for HttpPhaseTrigger {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn trigger(&self, phase: Phase, request: PhaseTriggerRequest) -> Result<()> {
        let this = self.clone();
        tokio::spawn(async move {
            match this.send(phase, &request).await {
                Ok(response) => info!(
                    "Triggered {} for issue {}: {}",
                    phase, request.issue_id, response.message
                ),
                // Left in its resting state, the issue is failed by the stuck-issue sweep.
                Err(e) => warn!("Trigger of {} for issue {} failed: {}", phase, request.issue_id, e),
            }
        });
        Ok(())
    }
}

/// Hands triggers to an in-process runner over a channel.
pub struct ChannelTrigger {
    tx: mpsc::UnboundedSender<(Phase, PhaseTriggerRequest)>,
}

impl ChannelTrigger {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Phase, PhaseTriggerRequest)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PhaseTrigger for ChannelTrigger {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn trigger(&self, phase: Phase, request: PhaseTriggerRequest) -> Result<()> {
        self.tx
            .send((phase, request))
            .map_err(|_| PipelineError::Trigger("phase runner has stopped".to_string()))
    }
}

/// Only logs the trigger. Used by one-shot CLI runs.
pub struct LoggingTrigger;

#[async_trait]
impl PhaseTrigger for LoggingTrigger {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn trigger(&self, phase: Phase, request: PhaseTriggerRequest) -> Result<()> {
        info!(
            "Next phase {} for issue {} (attempt {:?}) not dispatched",
            phase, request.issue_id, request.attempt
        );
        Ok(())
    }
}

/// Keeps every trigger for inspection.
#[derive(Default)]
pub struct RecordingTrigger {
    sent: Mutex<Vec<(Phase, PhaseTriggerRequest)>>,
}

impl RecordingTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Phase, PhaseTriggerRequest)> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PhaseTrigger for RecordingTrigger {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn trigger(&self, phase: Phase, request: PhaseTriggerRequest) -> Result<()> {
        debug!("Recorded trigger {} for issue {}", phase, request.issue_id);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((phase, request));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> PhaseTriggerRequest {
        PhaseTriggerRequest {
            issue_id: Uuid::new_v4(),
            publication_id: "daily".to_string(),
            attempt: Some(1),
        }
    }

    #[tokio::test]
    async fn posts_to_phase_endpoint() {
        let server = MockServer::start().await;
        let request = request();
        Mock::given(method("POST"))
            .and(path("/phases/generate"))
            .and(body_partial_json(serde_json::json!({ "publication_id": "daily" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(PhaseTriggerResponse {
                success: true,
                message: "started".to_string(),
                next_phase: None,
                counts: Default::default(),
            }))
            .expect(1)
            .mount(&server)
            .await;

        let trigger = HttpPhaseTrigger::new(&server.uri(), &TriggerConfig::default()).unwrap();
        let response = trigger.send(Phase::Generate, &request).await.unwrap();
        assert!(response.success);
    }

    #[tokio::test]
    async fn non_success_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;

        let trigger = HttpPhaseTrigger::new(&server.uri(), &TriggerConfig::default()).unwrap();
        let err = trigger.send(Phase::Generate, &request()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Trigger(_)));
    }

    #[tokio::test]
    async fn channel_trigger_delivers_in_order() {
        let (trigger, mut rx) = ChannelTrigger::new();
        let first = request();
        trigger.trigger(Phase::Process, first.clone()).await.unwrap();
        trigger.trigger(Phase::Generate, request()).await.unwrap();

        let (phase, received) = rx.recv().await.unwrap();
        assert_eq!(phase, Phase::Process);
        assert_eq!(received.issue_id, first.issue_id);
        assert_eq!(rx.recv().await.unwrap().0, Phase::Generate);

        drop(rx);
        assert!(trigger.trigger(Phase::Process, request()).await.is_err());
    }
}
