//! Request dispatch with ordered fallback
//!
//! A dispatch runs an explicit [`FallbackPlan`]: the requested
//! `(model, route, stream)` first, then the same without streaming, then
//! without the route, then every fallback model. Each attempt resolves to a
//! tagged [`AttemptOutcome`]; the first success ends the chain. Callers only
//! ever see a [`CompletionResult`].

use crate::auth::Credential;
use crate::error::{AttemptError, ChatError};
use crate::message::{ImageReference, Transcript, WireMessage};
use crate::provider::{ApiRoute, RawResponse, Transport};
use crate::stream::decode_stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Whether the routing hint survives the first failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePolicy {
    /// Clear the route from the third attempt on
    #[default]
    DropAfterFirstFailure,
    /// Keep the route on every attempt
    Persist,
}

/// One `(model, route, stream)` configuration to try
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub model: String,
    pub route: Option<String>,
    pub stream: bool,
}

impl PlanStep {
    pub fn new(model: impl Into<String>, route: Option<&str>, stream: bool) -> Self {
        Self {
            model: model.into(),
            route: route.map(String::from),
            stream,
        }
    }
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "model={} route={} stream={}",
            self.model,
            self.route.as_deref().unwrap_or("-"),
            self.stream
        )
    }
}

/// Ordered attempts for one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackPlan {
    steps: Vec<PlanStep>,
}

impl FallbackPlan {
    /// Build the attempt order. Steps equal to an earlier step are skipped.
    pub fn build(
        model: &str,
        route: Option<&str>,
        stream: bool,
        fallback_models: &[String],
        policy: RoutePolicy,
    ) -> Self {
        let late_route = match policy {
            RoutePolicy::DropAfterFirstFailure => None,
            RoutePolicy::Persist => route,
        };

        let mut plan = Self { steps: Vec::new() };
        plan.push(PlanStep::new(model, route, stream));
        plan.push(PlanStep::new(model, route, false));
        plan.push(PlanStep::new(model, late_route, false));
        for fallback in fallback_models.iter().filter(|m| m.as_str() != model) {
            plan.push(PlanStep::new(fallback.as_str(), late_route, false));
        }
        plan
    }

    /// A plan with exactly one step
    pub fn single(step: PlanStep) -> Self {
        Self { steps: vec![step] }
    }

    fn push(&mut self, step: PlanStep) {
        if !self.steps.contains(&step) {
            self.steps.push(step);
        }
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Chat completion request body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn for_step(step: &PlanStep, messages: Vec<WireMessage>) -> Self {
        Self {
            model: step.model.clone(),
            messages,
            stream: step.stream,
            route: step.route.clone(),
            max_tokens: None,
        }
    }
}

/// Image generation request body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    pub size: String,
    pub n: u32,
}

impl ImageRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            size: "1024x1024".to_string(),
            n: 1,
        }
    }
}

/// Successful payload of an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Image(ImageReference),
}

/// Final outcome of a dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionResult {
    Text(String),
    Image(ImageReference),
    Failure(ChatError),
}

impl CompletionResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, CompletionResult::Failure(_))
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            CompletionResult::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<Reply> for CompletionResult {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Text(text) => CompletionResult::Text(text),
            Reply::Image(image) => CompletionResult::Image(image),
        }
    }
}

/// Tagged result of a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success(Reply),
    HttpError { status: u16, body: String },
    TransportError(String),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success(_))
    }

    /// The error behind a failed attempt
    pub fn error(&self) -> Option<AttemptError> {
        match self {
            AttemptOutcome::Success(_) => None,
            AttemptOutcome::HttpError { status, body } => Some(AttemptError::Http {
                status: *status,
                body: body.clone(),
            }),
            AttemptOutcome::TransportError(cause) => Some(AttemptError::Transport(cause.clone())),
        }
    }
}

impl From<AttemptError> for AttemptOutcome {
    fn from(e: AttemptError) -> Self {
        match e {
            AttemptError::Http { status, body } => AttemptOutcome::HttpError { status, body },
            AttemptError::Transport(cause) => AttemptOutcome::TransportError(cause),
        }
    }
}

/// What the observer sees for each attempt
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// Zero-based position in the plan
    pub index: usize,
    pub step: PlanStep,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

/// Diagnostics hook, called once per attempt in order
pub trait AttemptObserver: Send + Sync {
    fn on_attempt(&self, record: &AttemptRecord);
}

impl<F> AttemptObserver for F
where
    F: Fn(&AttemptRecord) + Send + Sync,
{
    fn on_attempt(&self, record: &AttemptRecord) {
        self(record)
    }
}

/// Inputs of one chat dispatch
#[derive(Debug, Clone)]
pub struct DispatchRequest<'a> {
    pub transcript: &'a Transcript,
    pub model: &'a str,
    pub stream: bool,
    pub route: Option<&'a str>,
    pub credential: Option<&'a Credential>,
    /// Receives the accumulated text after every streamed delta
    pub partials: Option<mpsc::UnboundedSender<String>>,
    pub cancellation: Option<CancellationToken>,
}

impl<'a> DispatchRequest<'a> {
    pub fn new(transcript: &'a Transcript, model: &'a str) -> Self {
        Self {
            transcript,
            model,
            stream: false,
            route: None,
            credential: None,
            partials: None,
            cancellation: None,
        }
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn route(mut self, route: Option<&'a str>) -> Self {
        self.route = route;
        self
    }

    pub fn credential(mut self, credential: Option<&'a Credential>) -> Self {
        self.credential = credential;
        self
    }

    pub fn partials(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.partials = Some(tx);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

enum Job<'a> {
    Chat {
        messages: Vec<WireMessage>,
        max_tokens: Option<u32>,
        partials: Option<&'a mpsc::UnboundedSender<String>>,
    },
    Image {
        prompt: &'a str,
    },
}

/// Stateless across calls; holds only the transport and the fallback policy
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    fallback_models: Vec<String>,
    image_fallback_models: Vec<String>,
    route_policy: RoutePolicy,
    probe_model: String,
    observer: Option<Arc<dyn AttemptObserver>>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            fallback_models: Vec::new(),
            image_fallback_models: Vec::new(),
            route_policy: RoutePolicy::default(),
            probe_model: "openai/gpt-3.5-turbo".to_string(),
            observer: None,
        }
    }

    pub fn with_fallback_models(mut self, models: Vec<String>) -> Self {
        self.fallback_models = models;
        self
    }

    pub fn with_image_fallback_models(mut self, models: Vec<String>) -> Self {
        self.image_fallback_models = models;
        self
    }

    pub fn with_route_policy(mut self, policy: RoutePolicy) -> Self {
        self.route_policy = policy;
        self
    }

    pub fn with_probe_model(mut self, model: impl Into<String>) -> Self {
        self.probe_model = model.into();
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn AttemptObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Attempt order for a chat dispatch
    pub fn plan(&self, model: &str, route: Option<&str>, stream: bool) -> FallbackPlan {
        FallbackPlan::build(model, route, stream, &self.fallback_models, self.route_policy)
    }

    /// Run a chat completion through the fallback chain
    pub async fn dispatch(&self, request: DispatchRequest<'_>) -> CompletionResult {
        let Some(credential) = request.credential else {
            tracing::warn!(target: "llm", "Dispatch refused: no API key configured");
            return CompletionResult::Failure(ChatError::AuthMissing);
        };
        if request.transcript.is_empty() {
            return CompletionResult::Failure(ChatError::EmptyTranscript);
        }

        let plan = self.plan(request.model, request.route, request.stream);
        let job = Job::Chat {
            messages: request.transcript.to_request_messages(),
            max_tokens: None,
            partials: request.partials.as_ref(),
        };
        self.run(plan, job, credential, request.cancellation.as_ref())
            .await
    }

    /// Generate an image; non-streaming, no route
    pub async fn generate_image(
        &self,
        prompt: &str,
        model: &str,
        credential: Option<&Credential>,
    ) -> CompletionResult {
        let Some(credential) = credential else {
            return CompletionResult::Failure(ChatError::AuthMissing);
        };

        let plan = FallbackPlan::build(
            model,
            None,
            false,
            &self.image_fallback_models,
            self.route_policy,
        );
        self.run(plan, Job::Image { prompt }, credential, None).await
    }

    /// Minimal request against the probe model to check connectivity
    pub async fn ping(&self, credential: Option<&Credential>) -> Result<(), ChatError> {
        let Some(credential) = credential else {
            return Err(ChatError::AuthMissing);
        };

        let plan = FallbackPlan::single(PlanStep::new(self.probe_model.as_str(), None, false));
        let job = Job::Chat {
            messages: vec![WireMessage {
                role: crate::message::Role::User,
                content: "Hello".to_string(),
            }],
            max_tokens: Some(5),
            partials: None,
        };
        match self.run(plan, job, credential, None).await {
            CompletionResult::Failure(e) => Err(e),
            _ => Ok(()),
        }
    }

    async fn run(
        &self,
        plan: FallbackPlan,
        job: Job<'_>,
        credential: &Credential,
        cancellation: Option<&CancellationToken>,
    ) -> CompletionResult {
        let attempts = plan.len();
        let mut last_error = None;

        for (index, step) in plan.steps.into_iter().enumerate() {
            let start = Instant::now();
            let attempt = self.attempt(&step, &job, credential);

            let outcome = match cancellation {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        tracing::info!(target: "llm", attempt = index, "Dispatch cancelled");
                        return CompletionResult::Failure(ChatError::Cancelled);
                    }
                    outcome = attempt => outcome,
                },
                None => attempt.await,
            };

            let record = AttemptRecord {
                index,
                step,
                outcome,
                elapsed: start.elapsed(),
            };
            log_attempt(&record, attempts);
            if let Some(observer) = &self.observer {
                observer.on_attempt(&record);
            }

            match record.outcome {
                AttemptOutcome::Success(reply) => return reply.into(),
                failed => last_error = failed.error(),
            }
        }

        CompletionResult::Failure(ChatError::AllAttemptsFailed {
            attempts,
            last: last_error
                .unwrap_or_else(|| AttemptError::Transport("no attempts were made".to_string())),
        })
    }

    async fn attempt(&self, step: &PlanStep, job: &Job<'_>, credential: &Credential) -> AttemptOutcome {
        let (route, body) = match job {
            Job::Chat {
                messages,
                max_tokens,
                ..
            } => {
                let mut request = CompletionRequest::for_step(step, messages.clone());
                request.max_tokens = *max_tokens;
                (ApiRoute::ChatCompletions, serde_json::to_value(&request))
            }
            Job::Image { prompt } => {
                let request = ImageRequest::new(step.model.as_str(), *prompt);
                (ApiRoute::ImageGenerations, serde_json::to_value(&request))
            }
        };
        let body = match body {
            Ok(body) => body,
            Err(e) => return AttemptOutcome::TransportError(format!("Failed to build request: {}", e)),
        };

        let response = match self.transport.post(route, &body, credential).await {
            Ok(response) => response,
            Err(e) => return e.into(),
        };

        if !response.is_success() {
            let status = response.status;
            let body = response.text().await.unwrap_or_default();
            return AttemptOutcome::HttpError { status, body };
        }

        match job {
            Job::Chat { partials, .. } if step.stream => read_stream(response, *partials).await,
            Job::Chat { .. } => match read_json(response).await {
                Ok(json) => extract(&json, "/choices/0/message/content")
                    .map(|text| Reply::Text(text.to_string()))
                    .into(),
                Err(e) => e.into(),
            },
            Job::Image { .. } => match read_json(response).await {
                Ok(json) => extract(&json, "/data/0/url")
                    .map(|url| Reply::Image(ImageReference(url.to_string())))
                    .into(),
                Err(e) => e.into(),
            },
        }
    }
}

impl From<Result<Reply, AttemptError>> for AttemptOutcome {
    fn from(result: Result<Reply, AttemptError>) -> Self {
        match result {
            Ok(reply) => AttemptOutcome::Success(reply),
            Err(e) => e.into(),
        }
    }
}

async fn read_stream(
    response: RawResponse,
    partials: Option<&mpsc::UnboundedSender<String>>,
) -> AttemptOutcome {
    let decoded = decode_stream(response.body, |snapshot| {
        if let Some(tx) = partials {
            let _ = tx.send(snapshot.to_string());
        }
    })
    .await;

    if !decoded.text.is_empty() {
        return AttemptOutcome::Success(Reply::Text(decoded.text));
    }

    // Nothing to show: treat like any other transport failure
    match (decoded.upstream_error, decoded.error, decoded.last_malformed) {
        (Some(message), _, _) => {
            AttemptOutcome::TransportError(format!("Upstream error in stream: {}", message))
        }
        (None, Some(e), _) => e.into(),
        (None, None, Some(line)) => {
            AttemptOutcome::TransportError(ChatError::DecodeMalformed(line).to_string())
        }
        (None, None, None) => AttemptOutcome::TransportError("Stream ended without content".to_string()),
    }
}

async fn read_json(response: RawResponse) -> Result<serde_json::Value, AttemptError> {
    let text = response.text().await?;
    serde_json::from_str(&text)
        .map_err(|e| AttemptError::Transport(format!("Failed to parse response: {} (raw: {})", e, text)))
}

/// String at `pointer`, or a transport error quoting the upstream error if any
fn extract<'a>(json: &'a serde_json::Value, pointer: &str) -> Result<&'a str, AttemptError> {
    if let Some(value) = json.pointer(pointer).and_then(|v| v.as_str()) {
        return Ok(value);
    }
    let detail = json
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(|m| format!(": {}", m))
        .unwrap_or_default();
    Err(AttemptError::Transport(format!(
        "No content at {} in response{}",
        pointer, detail
    )))
}

fn log_attempt(record: &AttemptRecord, attempts: usize) {
    let elapsed_ms = record.elapsed.as_millis() as u64;
    match &record.outcome {
        AttemptOutcome::Success(_) => tracing::info!(
            target: "llm",
            attempt = record.index + 1,
            of = attempts,
            model = %record.step.model,
            route = ?record.step.route,
            stream = record.step.stream,
            elapsed_ms,
            "Completion attempt succeeded"
        ),
        AttemptOutcome::HttpError { status, body } => tracing::warn!(
            target: "llm",
            attempt = record.index + 1,
            of = attempts,
            model = %record.step.model,
            route = ?record.step.route,
            stream = record.step.stream,
            status = *status,
            error = %body,
            elapsed_ms,
            "Completion attempt returned error"
        ),
        AttemptOutcome::TransportError(cause) => tracing::warn!(
            target: "llm",
            attempt = record.index + 1,
            of = attempts,
            model = %record.step.model,
            route = ?record.step.route,
            stream = record.step.stream,
            error = %cause,
            elapsed_ms,
            "Completion attempt failed"
        ),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport replaying scripted responses and recording every body
    #[derive(Default)]
    pub struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<RawResponse, AttemptError>>>,
        pub requests: Mutex<Vec<(ApiRoute, serde_json::Value)>>,
    }

    impl ScriptedTransport {
        pub fn new(responses: Vec<Result<RawResponse, AttemptError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn bodies(&self) -> Vec<serde_json::Value> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|(_, body)| body.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn post(
            &self,
            route: ApiRoute,
            body: &serde_json::Value,
            _credential: &Credential,
        ) -> Result<RawResponse, AttemptError> {
            self.requests.lock().unwrap().push((route, body.clone()));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AttemptError::transport("no scripted response")))
        }
    }

    pub fn ok_text(content: &str) -> Result<RawResponse, AttemptError> {
        let body = serde_json::json!({"choices": [{"message": {"role": "assistant", "content": content}}]});
        Ok(RawResponse::from_text(200, body.to_string()))
    }

    pub fn status(code: u16, body: &str) -> Result<RawResponse, AttemptError> {
        Ok(RawResponse::from_text(code, body))
    }

    pub fn sse(fragments: &[&str], done: bool) -> Result<RawResponse, AttemptError> {
        let mut body = String::new();
        for fragment in fragments {
            let chunk = serde_json::json!({"choices": [{"delta": {"content": fragment}}]});
            body.push_str(&format!("data: {}\n\n", chunk));
        }
        if done {
            body.push_str("data: [DONE]\n\n");
        }
        Ok(RawResponse::from_text(200, body))
    }

    /// Observer collecting `(index, step, success)` triples
    pub fn recorder() -> (Arc<dyn AttemptObserver>, Arc<Mutex<Vec<(usize, PlanStep, bool)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer = move |record: &AttemptRecord| {
            sink.lock()
                .unwrap()
                .push((record.index, record.step.clone(), record.outcome.is_success()));
        };
        (Arc::new(observer), seen)
    }
}
