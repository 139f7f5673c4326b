//! Telemetry and logging infrastructure
//!
//! - Console logging (human-readable, verbose mode only)
//! - JSON file logging (daily rolling, for analysis)
//! - OpenTelemetry export (optional)
//! - Per-session attempt counters fed by the dispatcher's observer hook

use crate::dispatch::{AttemptObserver, AttemptOutcome, AttemptRecord};
use chrono::{DateTime, Utc};
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Session state for telemetry
#[derive(Debug)]
pub struct TelemetrySession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub turns: AtomicU64,
    pub attempts: AtomicU64,
    pub failed_attempts: AtomicU64,
}

impl TelemetrySession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            turns: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
        }
    }

    pub fn next_turn(&self) -> u64 {
        self.turns.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for TelemetrySession {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary shown by `/stats`
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub turns: u64,
    pub attempts: u64,
    pub failed_attempts: u64,
}

impl std::fmt::Display for SessionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Session {} | {} turns | {} attempts ({} failed) | since {}",
            &self.session_id.to_string()[..8],
            self.turns,
            self.attempts,
            self.failed_attempts,
            self.started_at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Logs every attempt and counts it against the session
pub struct TelemetryObserver {
    session: Arc<TelemetrySession>,
}

impl AttemptObserver for TelemetryObserver {
    fn on_attempt(&self, record: &AttemptRecord) {
        self.session.attempts.fetch_add(1, Ordering::SeqCst);
        if !record.outcome.is_success() {
            self.session.failed_attempts.fetch_add(1, Ordering::SeqCst);
        }

        let outcome = match &record.outcome {
            AttemptOutcome::Success(_) => "success".to_string(),
            AttemptOutcome::HttpError { status, .. } => format!("http_{}", status),
            AttemptOutcome::TransportError(_) => "transport_error".to_string(),
        };
        tracing::debug!(
            session_id = %self.session.id,
            attempt = record.index,
            request = %record.step,
            outcome = %outcome,
            elapsed_ms = record.elapsed.as_millis() as u64,
            "Attempt recorded"
        );
    }
}

pub struct Telemetry {
    session: Arc<TelemetrySession>,
    log_dir: PathBuf,
    _file_guard: Option<WorkerGuard>,
    _otel_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Initialize logging: JSON file log, console when verbose, OTLP if an
    /// endpoint is given. `RUST_LOG` overrides the default filter.
    pub fn init(
        log_dir: PathBuf,
        verbose: bool,
        otel_endpoint: Option<&str>,
        model: Option<&str>,
        provider: Option<&str>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&log_dir)?;

        let session = Arc::new(TelemetrySession::new());

        // Set up file appender for JSON logs
        let file_appender = tracing_appender::rolling::daily(&log_dir, "chat_relay.log");
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);

        let make_env_filter = || {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if verbose {
                    EnvFilter::new("debug,hyper=info,reqwest=info,h2=info,rustls=info")
                } else {
                    EnvFilter::new("info,hyper=warn,reqwest=warn,h2=warn,rustls=warn")
                }
            })
        };

        let otel_provider = if let Some(endpoint) = otel_endpoint {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_endpoint(endpoint)
                .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
                .build()?;

            let provider = SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_resource(Resource::builder().with_service_name("chat-relay").build())
                .build();

            let tracer = provider.tracer("chat-relay");
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(verbose.then(|| {
                    fmt::layer()
                        .with_target(false)
                        .compact()
                        .with_writer(std::io::stderr)
                }))
                .with(fmt::layer().json().with_writer(non_blocking))
                .with(otel_layer);
            subscriber.try_init().ok();
            Some(provider)
        } else if verbose {
            // Verbose mode: console + file
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().with_target(false).compact().with_writer(std::io::stderr))
                .with(fmt::layer().json().with_writer(non_blocking));
            subscriber.try_init().ok();
            None
        } else {
            // Normal mode: file only (no console noise)
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().json().with_writer(non_blocking));
            subscriber.try_init().ok();
            None
        };

        tracing::info!(
            session_id = %session.id,
            log_dir = %log_dir.display(),
            model = model.unwrap_or("-"),
            provider = provider.unwrap_or("-"),
            otel_enabled = otel_endpoint.is_some(),
            "Telemetry initialized"
        );

        Ok(Self {
            session,
            log_dir,
            _file_guard: Some(file_guard),
            _otel_provider: otel_provider,
        })
    }

    /// Telemetry without any subscriber (for testing)
    pub fn minimal() -> Self {
        Self {
            session: Arc::new(TelemetrySession::new()),
            log_dir: PathBuf::from(".chat_relay"),
            _file_guard: None,
            _otel_provider: None,
        }
    }

    /// Get the current session ID
    pub fn session_id(&self) -> Uuid {
        self.session.id
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Observer to hand to the dispatcher
    pub fn observer(&self) -> Arc<TelemetryObserver> {
        Arc::new(TelemetryObserver {
            session: self.session.clone(),
        })
    }

    /// Log a user turn
    pub fn log_turn(&self, mode: &str, model: &str, prompt: &str) {
        let turn = self.session.next_turn();
        tracing::info!(
            session_id = %self.session.id,
            turn,
            mode,
            model,
            prompt_len = prompt.len(),
            "User turn"
        );
        tracing::debug!(content = prompt, "User turn content");
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session.id,
            started_at: self.session.started_at,
            turns: self.session.turns.load(Ordering::SeqCst),
            attempts: self.session.attempts.load(Ordering::SeqCst),
            failed_attempts: self.session.failed_attempts.load(Ordering::SeqCst),
        }
    }
}
