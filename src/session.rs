//! Per-session chat context
//!
//! Owns the transcript and the current selections (mode, model). Appends the
//! user turn before dispatch and the assistant turn once the result resolves;
//! on failure the rendered error text is recorded so the transcript stays
//! consistent.

use crate::auth::Credential;
use crate::config::LlmConfig;
use crate::dispatch::{CompletionResult, DispatchRequest, Dispatcher};
use crate::message::{Message, Transcript};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a turn produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatMode {
    #[default]
    Text,
    Image,
}

impl std::str::FromStr for ChatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(ChatMode::Text),
            "image" | "img" => Ok(ChatMode::Image),
            other => Err(format!("Unknown mode '{}' (expected text or image)", other)),
        }
    }
}

/// Result of one turn: the recorded assistant message and the raw result
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: Message,
    pub result: CompletionResult,
}

pub struct ChatSession {
    dispatcher: Dispatcher,
    credential: Option<Credential>,
    transcript: Transcript,
    system_prompt: Option<String>,
    mode: ChatMode,
    model: String,
    image_model: String,
    route: Option<String>,
    stream: bool,
}

impl ChatSession {
    pub fn new(dispatcher: Dispatcher, credential: Option<Credential>, llm: &LlmConfig) -> Self {
        let mut session = Self {
            dispatcher,
            credential,
            transcript: Transcript::new(),
            system_prompt: llm.system_prompt.clone(),
            mode: ChatMode::Text,
            model: llm.model.clone(),
            image_model: llm.image_model.clone(),
            route: llm.route.clone(),
            stream: llm.stream,
        };
        session.seed();
        session
    }

    fn seed(&mut self) {
        if let Some(prompt) = &self.system_prompt {
            self.transcript.push(Message::system(prompt.clone()));
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Forget the conversation (the system prompt is kept)
    pub fn clear(&mut self) {
        self.transcript.clear();
        self.seed();
    }

    pub fn mode(&self) -> ChatMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ChatMode) {
        self.mode = mode;
    }

    /// Model used by the current mode
    pub fn model(&self) -> &str {
        match self.mode {
            ChatMode::Text => &self.model,
            ChatMode::Image => &self.image_model,
        }
    }

    /// Select the model for the current mode
    pub fn set_model(&mut self, model: impl Into<String>) {
        match self.mode {
            ChatMode::Text => self.model = model.into(),
            ChatMode::Image => self.image_model = model.into(),
        }
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Run one user turn in the current mode
    pub async fn send(
        &mut self,
        prompt: &str,
        partials: Option<mpsc::UnboundedSender<String>>,
        cancellation: Option<CancellationToken>,
    ) -> TurnOutcome {
        self.turn(self.mode, prompt, partials, cancellation).await
    }

    /// Run one image turn with the image model, whatever the current mode
    pub async fn generate_image(&mut self, prompt: &str) -> TurnOutcome {
        self.turn(ChatMode::Image, prompt, None, None).await
    }

    async fn turn(
        &mut self,
        mode: ChatMode,
        prompt: &str,
        partials: Option<mpsc::UnboundedSender<String>>,
        cancellation: Option<CancellationToken>,
    ) -> TurnOutcome {
        self.transcript.push_user(prompt);

        let result = match mode {
            ChatMode::Text => {
                let mut request = DispatchRequest::new(&self.transcript, &self.model)
                    .stream(self.stream)
                    .route(self.route.as_deref())
                    .credential(self.credential.as_ref());
                request.partials = partials;
                request.cancellation = cancellation;
                self.dispatcher.dispatch(request).await
            }
            ChatMode::Image => {
                self.dispatcher
                    .generate_image(prompt, &self.image_model, self.credential.as_ref())
                    .await
            }
        };

        let reply = match &result {
            CompletionResult::Text(text) => Message::assistant(text.clone()),
            CompletionResult::Image(image) => Message::assistant(format!(
                "I've generated an image based on your prompt: '{}'",
                prompt
            ))
            .with_attachment(image.clone()),
            CompletionResult::Failure(e) if mode == ChatMode::Image => {
                tracing::warn!(error = %e, "Image generation failed");
                Message::assistant(
                    "Failed to generate an image. Please try again or use a different prompt.",
                )
            }
            CompletionResult::Failure(e) => Message::assistant(e.user_message()),
        };

        self.transcript.push(reply.clone());
        TurnOutcome { reply, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::*;
    use crate::error::ChatError;
    use crate::message::{ImageReference, Role};
    use crate::provider::RawResponse;

    fn session_with(
        responses: Vec<Result<RawResponse, crate::error::AttemptError>>,
        credential: Option<Credential>,
        llm: LlmConfig,
    ) -> ChatSession {
        let transport = ScriptedTransport::new(responses);
        let dispatcher = Dispatcher::new(transport).with_fallback_models(llm.fallback_models.clone());
        ChatSession::new(dispatcher, credential, &llm)
    }

    fn llm() -> LlmConfig {
        LlmConfig {
            model: "m1".into(),
            fallback_models: vec!["m2".into()],
            stream: false,
            system_prompt: None,
            ..LlmConfig::default()
        }
    }

    #[tokio::test]
    async fn test_turn_appends_user_and_assistant() {
        let mut session = session_with(
            vec![status(500, "down"), ok_text("Hello!")],
            Credential::new("sk"),
            llm(),
        );

        let outcome = session.send("Hi", None, None).await;

        assert_eq!(outcome.result, CompletionResult::Text("Hello!".into()));
        let messages = session.transcript().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], Message::user("Hi"));
        assert_eq!(messages[1], Message::assistant("Hello!"));
    }

    #[tokio::test]
    async fn test_failure_recorded_as_assistant_text() {
        let mut session = session_with(vec![], None, llm());

        let outcome = session.send("Hi", None, None).await;

        assert_eq!(outcome.result, CompletionResult::Failure(ChatError::AuthMissing));
        let last = session.transcript().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, ChatError::AuthMissing.user_message());
    }

    #[tokio::test]
    async fn test_image_turn_attaches_url() {
        let body = serde_json::json!({"data": [{"url": "https://img.example/fox.png"}]});
        let mut session = session_with(
            vec![Ok(RawResponse::from_text(200, body.to_string()))],
            Credential::new("sk"),
            llm(),
        );
        session.set_mode(ChatMode::Image);

        let outcome = session.send("a fox", None, None).await;

        assert_eq!(
            outcome.reply.attachment,
            Some(ImageReference("https://img.example/fox.png".into()))
        );
        assert!(outcome.reply.content.contains("a fox"));
    }

    #[tokio::test]
    async fn test_generate_image_keeps_text_mode() {
        let mut session = session_with(vec![status(500, "down")], Credential::new("sk"), llm());

        let outcome = session.generate_image("a fox").await;

        assert!(outcome.result.is_failure());
        assert_eq!(session.mode(), ChatMode::Text);
        assert!(outcome.reply.content.starts_with("Failed to generate an image"));
        assert_eq!(session.transcript().len(), 2);
    }

    #[tokio::test]
    async fn test_clear_keeps_system_prompt() {
        let mut config = llm();
        config.system_prompt = Some("Be brief.".into());
        let mut session = session_with(vec![ok_text("ok")], Credential::new("sk"), config);

        session.send("Hi", None, None).await;
        assert_eq!(session.transcript().len(), 3);

        session.clear();
        assert_eq!(session.transcript().messages(), &[Message::system("Be brief.")]);
    }

    #[test]
    fn test_mode_switch_selects_model() {
        let mut session = session_with(vec![], None, llm());
        assert_eq!(session.model(), "m1");

        session.set_mode("image".parse().unwrap());
        assert_eq!(session.model(), LlmConfig::default().image_model);
        session.set_model("stability/sdxl");
        assert_eq!(session.model(), "stability/sdxl");

        session.set_mode(ChatMode::Text);
        assert_eq!(session.model(), "m1");
        assert!("video".parse::<ChatMode>().is_err());
    }
}
