//! Generative helpers: caption enhancement and step guides.
//!
//! Both pass the input through when no generator is configured or the
//! generator fails.

use std::sync::Arc;

use tracing::{debug, warn};

use pulse_client::TextGenerator;

const CAPTION_PROMPT: &str = "Rewrite this social media caption to be more engaging. \
Keep the meaning, keep it under 200 characters, and reply with the caption only.\n\nCaption: ";

const GUIDE_PROMPT: &str = "Write a short step-by-step guide. \
Reply with one step per line and nothing else.\n\nTopic: ";

#[derive(Clone, Default)]
pub struct Assistant {
    text: Option<Arc<dyn TextGenerator>>,
}

impl Assistant {
    pub fn new(text: Option<Arc<dyn TextGenerator>>) -> Self {
        Self { text }
    }

    pub fn is_configured(&self) -> bool {
        self.text.is_some()
    }

    pub async fn enhance_caption(&self, caption: &str) -> String {
        if caption.trim().is_empty() {
            return caption.to_string();
        }
        let Some(text) = &self.text else {
            return caption.to_string();
        };
        match text.generate(&format!("{}{}", CAPTION_PROMPT, caption)).await {
            Ok(out) => {
                let out = out.trim().trim_matches('"').trim();
                if out.is_empty() {
                    caption.to_string()
                } else {
                    debug!(len = out.len(), "caption enhanced");
                    out.to_string()
                }
            }
            Err(e) => {
                warn!(error = %e, "caption enhancement failed");
                caption.to_string()
            }
        }
    }

    /// Steps for `topic`. Without a generator the topic itself is the
    /// only step.
    pub async fn step_guide(&self, topic: &str) -> Vec<String> {
        let fallback = || vec![topic.trim().to_string()];
        let Some(text) = &self.text else {
            return fallback();
        };
        match text.generate(&format!("{}{}", GUIDE_PROMPT, topic)).await {
            Ok(out) => {
                let steps = parse_steps(&out);
                if steps.is_empty() {
                    fallback()
                } else {
                    steps
                }
            }
            Err(e) => {
                warn!(error = %e, "step guide generation failed");
                fallback()
            }
        }
    }
}

/// One step per non-empty line, list markers removed.
fn parse_steps(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| {
            let line = line.trim();
            let line = line.trim_start_matches(['-', '*', '•']).trim_start();
            let digits = line.chars().take_while(char::is_ascii_digit).count();
            let rest = &line[digits..];
            if digits > 0 && (rest.starts_with('.') || rest.starts_with(')')) {
                rest[1..].trim().to_string()
            } else {
                line.to_string()
            }
        })
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{ClientError, Result};

    struct Fixed(Result<String>);

    #[async_trait::async_trait]
    impl TextGenerator for Fixed {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            self.0.clone()
        }
    }

    fn with(out: Result<String>) -> Assistant {
        Assistant::new(Some(Arc::new(Fixed(out))))
    }

    #[tokio::test]
    async fn unconfigured_passes_through() {
        let a = Assistant::default();
        assert!(!a.is_configured());
        assert_eq!(a.enhance_caption("sunset").await, "sunset");
        assert_eq!(a.step_guide("bake bread").await, vec!["bake bread"]);
    }

    #[tokio::test]
    async fn failure_passes_through() {
        let a = with(Err(ClientError::Network("timeout".into())));
        assert_eq!(a.enhance_caption("sunset").await, "sunset");
        assert_eq!(a.step_guide("bake bread").await, vec!["bake bread"]);
    }

    #[tokio::test]
    async fn generated_caption_is_trimmed() {
        let a = with(Ok("  \"Golden hour magic\" \n".into()));
        assert_eq!(a.enhance_caption("sunset").await, "Golden hour magic");
    }

    #[tokio::test]
    async fn empty_caption_is_not_sent() {
        let a = with(Ok("something".into()));
        assert_eq!(a.enhance_caption("  ").await, "  ");
    }

    #[test]
    fn steps_strip_list_markers() {
        let steps = parse_steps("1. Mix flour\n2) Knead\n\n- Rest an hour\n* Bake");
        assert_eq!(steps, vec!["Mix flour", "Knead", "Rest an hour", "Bake"]);
    }
}
