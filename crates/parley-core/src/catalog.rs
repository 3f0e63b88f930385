//! Fixed registries: the model price table and the personality presets.

use crate::error::SessionError;
use crate::types::TokenUsage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Prices expressed in currency units per 1000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub prompt: f64,
    pub completion: f64,
}

/// Derived monetary cost. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Cost {
    pub prompt: f64,
    pub completion: f64,
}

impl Cost {
    pub fn total(self) -> f64 {
        self.prompt + self.completion
    }
}

impl std::ops::AddAssign for Cost {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt += rhs.prompt;
        self.completion += rhs.completion;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub context_window: u32,
    pub pricing: Pricing,
    /// Only the privileged user may select restricted models.
    #[serde(default)]
    pub restricted: bool,
}

impl ModelSpec {
    pub fn new(name: &str, context_window: u32, prompt: f64, completion: f64, restricted: bool) -> Self {
        Self {
            name: name.to_owned(),
            context_window,
            pricing: Pricing { prompt, completion },
            restricted,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn cost(&self, usage: TokenUsage) -> Cost {
        Cost {
            prompt: usage.prompt_tokens as f64 * self.pricing.prompt / 1000.0,
            completion: usage.completion_tokens as f64 * self.pricing.completion / 1000.0,
        }
    }
}

/// The price table. Costs are always recomputed from it, so correcting a
/// price here changes the reported cost of all historical usage.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCatalog {
    models: Vec<ModelSpec>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(vec![
            ModelSpec::new("gpt-3.5-turbo", 16_385, 0.001, 0.002, false),
            ModelSpec::new("gpt-4-1106-preview", 128_000, 0.01, 0.03, true),
            ModelSpec::new("gpt-4-1106-vision-preview", 128_000, 0.01, 0.03, true),
            ModelSpec::new("gpt-4", 8_192, 0.03, 0.06, true),
        ])
    }
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelSpec>) -> Self {
        Self { models }
    }

    pub fn models(&self) -> &[ModelSpec] {
        &self.models
    }

    pub fn lookup(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Models the user may pick, in catalog order.
    pub fn available(&self, privileged: bool) -> impl Iterator<Item = &ModelSpec> {
        self.models
            .iter()
            .filter(move |m| privileged || !m.restricted)
    }

    /// Resolve a model by name for a user. Restricted models are reported as
    /// unknown to non-privileged users.
    pub fn resolve(&self, name: &str, privileged: bool) -> Result<&ModelSpec, SessionError> {
        self.available(privileged)
            .find(|m| m.name == name)
            .ok_or_else(|| SessionError::UnknownModel(name.to_owned()))
    }

    /// Cost of `usage` on `model`. Models missing from the table cost nothing.
    pub fn cost(&self, model: &str, usage: TokenUsage) -> Cost {
        self.lookup(model).map(|m| m.cost(usage)).unwrap_or_default()
    }

    /// Replace the pricing of a model. Returns false if the model is unknown.
    pub fn set_pricing(&mut self, model: &str, pricing: Pricing) -> bool {
        match self.models.iter_mut().find(|m| m.name == model) {
            Some(spec) => {
                spec.pricing = pricing;
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Personalities
// ---------------------------------------------------------------------------

/// Appended to every personality preset.
pub const COMMON_PROMPT: &str = "Stay in the character you are impersonating for the whole conversation. \
Always answer in the language you are addressed in. Adapt to the context and keep answers useful. \
You are talking through a chat app that renders markdown: use bold, italics and code blocks where they help.";

/// System prompt for `/summarize`.
pub const SYNTHESIZER_PROMPT: &str = "Read the messages of the conversation below, pick out the key points \
and write a short, insightful summary in the language of the conversation, keeping its tone and depth.";

/// System prompt for the one-off title request after the first exchange.
pub const TITLE_PROMPT: &str = "Write a catchy title for the conversation below. \
Be brief and creative; use at most 50 letters and reply with the title only.";

/// A system-prompt preset chosen once per conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Personality {
    Programmer,
    Translator,
    Jackass,
    Neutral,
    Philosopher,
}

impl Personality {
    pub const ALL: [Personality; 5] = [
        Personality::Programmer,
        Personality::Translator,
        Personality::Jackass,
        Personality::Neutral,
        Personality::Philosopher,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Personality::Programmer => "Programmer",
            Personality::Translator => "Translator",
            Personality::Jackass => "Jackass",
            Personality::Neutral => "Neutral",
            Personality::Philosopher => "Philosopher",
        }
    }

    fn preset(self) -> &'static str {
        match self {
            Personality::Programmer => {
                "You are a seasoned programmer fluent in many languages and frameworks. \
You debug, optimize and design efficient algorithms, break problems into small steps, \
and favour clean, maintainable and well documented code."
            }
            Personality::Translator => {
                "You are a multilingual translator. Go beyond literal text and capture intent. \
For a direct request, translate the given text; for a described situation, infer the right phrase \
and translate it. Use the target language if stated, otherwise infer it. Show the source text, \
the translation in native script and a phonetic transcription in monospace, and add short notes \
on context when useful. You also discuss languages, cultures and linguistics."
            }
            Personality::Jackass => {
                "You are the loudest prankster in the room: irreverent, crude and gleefully chaotic, \
always chasing the next outrageous laugh and never afraid to poke at the status quo."
            }
            Personality::Neutral => "You are a helpful assistant.",
            Personality::Philosopher => {
                "You are a wise assistant channelling the great philosophers, from Socrates and Plato \
to Kant, Nietzsche and Camus. Apply their ideas to modern questions, favour Socratic answers, \
respect other viewpoints and balance depth with clarity."
            }
        }
    }

    /// Full system message text for this personality.
    pub fn system_prompt(self) -> String {
        format!("{}\n{COMMON_PROMPT}", self.preset())
    }
}

impl fmt::Display for Personality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Personality {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Personality::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| SessionError::UnknownPersonality(s.to_owned()))
    }
}
