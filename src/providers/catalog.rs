//! Static model catalog served by `/available-models`.

use super::ProviderKind;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

const OPENAI_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "gpt-4o",
        name: "GPT-4o",
        description: "Flagship multimodal model",
    },
    ModelInfo {
        id: "gpt-4o-mini",
        name: "GPT-4o mini",
        description: "Small, fast and affordable",
    },
    ModelInfo {
        id: "gpt-4-turbo",
        name: "GPT-4 Turbo",
        description: "High-capability model with a large context window",
    },
    ModelInfo {
        id: "gpt-3.5-turbo",
        name: "GPT-3.5 Turbo",
        description: "Fast model for simple tasks",
    },
];

const ANTHROPIC_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "claude-3-5-sonnet-latest",
        name: "Claude 3.5 Sonnet",
        description: "Balanced intelligence and speed",
    },
    ModelInfo {
        id: "claude-3-5-haiku-latest",
        name: "Claude 3.5 Haiku",
        description: "Fastest Claude model",
    },
    ModelInfo {
        id: "claude-3-opus-latest",
        name: "Claude 3 Opus",
        description: "Most capable for complex tasks",
    },
];

const GEMINI_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "gemini-1.5-pro",
        name: "Gemini 1.5 Pro",
        description: "Long-context reasoning model",
    },
    ModelInfo {
        id: "gemini-1.5-flash",
        name: "Gemini 1.5 Flash",
        description: "Fast and versatile",
    },
    ModelInfo {
        id: "gemini-2.0-flash",
        name: "Gemini 2.0 Flash",
        description: "Next-generation fast model",
    },
];

pub fn models_for(kind: ProviderKind) -> &'static [ModelInfo] {
    match kind {
        ProviderKind::OpenAi => OPENAI_MODELS,
        ProviderKind::Anthropic => ANTHROPIC_MODELS,
        ProviderKind::Gemini => GEMINI_MODELS,
    }
}
