//! Model identifiers, capability table, and per-request configuration.
//!
//! The engine talks to a closed set of hosted models.  Each model carries
//! three capability flags that the rest of the system consults through the
//! pure [`capabilities`] function:
//!
//! - `native` — the provider honours the server-side `enable_search`,
//!   `search_strategy`, and `enable_code_interpreter` switches for this model.
//! - `supports_thinking` — the model exposes a reasoning channel that can be
//!   toggled with `enable_thinking`.
//! - `requires_multimodal_api` — the model must be invoked through the
//!   multimodal endpoint even for plain text requests.
//!
//! Capability knowledge lives in one static table rather than being spread
//! across the call sites, so adding a model is a single-row change.

use serde::{Deserialize, Serialize};

/// Official model identifiers accepted by the provider endpoint.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelId {
    /// `qwen-turbo` – lowest latency general model.
    QwenTurbo,
    /// `qwen-plus` – balanced cost/quality tier.
    QwenPlus,
    /// `qwen-max` – flagship general model.
    QwenMax,
    /// `qwen-max-longcontext` – flagship with an extended context window.
    QwenMaxLongContext,
    /// `qwen2.5-72b-instruct`
    Qwen2_5_72B,
    /// `qwen2.5-32b-instruct`
    Qwen2_5_32B,
    /// `qwen2.5-14b-instruct`
    Qwen2_5_14B,
    /// `qwen2.5-7b-instruct`
    Qwen2_5_7B,
    /// `qwen3-max` – current default for orchestration workloads.
    Qwen3Max,
    /// `qwen3-max-preview`
    Qwen3MaxPreview,
    /// `qwen-vl-max` – vision-language flagship.
    QwenVlMax,
    /// `qwen-vl-plus` – vision-language mid tier.
    QwenVlPlus,
    /// `qwen2-vl-72b-instruct`
    Qwen2Vl72B,
    /// `qwen-vl-ocr` – document/character recognition tuned VL model.
    QwenVlOcr,
    /// `deepseek-v3` – third-party model hosted on the same platform.
    DeepSeekV3,
    /// `deepseek-v3.2`
    DeepSeekV3_2,
    /// `deepseek-r1` – reasoning model; emits tool calls as plain text.
    DeepSeekR1,
    /// `glm-4-plus`
    Glm4Plus,
    /// `glm-4.5`
    Glm4_5,
    /// `glm-4.7`
    Glm4_7,
    /// `kimi-k2.5` – only reachable through the multimodal endpoint.
    KimiK2_5,
}

impl ModelId {
    /// The wire identifier sent to the provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelId::QwenTurbo => "qwen-turbo",
            ModelId::QwenPlus => "qwen-plus",
            ModelId::QwenMax => "qwen-max",
            ModelId::QwenMaxLongContext => "qwen-max-longcontext",
            ModelId::Qwen2_5_72B => "qwen2.5-72b-instruct",
            ModelId::Qwen2_5_32B => "qwen2.5-32b-instruct",
            ModelId::Qwen2_5_14B => "qwen2.5-14b-instruct",
            ModelId::Qwen2_5_7B => "qwen2.5-7b-instruct",
            ModelId::Qwen3Max => "qwen3-max",
            ModelId::Qwen3MaxPreview => "qwen3-max-preview",
            ModelId::QwenVlMax => "qwen-vl-max",
            ModelId::QwenVlPlus => "qwen-vl-plus",
            ModelId::Qwen2Vl72B => "qwen2-vl-72b-instruct",
            ModelId::QwenVlOcr => "qwen-vl-ocr",
            ModelId::DeepSeekV3 => "deepseek-v3",
            ModelId::DeepSeekV3_2 => "deepseek-v3.2",
            ModelId::DeepSeekR1 => "deepseek-r1",
            ModelId::Glm4Plus => "glm-4-plus",
            ModelId::Glm4_5 => "glm-4.5",
            ModelId::Glm4_7 => "glm-4.7",
            ModelId::KimiK2_5 => "kimi-k2.5",
        }
    }

    /// Resolve a wire identifier back into a [`ModelId`].
    ///
    /// Returns `None` for identifiers outside the supported set; callers
    /// typically fall back to [`ModelId::Qwen3Max`].
    pub fn from_tag(tag: &str) -> Option<ModelId> {
        ALL_MODELS.iter().copied().find(|m| m.as_str() == tag)
    }
}

/// Every supported model, in declaration order.
pub const ALL_MODELS: &[ModelId] = &[
    ModelId::QwenTurbo,
    ModelId::QwenPlus,
    ModelId::QwenMax,
    ModelId::QwenMaxLongContext,
    ModelId::Qwen2_5_72B,
    ModelId::Qwen2_5_32B,
    ModelId::Qwen2_5_14B,
    ModelId::Qwen2_5_7B,
    ModelId::Qwen3Max,
    ModelId::Qwen3MaxPreview,
    ModelId::QwenVlMax,
    ModelId::QwenVlPlus,
    ModelId::Qwen2Vl72B,
    ModelId::QwenVlOcr,
    ModelId::DeepSeekV3,
    ModelId::DeepSeekV3_2,
    ModelId::DeepSeekR1,
    ModelId::Glm4Plus,
    ModelId::Glm4_5,
    ModelId::Glm4_7,
    ModelId::KimiK2_5,
];

/// Per-model capability flags consulted by the worker and the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCaps {
    /// Provider-native search / code-interpreter switches are honoured.
    pub native: bool,
    /// The model exposes a reasoning channel (`enable_thinking`).
    pub supports_thinking: bool,
    /// The model must be called through the multimodal endpoint even for text.
    pub requires_multimodal_api: bool,
}

/// One row per model. Kept sorted in the same order as [`ALL_MODELS`] so
/// table review stays a side-by-side diff.
const CAPABILITY_TABLE: &[(ModelId, ModelCaps)] = &[
    (ModelId::QwenTurbo, ModelCaps { native: true, supports_thinking: false, requires_multimodal_api: false }),
    (ModelId::QwenPlus, ModelCaps { native: true, supports_thinking: false, requires_multimodal_api: false }),
    (ModelId::QwenMax, ModelCaps { native: true, supports_thinking: false, requires_multimodal_api: false }),
    (ModelId::QwenMaxLongContext, ModelCaps { native: true, supports_thinking: false, requires_multimodal_api: false }),
    (ModelId::Qwen2_5_72B, ModelCaps { native: true, supports_thinking: false, requires_multimodal_api: false }),
    (ModelId::Qwen2_5_32B, ModelCaps { native: true, supports_thinking: false, requires_multimodal_api: false }),
    (ModelId::Qwen2_5_14B, ModelCaps { native: true, supports_thinking: false, requires_multimodal_api: false }),
    (ModelId::Qwen2_5_7B, ModelCaps { native: true, supports_thinking: false, requires_multimodal_api: false }),
    (ModelId::Qwen3Max, ModelCaps { native: true, supports_thinking: true, requires_multimodal_api: false }),
    (ModelId::Qwen3MaxPreview, ModelCaps { native: true, supports_thinking: true, requires_multimodal_api: false }),
    (ModelId::QwenVlMax, ModelCaps { native: true, supports_thinking: false, requires_multimodal_api: true }),
    (ModelId::QwenVlPlus, ModelCaps { native: true, supports_thinking: false, requires_multimodal_api: true }),
    (ModelId::Qwen2Vl72B, ModelCaps { native: true, supports_thinking: false, requires_multimodal_api: true }),
    (ModelId::QwenVlOcr, ModelCaps { native: true, supports_thinking: false, requires_multimodal_api: true }),
    (ModelId::DeepSeekV3, ModelCaps { native: false, supports_thinking: true, requires_multimodal_api: false }),
    (ModelId::DeepSeekV3_2, ModelCaps { native: false, supports_thinking: true, requires_multimodal_api: false }),
    (ModelId::DeepSeekR1, ModelCaps { native: false, supports_thinking: true, requires_multimodal_api: false }),
    (ModelId::Glm4Plus, ModelCaps { native: false, supports_thinking: true, requires_multimodal_api: false }),
    (ModelId::Glm4_5, ModelCaps { native: false, supports_thinking: true, requires_multimodal_api: false }),
    (ModelId::Glm4_7, ModelCaps { native: false, supports_thinking: true, requires_multimodal_api: false }),
    (ModelId::KimiK2_5, ModelCaps { native: false, supports_thinking: false, requires_multimodal_api: true }),
];

/// Look up the capability flags for a model.
pub fn capabilities(model: ModelId) -> ModelCaps {
    for (id, caps) in CAPABILITY_TABLE {
        if *id == model {
            return *caps;
        }
    }
    // Unreachable while the table covers ALL_MODELS; conservative fallback.
    ModelCaps {
        native: false,
        supports_thinking: false,
        requires_multimodal_api: false,
    }
}

/// Context window size in tokens for a model.
pub fn context_window(model: ModelId) -> usize {
    match model {
        ModelId::QwenMaxLongContext => 1_000_000,
        ModelId::Qwen3Max | ModelId::Qwen3MaxPreview => 262_144,
        ModelId::DeepSeekV3 | ModelId::DeepSeekV3_2 | ModelId::DeepSeekR1 => 131_072,
        ModelId::Glm4Plus | ModelId::Glm4_5 | ModelId::Glm4_7 => 131_072,
        ModelId::KimiK2_5 => 262_144,
        ModelId::QwenVlMax | ModelId::QwenVlPlus | ModelId::Qwen2Vl72B | ModelId::QwenVlOcr => {
            32_768
        }
        _ => 131_072,
    }
}

/// Per-request model configuration.
///
/// The worker derives one of these for every request from the role's base
/// configuration; see the capability-routing rules documented on
/// [`WorkerAgent`](crate::taskswarm::worker::WorkerAgent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model the request targets.
    pub model: ModelId,
    /// Sampling temperature, clamped to `[0.0, 2.0]`.
    pub temperature: f32,
    /// Nucleus sampling parameter.
    pub top_p: f32,
    /// Optional completion-token cap.
    pub max_tokens: Option<u32>,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
    /// Transparent retry budget for transient failures.
    pub retry_attempts: u32,
    /// Server-side web search switch (native models only).
    pub enable_search: bool,
    /// Optional search strategy (e.g. `"agent_max"` for page extraction).
    pub search_strategy: Option<String>,
    /// Reasoning-channel switch (models with thinking support only).
    pub enable_thinking: bool,
    /// Server-side code interpreter switch (native models only).
    pub enable_code_interpreter: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: ModelId::Qwen3Max,
            temperature: 0.7,
            top_p: 0.8,
            max_tokens: None,
            timeout_secs: 120,
            retry_attempts: 5,
            enable_search: true,
            search_strategy: None,
            enable_thinking: true,
            enable_code_interpreter: false,
        }
    }
}

impl ModelConfig {
    /// Configuration for a specific model with all other fields defaulted.
    pub fn for_model(model: ModelId) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }

    /// Override the sampling temperature (builder pattern). Out-of-range
    /// values are clamped to `[0.0, 2.0]`.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.max(0.0).min(2.0);
        self
    }

    /// Override the per-call timeout (builder pattern).
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Override the completion-token cap (builder pattern).
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Toggle the reasoning channel (builder pattern).
    pub fn with_thinking(mut self, enabled: bool) -> Self {
        self.enable_thinking = enabled;
        self
    }

    /// Toggle server-side search (builder pattern).
    pub fn with_search(mut self, enabled: bool) -> Self {
        self.enable_search = enabled;
        self
    }

    /// Return a copy with every provider-native switch that the model does
    /// not honour silently dropped.
    ///
    /// Non-native models lose `enable_search`, `search_strategy`, and
    /// `enable_code_interpreter`; models without a reasoning channel lose
    /// `enable_thinking`. Callers compensate for the dropped switches through
    /// the sandbox tools.
    pub fn sanitized(&self) -> Self {
        let caps = capabilities(self.model);
        let mut cfg = self.clone();
        if !caps.native {
            cfg.enable_search = false;
            cfg.search_strategy = None;
            cfg.enable_code_interpreter = false;
        }
        if !caps.supports_thinking {
            cfg.enable_thinking = false;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_table_covers_every_model() {
        for model in ALL_MODELS {
            // A missing row would silently hit the conservative fallback;
            // assert the table has an explicit entry instead.
            assert!(
                CAPABILITY_TABLE.iter().any(|(id, _)| id == model),
                "missing capability row for {:?}",
                model
            );
        }
    }

    #[test]
    fn qwen_models_are_native_third_party_are_not() {
        assert!(capabilities(ModelId::Qwen3Max).native);
        assert!(capabilities(ModelId::QwenTurbo).native);
        assert!(!capabilities(ModelId::DeepSeekR1).native);
        assert!(!capabilities(ModelId::Glm4_7).native);
        assert!(!capabilities(ModelId::KimiK2_5).native);
    }

    #[test]
    fn multimodal_api_flag_covers_vision_and_kimi() {
        assert!(capabilities(ModelId::QwenVlMax).requires_multimodal_api);
        assert!(capabilities(ModelId::QwenVlOcr).requires_multimodal_api);
        assert!(capabilities(ModelId::KimiK2_5).requires_multimodal_api);
        assert!(!capabilities(ModelId::Qwen3Max).requires_multimodal_api);
    }

    #[test]
    fn tag_round_trip() {
        for model in ALL_MODELS {
            assert_eq!(ModelId::from_tag(model.as_str()), Some(*model));
        }
        assert_eq!(ModelId::from_tag("gpt-4o"), None);
    }

    #[test]
    fn sanitize_drops_unsupported_switches() {
        let cfg = ModelConfig::for_model(ModelId::DeepSeekV3)
            .with_search(true)
            .with_thinking(true);
        let clean = cfg.sanitized();
        assert!(!clean.enable_search);
        assert!(clean.enable_thinking); // deepseek-v3 has a reasoning channel

        let kimi = ModelConfig::for_model(ModelId::KimiK2_5)
            .with_thinking(true)
            .sanitized();
        assert!(!kimi.enable_thinking);
        assert!(!kimi.enable_search);
    }

    #[test]
    fn temperature_is_clamped() {
        let cfg = ModelConfig::default().with_temperature(5.0);
        assert_eq!(cfg.temperature, 2.0);
        let cfg = ModelConfig::default().with_temperature(-1.0);
        assert_eq!(cfg.temperature, 0.0);
    }
}
