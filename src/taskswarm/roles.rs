//! Predefined worker roles.
//!
//! A role is a behaviour template: a system prompt, the tools the role may
//! call, and a default model configuration. The planner references roles by
//! string tag; unknown tags resolve to `researcher` so a sloppy plan never
//! stalls a job.

use lazy_static::lazy_static;
use std::collections::HashMap;

use crate::taskswarm::model::{ModelConfig, ModelId};

/// Native capability names that roles may list among their tools. These are
/// toggled through the request configuration for native models and replaced
/// by sandbox tools otherwise.
pub const NATIVE_WEB_SEARCH: &str = "web_search";
/// See [`NATIVE_WEB_SEARCH`].
pub const NATIVE_WEB_EXTRACTOR: &str = "web_extractor";
/// See [`NATIVE_WEB_SEARCH`].
pub const NATIVE_CODE_INTERPRETER: &str = "code_interpreter";

/// Media artifact kind produced by a generator role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    /// Produces image URLs.
    Image,
    /// Produces a video URL through the async job API.
    Video,
    /// Animates an upstream image into a video.
    ImageToVideo,
    /// Produces a speech audio URL.
    Speech,
}

/// A named behaviour template for workers.
#[derive(Debug, Clone)]
pub struct RoleSpec {
    /// Stable role key referenced by plans (`"researcher"`, `"coder"`, …).
    pub name: &'static str,
    /// One-line description used in prompts and events.
    pub description: &'static str,
    /// Role-specific system prompt body.
    pub system_prompt: &'static str,
    /// Tool names this role may call (native capability names included).
    pub allowed_tools: &'static [&'static str],
    /// Default model configuration for the role.
    pub model_config: ModelConfig,
    /// Set for the four media generator roles.
    pub generator: Option<GeneratorKind>,
}

impl RoleSpec {
    /// Whether this role produces structured multimodal output instead of
    /// plain text.
    pub fn is_generator(&self) -> bool {
        self.generator.is_some()
    }
}

/// Role key used when a plan references an unknown agent type.
pub const DEFAULT_ROLE: &str = "researcher";

fn text_config(model: ModelId, temperature: f32, thinking: bool) -> ModelConfig {
    let mut cfg = ModelConfig::for_model(model).with_temperature(temperature);
    cfg.enable_thinking = thinking;
    cfg
}

lazy_static! {
    static ref ROLES: HashMap<&'static str, RoleSpec> = {
        let mut table = HashMap::new();
        let mut add = |role: RoleSpec| {
            table.insert(role.name, role);
        };

        add(RoleSpec {
            name: "searcher",
            description: "Finds current information on the web",
            system_prompt: "You are a web research specialist. Find current, factual \
                information for the task. Report exact figures, version numbers, and dates \
                as found in sources; never invent them. Prefer primary sources.",
            allowed_tools: &[NATIVE_WEB_SEARCH],
            model_config: text_config(ModelId::Qwen3Max, 0.3, false),
            generator: None,
        });
        add(RoleSpec {
            name: "fact_checker",
            description: "Verifies claims against independent sources",
            system_prompt: "You are a fact checker. Cross-check every claim against at \
                least two independent sources. Flag numbers that contradict each other and \
                label unverifiable statements explicitly.",
            allowed_tools: &[NATIVE_WEB_SEARCH, NATIVE_WEB_EXTRACTOR],
            model_config: text_config(ModelId::Qwen3Max, 0.2, false),
            generator: None,
        });
        add(RoleSpec {
            name: "analyst",
            description: "Performs quantitative analysis of gathered data",
            system_prompt: "You are a data analyst. Work rigorously from the data you are \
                given: compute, compare, and surface trends. Use tables for structured \
                comparisons and state the provenance of every figure.",
            allowed_tools: &[NATIVE_CODE_INTERPRETER],
            model_config: text_config(ModelId::Qwen3Max, 0.4, true),
            generator: None,
        });
        add(RoleSpec {
            name: "researcher",
            description: "Conducts broad research and synthesis",
            system_prompt: "You are a researcher. Gather relevant material, weigh source \
                quality, and produce a structured synthesis with citations for every \
                non-obvious claim.",
            allowed_tools: &[NATIVE_WEB_SEARCH, NATIVE_WEB_EXTRACTOR],
            model_config: text_config(ModelId::Qwen3Max, 0.5, true),
            generator: None,
        });
        add(RoleSpec {
            name: "writer",
            description: "Produces polished long-form text",
            system_prompt: "You are a professional writer. Turn upstream findings into a \
                coherent, well-structured document in Markdown. Preserve the original data \
                citations from upstream results verbatim.",
            allowed_tools: &[],
            model_config: text_config(ModelId::Qwen3Max, 0.7, false),
            generator: None,
        });
        add(RoleSpec {
            name: "coder",
            description: "Writes and verifies code",
            system_prompt: "You are a software engineer. Write clean, working code with \
                brief usage notes. When producing multiple files, precede each one with a \
                '# file: path' marker line. Verify non-trivial logic by executing it.",
            allowed_tools: &[NATIVE_CODE_INTERPRETER],
            model_config: text_config(ModelId::Qwen3Max, 0.2, true),
            generator: None,
        });
        add(RoleSpec {
            name: "translator",
            description: "Translates content between languages",
            system_prompt: "You are a translator. Produce a faithful, natural translation \
                that preserves formatting, numbers, and citations exactly.",
            allowed_tools: &[],
            model_config: text_config(ModelId::Qwen3Max, 0.3, false),
            generator: None,
        });
        add(RoleSpec {
            name: "summarizer",
            description: "Condenses long material into its essentials",
            system_prompt: "You are a summarizer. Reduce the input to its essential points \
                without losing quantitative detail or source attributions.",
            allowed_tools: &[],
            model_config: text_config(ModelId::Qwen3Max, 0.4, false),
            generator: None,
        });
        add(RoleSpec {
            name: "creative",
            description: "Generates original creative content",
            system_prompt: "You are a creative writer. Produce original, vivid content \
                matching the requested tone and format.",
            allowed_tools: &[],
            model_config: text_config(ModelId::Qwen3Max, 0.9, false),
            generator: None,
        });
        add(RoleSpec {
            name: "image_analyst",
            description: "Describes and interprets images",
            system_prompt: "You are an image analyst. Describe the supplied images \
                precisely: objects, text, layout, and anything anomalous. Answer the task \
                strictly from what is visible.",
            allowed_tools: &[],
            model_config: text_config(ModelId::QwenVlMax, 0.3, false),
            generator: None,
        });

        add(RoleSpec {
            name: "text_to_image",
            description: "Generates images from text prompts",
            system_prompt: "Generate images matching the prompt.",
            allowed_tools: &[],
            model_config: text_config(ModelId::Qwen3Max, 0.7, false),
            generator: Some(GeneratorKind::Image),
        });
        add(RoleSpec {
            name: "text_to_video",
            description: "Generates video clips from text prompts",
            system_prompt: "Generate a video clip matching the prompt.",
            allowed_tools: &[],
            model_config: text_config(ModelId::Qwen3Max, 0.7, false),
            generator: Some(GeneratorKind::Video),
        });
        add(RoleSpec {
            name: "image_to_video",
            description: "Animates an input image into a video clip",
            system_prompt: "Animate the supplied image according to the prompt.",
            allowed_tools: &[],
            model_config: text_config(ModelId::Qwen3Max, 0.7, false),
            generator: Some(GeneratorKind::ImageToVideo),
        });
        add(RoleSpec {
            name: "voice_synthesizer",
            description: "Synthesises speech from text",
            system_prompt: "Synthesise natural speech for the supplied text.",
            allowed_tools: &[],
            model_config: text_config(ModelId::Qwen3Max, 0.7, false),
            generator: Some(GeneratorKind::Speech),
        });

        table
    };
}

/// Look up a role by its planner tag, falling back to [`DEFAULT_ROLE`].
pub fn role_for_hint(hint: &str) -> &'static RoleSpec {
    let key = hint.trim().to_lowercase();
    ROLES
        .get(key.as_str())
        .unwrap_or_else(|| &ROLES[DEFAULT_ROLE])
}

/// Look up a role strictly, without the default fallback.
pub fn role_exact(name: &str) -> Option<&'static RoleSpec> {
    ROLES.get(name)
}

/// All registered role keys, sorted.
pub fn role_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = ROLES.keys().copied().collect();
    names.sort_unstable();
    names
}
