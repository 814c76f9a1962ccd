//! Static knowledge about upstream models: how to reach them and what they cost.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{AsRefStr, Display, EnumIter, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Search,
}

impl Default for Modality {
    fn default() -> Self {
        Modality::Text
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Speed {
    VeryFast,
    Fast,
    Medium,
    Slow,
    VerySlow,
}

impl Speed {
    pub fn rank(&self) -> u8 {
        match self {
            Speed::VeryFast => 0,
            Speed::Fast => 1,
            Speed::Medium => 2,
            Speed::Slow => 3,
            Speed::VerySlow => 4,
        }
    }
}

/// Task classification used for model routing.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TaskType {
    Planning,
    Architecture,
    Coding,
    Debugging,
    Refactoring,
    Testing,
    SimpleEdit,
    Formatting,
    Rename,
    Research,
    ApiLookup,
    Documentation,
    Algorithms,
    Math,
    Optimization,
    ImageGeneration,
    Logo,
    Asset,
}

impl TaskType {
    /// Parse a free-form type label, falling back to `Coding`.
    pub fn parse_or_default(label: &str) -> Self {
        label.trim().to_lowercase().parse().unwrap_or(TaskType::Coding)
    }
}

pub const DEFAULT_COST_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub modality: Modality,
    /// Relative rate-limit cost; lower is preferred.
    pub cost_weight: f64,
    pub speed: Speed,
    /// 1 = premium reasoning .. 5 = image generation
    pub tier: u8,
    pub strengths: Vec<String>,
}

impl ModelDescriptor {
    pub fn new(id: &str, display_name: &str, modality: Modality) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            modality,
            cost_weight: DEFAULT_COST_WEIGHT,
            speed: Speed::Medium,
            tier: 3,
            strengths: Vec::new(),
        }
    }

    pub fn with_profile(mut self, tier: u8, cost_weight: f64, speed: Speed, strengths: &[&str]) -> Self {
        self.tier = tier;
        self.cost_weight = cost_weight;
        self.speed = speed;
        self.strengths = strengths.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Entry returned to presentation layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub modality: Modality,
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<ModelDescriptor>,
    index: HashMap<String, usize>,
    routes: HashMap<TaskType, Vec<String>>,
    fallback: Vec<String>,
}

const OPUS: &str = "claude-opus-4-5-20251101";
const OPUS_THINKING: &str = "claude-opus-4-5-20251101-thinking-32k";
const SONNET: &str = "claude-sonnet-4-5-20250929";
const NANO_BANANA_PRO: &str = "gemini-3-pro-image-preview-2k (nano-banana-pro)";

const TEXT_MODELS: &[(&str, &str)] = &[
    ("gemini-3-pro", "Gemini 3 Pro"),
    ("gemini-3-flash", "Gemini 3 Flash"),
    ("gpt-5.2-high", "GPT 5.2 High"),
    ("gpt-5.2", "GPT 5.2"),
    ("gpt-5.1-high", "GPT 5.1 High"),
    ("gpt-5.1", "GPT 5.1"),
    ("o3-2025-04-16", "o3"),
    (OPUS_THINKING, "Claude Opus 4.5 Thinking"),
    (OPUS, "Claude Opus 4.5"),
    ("claude-sonnet-4-5-20250929-thinking-32k", "Claude Sonnet 4.5 Thinking"),
    (SONNET, "Claude Sonnet 4.5"),
    ("deepseek-v3.2-thinking", "DeepSeek V3.2 Thinking"),
    ("deepseek-v3.2", "DeepSeek V3.2"),
    ("grok-4.1-thinking", "Grok 4.1 Thinking"),
    ("grok-4.1", "Grok 4.1"),
];

const IMAGE_MODELS: &[(&str, &str)] = &[
    ("gpt-image-1.5", "GPT Image 1.5"),
    ("gpt-image-1", "GPT Image 1"),
    (NANO_BANANA_PRO, "Gemini 3 Pro Image"),
    ("gemini-2.5-flash-image-preview (nano-banana)", "Gemini 2.5 Flash Image"),
    ("dall-e-3", "DALL-E 3"),
    ("flux-2-max", "FLUX 2 Max"),
    ("flux-2-pro", "FLUX 2 Pro"),
    ("recraft-v3", "Recraft V3"),
];

const SEARCH_MODELS: &[(&str, &str)] = &[
    ("gemini-3-pro-grounding", "Gemini 3 Pro (Grounding)"),
    ("gemini-2.5-pro-grounding", "Gemini 2.5 Pro (Grounding)"),
    ("gpt-5.2-search", "GPT 5.2 Search"),
    ("gpt-5.1-search", "GPT 5.1 Search"),
    ("gpt-5.1-search-sp", "GPT 5.1 Search SP"),
    ("gpt-5-search", "GPT 5 Search"),
    ("o3-search", "o3 Search"),
    ("grok-4-1-fast-search", "Grok 4.1 Fast Search"),
    ("grok-4-fast-search", "Grok 4 Fast Search"),
    ("grok-4-search", "Grok 4 Search"),
    ("claude-opus-4-1-search", "Claude Opus 4.1 Search"),
    ("claude-opus-4-search", "Claude Opus 4 Search"),
    ("ppl-sonar-reasoning-pro-high", "Perplexity Sonar Reasoning Pro"),
    ("ppl-sonar-pro-high", "Perplexity Sonar Pro"),
    ("diffbot-small-xl", "Diffbot Small XL"),
];

impl ModelCatalog {
    pub fn new(
        models: Vec<ModelDescriptor>,
        routes: HashMap<TaskType, Vec<String>>,
        fallback: Vec<String>,
    ) -> Self {
        let index = models
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();
        Self {
            models,
            index,
            routes,
            fallback,
        }
    }

    /// The built-in upstream catalog with routing and cost profiles.
    pub fn builtin() -> Self {
        let mut models: Vec<ModelDescriptor> = Vec::new();
        for (modality, table) in [
            (Modality::Text, TEXT_MODELS),
            (Modality::Image, IMAGE_MODELS),
            (Modality::Search, SEARCH_MODELS),
        ] {
            models.extend(
                table
                    .iter()
                    .map(|(id, name)| ModelDescriptor::new(id, name, modality)),
            );
        }

        let profiles: &[(&str, u8, f64, Speed, &[&str])] = &[
            (OPUS, 1, 1.0, Speed::Slow, &["planning", "architecture", "complex-reasoning", "debugging"]),
            (OPUS_THINKING, 1, 1.5, Speed::VerySlow, &["deep-analysis", "multi-step-reasoning"]),
            ("gpt-5.2-high", 2, 0.8, Speed::Medium, &["coding", "api-integration", "web-development", "general"]),
            ("gpt-5.2", 2, 0.6, Speed::Fast, &["coding", "general", "refactoring"]),
            (SONNET, 2, 0.7, Speed::Fast, &["coding", "debugging", "refactoring", "tests"]),
            ("gemini-3-pro", 3, 0.4, Speed::Fast, &["fast-reasoning", "code-review", "explanations", "general"]),
            ("gemini-3-flash", 3, 0.2, Speed::VeryFast, &["quick-tasks", "simple-edits", "formatting"]),
            ("deepseek-v3.2", 3, 0.3, Speed::Fast, &["algorithms", "optimization", "math", "data-structures"]),
            ("gpt-5.2-search", 4, 0.5, Speed::Medium, &["research", "documentation", "api-discovery", "current-info"]),
            ("gemini-3-pro-grounding", 4, 0.4, Speed::Fast, &["research", "fact-checking", "current-info"]),
            ("ppl-sonar-reasoning-pro-high", 4, 0.7, Speed::Slow, &["deep-research", "synthesis", "multi-source"]),
            ("gpt-image-1.5", 5, 0.8, Speed::Slow, &["image-generation", "logos", "assets", "ui-mockups"]),
            (NANO_BANANA_PRO, 5, 0.5, Speed::Medium, &["image-generation", "quick-assets"]),
        ];
        for (id, tier, cost, speed, strengths) in profiles {
            if let Some(model) = models.iter_mut().find(|m| m.id == *id) {
                *model = model.clone().with_profile(*tier, *cost, *speed, strengths);
            }
        }

        let route = |ids: &[&str]| ids.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let routes: HashMap<TaskType, Vec<String>> = [
            (TaskType::Planning, route(&[OPUS, "gpt-5.2-high", "gemini-3-pro"])),
            (TaskType::Architecture, route(&[OPUS, "gpt-5.2-high"])),
            (TaskType::Coding, route(&["gpt-5.2", SONNET, "gemini-3-pro"])),
            (TaskType::Debugging, route(&[OPUS, SONNET, "gpt-5.2"])),
            (TaskType::Refactoring, route(&[SONNET, "gpt-5.2", "gemini-3-pro"])),
            (TaskType::Testing, route(&[SONNET, "gpt-5.2"])),
            (TaskType::SimpleEdit, route(&["gemini-3-flash", "gemini-3-pro"])),
            (TaskType::Formatting, route(&["gemini-3-flash"])),
            (TaskType::Rename, route(&["gemini-3-flash"])),
            (
                TaskType::Research,
                route(&["gpt-5.2-search", "gemini-3-pro-grounding", "ppl-sonar-reasoning-pro-high"]),
            ),
            (TaskType::ApiLookup, route(&["gpt-5.2-search", "gemini-3-pro-grounding"])),
            (TaskType::Documentation, route(&["gpt-5.2-search", "gemini-3-pro-grounding"])),
            (TaskType::Algorithms, route(&["deepseek-v3.2", OPUS])),
            (TaskType::Math, route(&["deepseek-v3.2", OPUS])),
            (TaskType::Optimization, route(&["deepseek-v3.2", "gpt-5.2"])),
            (TaskType::ImageGeneration, route(&["gpt-image-1.5", NANO_BANANA_PRO])),
            (TaskType::Logo, route(&["gpt-image-1.5"])),
            (TaskType::Asset, route(&["gpt-image-1.5", NANO_BANANA_PRO])),
        ]
        .into_iter()
        .collect();

        Self::new(models, routes, route(&["gemini-3-pro", "gpt-5.2"]))
    }

    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.index.get(id).map(|&i| &self.models[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// Ranked candidates for a task type; unrouted types use the coding list.
    pub fn candidates(&self, task: TaskType) -> &[String] {
        self.routes
            .get(&task)
            .or_else(|| self.routes.get(&TaskType::Coding))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn fallback(&self) -> &[String] {
        &self.fallback
    }

    pub fn cost_weight(&self, id: &str) -> f64 {
        self.get(id).map(|m| m.cost_weight).unwrap_or(DEFAULT_COST_WEIGHT)
    }

    pub fn speed(&self, id: &str) -> Speed {
        self.get(id).map(|m| m.speed).unwrap_or(Speed::Medium)
    }

    pub fn available_models(&self) -> Vec<ModelInfo> {
        self.models
            .iter()
            .map(|m| ModelInfo {
                id: m.id.clone(),
                name: m.display_name.clone(),
                modality: m.modality,
            })
            .collect()
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_builtin_catalog_counts() {
        let catalog = ModelCatalog::builtin();
        let count = |m: Modality| catalog.models().iter().filter(|d| d.modality == m).count();
        assert_eq!(count(Modality::Text), 15);
        assert_eq!(count(Modality::Image), 8);
        assert_eq!(count(Modality::Search), 15);
    }

    #[test]
    fn test_every_route_points_at_catalog_models() {
        let catalog = ModelCatalog::builtin();
        for task in TaskType::iter() {
            for id in catalog.candidates(task) {
                assert!(catalog.contains(id), "{} routes to unknown {}", task, id);
            }
        }
        for id in catalog.fallback() {
            assert!(catalog.contains(id));
        }
    }

    #[test]
    fn test_profiles_applied() {
        let catalog = ModelCatalog::builtin();
        let flash = catalog.get("gemini-3-flash").unwrap();
        assert_eq!(flash.speed, Speed::VeryFast);
        assert_eq!(flash.cost_weight, 0.2);
        // No profile: defaults
        assert_eq!(catalog.cost_weight("grok-4.1"), DEFAULT_COST_WEIGHT);
        assert_eq!(catalog.speed("grok-4.1"), Speed::Medium);
        assert_eq!(catalog.cost_weight("not-a-model"), DEFAULT_COST_WEIGHT);
    }

    #[test]
    fn test_task_type_labels() {
        assert_eq!(TaskType::SimpleEdit.to_string(), "simple-edit");
        assert_eq!(TaskType::parse_or_default("image-generation"), TaskType::ImageGeneration);
        assert_eq!(TaskType::parse_or_default(" API-Lookup "), TaskType::ApiLookup);
        assert_eq!(TaskType::parse_or_default("poetry"), TaskType::Coding);
    }
}
