//! Pluggable agent personas.
//!
//! A preset bundles everything that changes the agent's behaviour (instructions,
//! voice and enabled capabilities) without touching any relay code. Lookups never
//! fail: an unknown identifier resolves to the default preset.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Identifier of the preset used when none (or an unknown one) is requested.
pub const DEFAULT_PRESET_ID: &str = "general";

/// A named bundle of behavioural configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preset {
    pub id: String,
    pub name: String,
    pub description: String,
    pub voice: String,
    pub instructions: String,
    /// Upstream capability names, e.g. `google_search`.
    pub capabilities: BTreeSet<String>,
}

impl Preset {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }
}

/// Serializable summary of a preset, used by listing endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresetSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub voice: String,
}

impl From<&Preset> for PresetSummary {
    fn from(preset: &Preset) -> Self {
        Self {
            id: preset.id.clone(),
            name: preset.name.clone(),
            description: preset.description.clone(),
            voice: preset.voice.clone(),
        }
    }
}

/// Read-only lookup from preset identifier to [`Preset`].
#[derive(Debug, Clone)]
pub struct PresetCatalog {
    presets: BTreeMap<String, Preset>,
    default: Preset,
}

impl PresetCatalog {
    /// Builds a catalog from `presets`, using `default` as the fallback.
    ///
    /// The default preset is always part of the catalog, even if it is missing
    /// from `presets`.
    pub fn new(presets: impl IntoIterator<Item = Preset>, default: Preset) -> Self {
        let mut presets: BTreeMap<String, Preset> =
            presets.into_iter().map(|p| (p.id.clone(), p)).collect();
        presets
            .entry(default.id.clone())
            .or_insert_with(|| default.clone());
        Self { presets, default }
    }

    /// The catalog shipped with the service.
    pub fn builtin() -> Self {
        let general = preset(
            DEFAULT_PRESET_ID,
            "General Assistant",
            "A friendly, general-purpose voice assistant.",
            "Kore",
            &["google_search"],
            GENERAL_INSTRUCTIONS,
        );
        let others = [
            preset(
                "tutor",
                "Homework Tutor",
                "A patient tutor that can see and help with homework problems.",
                "Puck",
                &["google_search"],
                TUTOR_INSTRUCTIONS,
            ),
            preset(
                "translator",
                "Real-Time Translator",
                "A translator that works with speech and can read text from camera.",
                "Charon",
                &[],
                TRANSLATOR_INSTRUCTIONS,
            ),
            preset(
                "cooking",
                "Cooking Assistant",
                "A kitchen companion that can see ingredients and suggest recipes.",
                "Kore",
                &["google_search"],
                COOKING_INSTRUCTIONS,
            ),
        ];
        Self::new(others, general)
    }

    /// Resolves `id`, falling back to the default preset.
    pub fn lookup(&self, id: &str) -> &Preset {
        self.presets.get(id).unwrap_or(&self.default)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.presets.contains_key(id)
    }

    pub fn default_preset(&self) -> &Preset {
        &self.default
    }

    /// Summaries of every preset, ordered by identifier.
    pub fn list(&self) -> Vec<PresetSummary> {
        self.presets.values().map(PresetSummary::from).collect()
    }
}

impl Default for PresetCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn preset(
    id: &str,
    name: &str,
    description: &str,
    voice: &str,
    capabilities: &[&str],
    instructions: &str,
) -> Preset {
    Preset {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        voice: voice.to_string(),
        instructions: instructions.to_string(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
    }
}

const GENERAL_INSTRUCTIONS: &str = "\
You are a friendly, helpful AI assistant having a natural voice conversation.

Guidelines:
- Keep responses concise and conversational; you're speaking, not writing an essay.
- If the user shows you something via camera, describe what you see and respond helpfully.
- If interrupted, gracefully stop and address the user's new input.
- Be warm and personable. Use the user's name if they share it.
- When you don't know something, say so honestly and offer to search.
- Avoid bullet points or markdown; you're talking, not writing.
";

const TUTOR_INSTRUCTIONS: &str = "\
You are a patient, encouraging tutor having a voice conversation with a student.

Guidelines:
- When the student shows you a problem via camera, read it carefully and help step by step.
- NEVER give the answer directly. Guide them with questions and hints.
- Celebrate small wins.
- If they're stuck, break the problem into smaller pieces.
- Adapt your language to their level and keep explanations short and spoken-word friendly.
- If you see handwriting, read it back to confirm before helping.
";

const TRANSLATOR_INSTRUCTIONS: &str = "\
You are a real-time translation assistant.

Guidelines:
- When the user speaks in any language, detect the language and translate to English.
- When the user speaks English, ask what language they'd like to translate to.
- If the user shows text via camera (signs, menus, documents), read and translate it.
- Provide the translation first, then briefly explain any cultural context if relevant.
- For phrases in non-Latin scripts, also mention how to pronounce them.
";

const COOKING_INSTRUCTIONS: &str = "\
You are a friendly cooking assistant having a voice conversation.

Guidelines:
- If the user shows you their fridge, pantry, or ingredients via camera, identify what you see.
- Suggest recipes based on visible ingredients. Prioritize simple, practical meals.
- Give step-by-step instructions one step at a time and wait until the user is ready.
- Warn about food safety if you notice anything concerning.
- If asked about substitutions, always offer alternatives.
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_id_resolves_to_default() {
        let catalog = PresetCatalog::builtin();
        let preset = catalog.lookup("does-not-exist");
        assert_eq!(preset.id, DEFAULT_PRESET_ID);
        assert_eq!(preset, catalog.default_preset());
    }

    #[test]
    fn builtin_presets_are_listed_in_id_order() {
        let ids: Vec<String> = PresetCatalog::builtin()
            .list()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["cooking", "general", "translator", "tutor"]);
    }

    #[test]
    fn translator_has_no_capabilities() {
        let catalog = PresetCatalog::builtin();
        let translator = catalog.lookup("translator");
        assert_eq!(translator.voice, "Charon");
        assert!(translator.capabilities.is_empty());
        assert!(catalog.lookup("tutor").has_capability("google_search"));
    }

    #[test]
    fn default_is_inserted_when_missing_from_list() {
        let fallback = preset("base", "Base", "", "Kore", &[], "be nice");
        let catalog = PresetCatalog::new(Vec::new(), fallback.clone());
        assert!(catalog.contains("base"));
        assert_eq!(catalog.lookup("base"), &fallback);
    }
}
