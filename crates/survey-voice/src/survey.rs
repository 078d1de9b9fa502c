//! Surveys supplied by the external catalog, and the language conventions of a call.
//!
//! The core only reads surveys. `InMemoryCatalog` is the boundary adapter the CLI uses;
//! a real deployment plugs its own `SurveyCatalog` in front of its persistence layer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A survey script as supplied at call start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Survey {
    pub id: String,
    pub name: String,
    /// Instruction text that becomes the system turn.
    #[serde(alias = "systemPrompt")]
    pub system_prompt: String,
    /// Language code, e.g. "en" or "es".
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en".to_string()
}

impl Survey {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            system_prompt: system_prompt.into(),
            language: language.into(),
        }
    }

    pub fn lang(&self) -> Language {
        Language::from_code(&self.language)
    }
}

/// Languages the agent can conduct a survey in. Unknown codes fall back to English.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    English,
    Spanish,
}

impl Language {
    /// Parse "es", "es-ES", "ES" ... as Spanish; everything else is English.
    pub fn from_code(code: &str) -> Self {
        let primary = code.split(['-', '_']).next().unwrap_or("");
        if primary.eq_ignore_ascii_case("es") {
            Language::Spanish
        } else {
            Language::English
        }
    }

    /// Short code sent to the transcription backend as a hint.
    pub fn code(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Spanish => "es",
        }
    }

    /// Locale used by the local synthesizer.
    pub fn locale(&self) -> &'static str {
        match self {
            Language::English => "en-US",
            Language::Spanish => "es-ES",
        }
    }

    /// Remote TTS voice for this language.
    pub fn voice(&self) -> &'static str {
        match self {
            Language::English => "nova",
            Language::Spanish => "echo",
        }
    }

    /// Appended to the survey prompt in the system turn.
    pub fn directive(&self) -> &'static str {
        match self {
            Language::English => "Please conduct the entire survey in English.",
            Language::Spanish => "Please conduct the entire survey in Spanish.",
        }
    }

    /// Synthetic user-role prompt that makes the agent open the call.
    pub fn opening_prompt(&self) -> &'static str {
        match self {
            Language::English => "Say hello and start the survey naturally.",
            Language::Spanish => "Saluda y comienza la encuesta de forma natural.",
        }
    }
}

/// Read-only source of surveys
pub trait SurveyCatalog: Send + Sync {
    fn find(&self, id: &str) -> Option<Survey>;
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    surveys: Vec<Survey>,
}

/// Surveys held in memory, optionally loaded from a TOML file of `[[surveys]]` tables.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCatalog {
    surveys: HashMap<String, Survey>,
}

impl InMemoryCatalog {
    pub fn new(surveys: impl IntoIterator<Item = Survey>) -> Self {
        Self {
            surveys: surveys.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        let file: CatalogFile = toml::from_str(raw)?;
        Ok(Self::new(file.surveys))
    }

    /// Load a catalog file. A missing file yields an empty catalog.
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn insert(&mut self, survey: Survey) {
        self.surveys.insert(survey.id.clone(), survey);
    }

    pub fn len(&self) -> usize {
        self.surveys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surveys.is_empty()
    }

    /// Surveys sorted by id, for listing in a UI.
    pub fn list(&self) -> Vec<&Survey> {
        let mut all: Vec<&Survey> = self.surveys.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

impl SurveyCatalog for InMemoryCatalog {
    fn find(&self, id: &str) -> Option<Survey> {
        self.surveys.get(id).cloned()
    }
}
