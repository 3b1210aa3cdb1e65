//! Character and item records.

use serde::{Deserialize, Serialize};

/// Attitude-only record for a pre-declared character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownCharacterAttitude {
    pub name: String,
    pub attitude: String,
}

/// Full profile for a character outside the known set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NpcDossier {
    pub name: String,
    #[serde(default)]
    pub appearance: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub attitude: String,
}

impl NpcDossier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_appearance(mut self, appearance: impl Into<String>) -> Self {
        self.appearance = appearance.into();
        self
    }

    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = personality.into();
        self
    }

    pub fn with_attitude(mut self, attitude: impl Into<String>) -> Self {
        self.attitude = attitude.into();
        self
    }

    /// Rendered for injection and for the `fetch_character` tool.
    pub fn describe(&self) -> String {
        let mut out = format!("### {}\n", self.name);
        for (label, value) in [
            ("Appearance", &self.appearance),
            ("Personality", &self.personality),
            ("Attitude", &self.attitude),
        ] {
            if !value.is_empty() {
                out.push_str(&format!("- {label}: {value}\n"));
            }
        }
        out
    }
}

/// A tracked item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub significance: String,
}

/// Case-insensitive, whitespace-trimmed name key.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Who is who: the protagonist and the pre-declared known characters.
///
/// The protagonist is never tracked. Known names get attitude records only;
/// every other name gets an NPC dossier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub protagonist: String,
    pub known: Vec<String>,
}

impl Roster {
    pub fn new(protagonist: impl Into<String>, known: impl IntoIterator<Item = String>) -> Self {
        Self {
            protagonist: protagonist.into(),
            known: known.into_iter().collect(),
        }
    }

    pub fn is_protagonist(&self, name: &str) -> bool {
        !self.protagonist.trim().is_empty() && name_key(name) == name_key(&self.protagonist)
    }

    /// Canonical spelling of a known name, if `name` is one (and not the protagonist).
    pub fn canonical_known(&self, name: &str) -> Option<&str> {
        if self.is_protagonist(name) {
            return None;
        }
        let key = name_key(name);
        self.known
            .iter()
            .find(|k| name_key(k) == key)
            .map(String::as_str)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.canonical_known(name).is_some()
    }

    /// True if `name` belongs in the NPC list.
    pub fn is_npc(&self, name: &str) -> bool {
        !name.trim().is_empty() && !self.is_protagonist(name) && !self.is_known(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Roster {
        Roster::new("Aria", ["Kael".to_string(), "Old Tom".to_string()])
    }

    #[test]
    fn test_roster_classifies_case_insensitively() {
        let roster = roster();
        assert_eq!(roster.canonical_known("kael"), Some("Kael"));
        assert_eq!(roster.canonical_known(" OLD TOM "), Some("Old Tom"));
        assert!(roster.is_npc("Brannoc"));
        assert!(!roster.is_npc("KAEL"));
    }

    #[test]
    fn test_protagonist_is_in_neither_list() {
        let roster = Roster::new("Aria", ["Aria".to_string()]);
        assert!(roster.is_protagonist("aria"));
        assert!(!roster.is_known("Aria"));
        assert!(!roster.is_npc("Aria"));
    }

    #[test]
    fn test_empty_protagonist_matches_nothing() {
        let roster = Roster::default();
        assert!(!roster.is_protagonist(""));
        assert!(roster.is_npc("Anyone"));
        assert!(!roster.is_npc("   "));
    }

    #[test]
    fn test_dossier_describe_skips_empty_fields() {
        let text = NpcDossier::new("Brannoc")
            .with_attitude("wary")
            .describe();
        assert!(text.contains("### Brannoc"));
        assert!(text.contains("Attitude: wary"));
        assert!(!text.contains("Appearance"));
    }
}
