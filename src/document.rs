//! Canonical project document: project → issues → pages → panels → balloons → text runs.
//!
//! The manifest store serializes this verbatim. Fields the core does not know
//! about are carried in `extra` so collaborators can extend the file safely.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::util::blake3_hash;

pub(crate) const DOCUMENT_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ProjectDocument {
    #[serde(default = "default_format")]
    pub(crate) format: u32,
    pub(crate) id: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) issues: Vec<Issue>,
    #[serde(default)]
    pub(crate) scripts: Vec<Script>,
    #[serde(default)]
    pub(crate) characters: Vec<Character>,
    #[serde(default)]
    pub(crate) tags: Vec<TagDef>,
    #[serde(flatten)]
    pub(crate) extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Issue {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) number: u32,
    #[serde(default)]
    pub(crate) title: String,
    #[serde(default)]
    pub(crate) pages: Vec<Page>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Page {
    pub(crate) id: String,
    pub(crate) number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) location: Option<String>,
    #[serde(default)]
    pub(crate) panels: Vec<Panel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Panel {
    pub(crate) id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) note: Option<String>,
    /// Overrides the page location for this panel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) location: Option<String>,
    #[serde(default)]
    pub(crate) balloons: Vec<Balloon>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub(crate) enum BalloonKind {
    #[default]
    Speech,
    Thought,
    Caption,
    Sfx,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Balloon {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) kind: BalloonKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) character_id: Option<String>,
    #[serde(default)]
    pub(crate) runs: Vec<TextRun>,
    /// Index doc ids this balloon points at (callbacks, recurring props).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TextRun {
    pub(crate) text: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub(crate) bold: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub(crate) italic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Script {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) title: String,
    #[serde(default)]
    pub(crate) lines: Vec<ScriptLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ScriptLine {
    pub(crate) id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) page_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) character_id: Option<String>,
    pub(crate) text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Character {
    pub(crate) id: String,
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TagDef {
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) description: Option<String>,
}

fn default_format() -> u32 {
    DOCUMENT_FORMAT
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl TextRun {
    pub(crate) fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            bold: false,
            italic: false,
        }
    }
}

impl Balloon {
    pub(crate) fn text(&self) -> String {
        self.runs.iter().map(|r| r.text.as_str()).collect()
    }
}

impl ProjectDocument {
    pub(crate) fn empty(name: impl Into<String>) -> Self {
        let name = name.into();
        let seed = format!("{name}:{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let hex = blake3_hash(seed.as_bytes()).to_hex();
        Self {
            format: DOCUMENT_FORMAT,
            id: format!("prj-{}", &hex.as_str()[..16]),
            name,
            issues: Vec::new(),
            scripts: Vec::new(),
            characters: Vec::new(),
            tags: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub(crate) fn pages(&self) -> impl Iterator<Item = (&Issue, &Page)> {
        self.issues
            .iter()
            .flat_map(|issue| issue.pages.iter().map(move |page| (issue, page)))
    }

    pub(crate) fn page(&self, id: &str) -> Option<&Page> {
        self.pages().map(|(_, page)| page).find(|page| page.id == id)
    }

    pub(crate) fn character(&self, id: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.id == id)
    }

    pub(crate) fn character_name(&self, id: &str) -> Option<&str> {
        self.character(id).map(|c| c.name.as_str())
    }

    /// Reject structurally ambiguous documents before anything is written.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(VaultError::invalid("project id is empty"));
        }
        let mut seen = UniqueIds::default();
        for issue in &self.issues {
            seen.check("issue", &issue.id)?;
            for page in &issue.pages {
                seen.check("page", &page.id)?;
                for panel in &page.panels {
                    seen.check("panel", &panel.id)?;
                    for balloon in &panel.balloons {
                        seen.check("balloon", &balloon.id)?;
                    }
                }
            }
        }
        for script in &self.scripts {
            seen.check("script", &script.id)?;
            for line in &script.lines {
                seen.check("script line", &line.id)?;
            }
        }
        for character in &self.characters {
            seen.check("character", &character.id)?;
        }
        for tag in &self.tags {
            seen.check("tag", &tag.name.to_lowercase())?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct UniqueIds {
    seen: HashSet<(&'static str, String)>,
}

impl UniqueIds {
    fn check(&mut self, kind: &'static str, id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(VaultError::invalid(format!("{kind} id is empty")));
        }
        if !self.seen.insert((kind, id.to_string())) {
            return Err(VaultError::invalid(format!("duplicate {kind} id: {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) fn balloon(id: &str, character: Option<&str>, text: &str) -> Balloon {
        Balloon {
            id: id.to_string(),
            kind: BalloonKind::Speech,
            character_id: character.map(str::to_string),
            runs: vec![TextRun::plain(text)],
            refs: Vec::new(),
        }
    }

    pub(crate) fn panel(id: &str, note: Option<&str>, balloons: Vec<Balloon>) -> Panel {
        Panel {
            id: id.to_string(),
            note: note.map(str::to_string),
            location: None,
            balloons,
        }
    }

    pub(crate) fn page(id: &str, number: u32, location: Option<&str>, panels: Vec<Panel>) -> Page {
        Page {
            id: id.to_string(),
            number,
            location: location.map(str::to_string),
            panels,
        }
    }

    /// Two pages, two characters, one script, one tag definition.
    pub(crate) fn sample() -> ProjectDocument {
        let mut doc = ProjectDocument::empty("Night Shift");
        doc.id = "prj-sample".to_string();
        doc.characters = vec![
            Character {
                id: "c-ava".into(),
                name: "Ava".into(),
                aliases: vec!["The Courier".into()],
                notes: Some("Bike messenger".into()),
            },
            Character {
                id: "c-bo".into(),
                name: "Bo".into(),
                aliases: Vec::new(),
                notes: None,
            },
        ];
        doc.tags = vec![TagDef {
            name: "greet".into(),
            description: Some("Greetings".into()),
        }];
        doc.issues = vec![Issue {
            id: "i1".into(),
            number: 1,
            title: "Pilot".into(),
            pages: vec![
                page(
                    "p1",
                    1,
                    Some("Rooftop"),
                    vec![panel(
                        "p1-1",
                        Some("Wide shot of the skyline"),
                        vec![
                            balloon("b1", Some("c-ava"), "Hello up there @greet"),
                            balloon("b2", Some("c-bo"), "Who goes there?"),
                        ],
                    )],
                ),
                page(
                    "p2",
                    2,
                    Some("Alley"),
                    vec![panel(
                        "p2-1",
                        None,
                        vec![balloon("b3", None, "Rain hammers the dumpsters")],
                    )],
                ),
            ],
        }];
        doc.scripts = vec![Script {
            id: "s1".into(),
            title: "Issue one draft".into(),
            lines: vec![ScriptLine {
                id: "l1".into(),
                page_id: Some("p2".into()),
                character_id: Some("c-bo".into()),
                text: "Bo mutters about the weather".into(),
            }],
        }];
        doc
    }

    /// One page at "Café" where Élodie says hello.
    pub(crate) fn accented() -> ProjectDocument {
        let mut doc = ProjectDocument::empty("Soirée");
        doc.characters = vec![Character {
            id: "c-el".into(),
            name: "Élodie".into(),
            aliases: Vec::new(),
            notes: None,
        }];
        doc.issues = vec![Issue {
            id: "i1".into(),
            number: 1,
            title: String::new(),
            pages: vec![page(
                "p1",
                1,
                Some("Café"),
                vec![panel("x1", None, vec![balloon("b1", Some("c-el"), "Bonjour")])],
            )],
        }];
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn sample_is_valid() {
        sample().validate().unwrap();
    }

    #[test]
    fn duplicate_panel_id_is_rejected() {
        let mut doc = sample();
        let dup = panel("p1-1", None, Vec::new());
        doc.issues[0].pages[1].panels.push(dup);
        let err = doc.validate().unwrap_err();
        assert!(matches!(err, VaultError::Validation(ref m) if m.contains("duplicate panel id: p1-1")));
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = r#"{"id":"prj-x","name":"X","styles":{"font":"Comic"}}"#;
        let doc: ProjectDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.format, DOCUMENT_FORMAT);
        assert!(doc.extra.contains_key("styles"));
        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["styles"]["font"], "Comic");
    }

    #[test]
    fn lookups() {
        let doc = sample();
        assert_eq!(doc.page("p2").map(|p| p.number), Some(2));
        assert_eq!(doc.character_name("c-ava"), Some("Ava"));
        assert!(doc.character("nobody").is_none());
        assert_eq!(doc.issues[0].pages[0].panels[0].balloons[0].text(), "Hello up there @greet");
    }
}
