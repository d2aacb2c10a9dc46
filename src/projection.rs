//! Document → searchable rows. Pure and deterministic: the same document always
//! yields the same rows in the same order, which is what makes rebuilds idempotent.

use std::collections::{BTreeSet, HashMap};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::document::{BalloonKind, Issue, Page, ProjectDocument};
use crate::error::{Result, VaultError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DocType {
    Balloon,
    PanelNote,
    ScriptLine,
    Character,
    Tag,
}

impl DocType {
    pub(crate) const ALL: [DocType; 5] = [
        DocType::Balloon,
        DocType::PanelNote,
        DocType::ScriptLine,
        DocType::Character,
        DocType::Tag,
    ];

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Balloon => "balloon",
            Self::PanelNote => "panel_note",
            Self::ScriptLine => "script_line",
            Self::Character => "character",
            Self::Tag => "tag",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct IndexDocument {
    pub(crate) doc_id: String,
    #[serde(rename = "type")]
    pub(crate) doc_type: DocType,
    pub(crate) path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) page_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) page_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) character_id: Option<String>,
    pub(crate) text: String,
    #[serde(default)]
    pub(crate) tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) struct CrossRef {
    pub(crate) from_id: String,
    pub(crate) to_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Projection {
    pub(crate) docs: Vec<IndexDocument>,
    pub(crate) refs: Vec<CrossRef>,
}

pub(crate) fn balloon_doc_id(id: &str) -> String {
    format!("balloon:{id}")
}

pub(crate) fn panel_doc_id(id: &str) -> String {
    format!("panel:{id}")
}

pub(crate) fn line_doc_id(id: &str) -> String {
    format!("line:{id}")
}

pub(crate) fn character_doc_id(id: &str) -> String {
    format!("character:{id}")
}

pub(crate) fn tag_doc_id(name: &str) -> String {
    format!("tag:{}", name.to_lowercase())
}

/// `@tag` tokens of `text`, lowercased, first occurrence order, no duplicates.
pub(crate) fn extract_tags(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '@' {
            continue;
        }
        let mut tag = String::new();
        while let Some(&(_, next)) = chars.peek() {
            if next.is_alphanumeric() || next == '_' || next == '-' {
                tag.extend(next.to_lowercase());
                chars.next();
            } else {
                break;
            }
        }
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// Space-delimited form stored in the `tags` column so `LIKE '% tag %'` matches whole tags.
pub(crate) fn tags_column(tags: &[String]) -> String {
    if tags.is_empty() {
        String::new()
    } else {
        format!(" {} ", tags.join(" "))
    }
}

struct Row {
    doc: IndexDocument,
    refs: Vec<String>,
}

pub(crate) fn project(document: &ProjectDocument) -> Result<Projection> {
    document.validate()?;

    let page_numbers: HashMap<&str, i64> = document
        .pages()
        .map(|(_, page)| (page.id.as_str(), i64::from(page.number)))
        .collect();
    let known_tags: BTreeSet<String> = document.tags.iter().map(|t| t.name.to_lowercase()).collect();

    let pages: Vec<(&Issue, &Page)> = document.pages().collect();
    let mut rows: Vec<Row> = pages
        .par_iter()
        .map(|(issue, page)| page_rows(document, issue, page))
        .flatten_iter()
        .collect();

    for script in &document.scripts {
        for (n, line) in script.lines.iter().enumerate() {
            let name = line.character_id.as_deref().and_then(|id| document.character_name(id));
            let mut path = vec![format!("Script {}", script.title), format!("Line {}", n + 1)];
            if let Some(number) = line.page_id.as_deref().and_then(|id| page_numbers.get(id)) {
                path.push(format!("Page {number}"));
            }
            if let Some(name) = name {
                path.push(format!("character:{name}"));
            }
            let text = attributed(name, &line.text);
            let mut refs = Vec::new();
            if let Some(id) = &line.character_id {
                refs.push(character_doc_id(id));
            }
            rows.push(Row {
                doc: IndexDocument {
                    doc_id: line_doc_id(&line.id),
                    doc_type: DocType::ScriptLine,
                    path: path.join(" / "),
                    page_id: line.page_id.clone(),
                    page_number: line.page_id.as_deref().and_then(|id| page_numbers.get(id).copied()),
                    character_id: line.character_id.clone(),
                    tags: extract_tags(&text),
                    text,
                },
                refs,
            });
        }
    }

    for character in &document.characters {
        let mut text = vec![character.name.clone()];
        text.extend(character.aliases.iter().cloned());
        text.extend(character.notes.iter().cloned());
        let text = text.join(" ");
        rows.push(Row {
            doc: IndexDocument {
                doc_id: character_doc_id(&character.id),
                doc_type: DocType::Character,
                path: format!("Characters / character:{}", character.name),
                page_id: None,
                page_number: None,
                character_id: Some(character.id.clone()),
                tags: extract_tags(&text),
                text,
            },
            refs: Vec::new(),
        });
    }

    for tag in &document.tags {
        let text = match &tag.description {
            Some(desc) => format!("{} {desc}", tag.name),
            None => tag.name.clone(),
        };
        rows.push(Row {
            doc: IndexDocument {
                doc_id: tag_doc_id(&tag.name),
                doc_type: DocType::Tag,
                path: format!("Tags / @{}", tag.name),
                page_id: None,
                page_number: None,
                character_id: None,
                tags: extract_tags(&text),
                text,
            },
            refs: Vec::new(),
        });
    }

    let mut refs = BTreeSet::new();
    for row in &rows {
        for to_id in &row.refs {
            refs.insert(CrossRef {
                from_id: row.doc.doc_id.clone(),
                to_id: to_id.clone(),
            });
        }
        for tag in &row.doc.tags {
            if known_tags.contains(tag) {
                refs.insert(CrossRef {
                    from_id: row.doc.doc_id.clone(),
                    to_id: tag_doc_id(tag),
                });
            }
        }
    }

    let mut docs: Vec<IndexDocument> = rows.into_iter().map(|row| row.doc).collect();
    docs.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
    if let Some(pair) = docs.windows(2).find(|pair| pair[0].doc_id == pair[1].doc_id) {
        return Err(VaultError::invalid(format!("duplicate index doc id: {}", pair[0].doc_id)));
    }

    Ok(Projection {
        docs,
        refs: refs.into_iter().collect(),
    })
}

fn attributed(name: Option<&str>, text: &str) -> String {
    match name {
        Some(name) => format!("{name}: {text}"),
        None => text.to_string(),
    }
}

fn page_rows(document: &ProjectDocument, issue: &Issue, page: &Page) -> Vec<Row> {
    let mut rows = Vec::new();
    let page_number = i64::from(page.number);
    for (k, panel) in page.panels.iter().enumerate() {
        let mut base = vec![
            format!("Issue {}", issue.number),
            format!("Page {}", page.number),
            format!("Panel {}", k + 1),
        ];
        if let Some(location) = panel.location.as_ref().or(page.location.as_ref()) {
            base.push(format!("location:{location}"));
        }

        if let Some(note) = panel.note.as_ref().filter(|n| !n.trim().is_empty()) {
            let mut path = base.clone();
            path.push("note".to_string());
            rows.push(Row {
                doc: IndexDocument {
                    doc_id: panel_doc_id(&panel.id),
                    doc_type: DocType::PanelNote,
                    path: path.join(" / "),
                    page_id: Some(page.id.clone()),
                    page_number: Some(page_number),
                    character_id: None,
                    tags: extract_tags(note),
                    text: note.clone(),
                },
                refs: Vec::new(),
            });
        }

        for balloon in &panel.balloons {
            let name = balloon.character_id.as_deref().and_then(|id| document.character_name(id));
            let mut path = base.clone();
            if let Some(name) = name {
                path.push(format!("character:{name}"));
            }
            path.push(balloon.id.clone());
            let text = match balloon.kind {
                BalloonKind::Caption | BalloonKind::Sfx => balloon.text(),
                BalloonKind::Speech | BalloonKind::Thought => attributed(name, &balloon.text()),
            };
            let mut refs = balloon.refs.clone();
            if let Some(id) = &balloon.character_id {
                refs.push(character_doc_id(id));
            }
            rows.push(Row {
                doc: IndexDocument {
                    doc_id: balloon_doc_id(&balloon.id),
                    doc_type: DocType::Balloon,
                    path: path.join(" / "),
                    page_id: Some(page.id.clone()),
                    page_number: Some(page_number),
                    character_id: balloon.character_id.clone(),
                    tags: extract_tags(&text),
                    text,
                },
                refs,
            });
        }
    }
    rows
}
