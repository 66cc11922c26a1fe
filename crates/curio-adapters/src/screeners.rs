//! Domain screeners and redaction hooks, resolved by name from a static registry.
//!
//! A screener only does structural parsing: payload bytes in, candidate
//! records out. Accept/pitch policy lives in the screening engine.

use std::sync::LazyLock;

use curio_core::{CurioError, ReasonCode};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{Map, Value};

/// One raw payload file handed to a screener.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub target_id: String,
    /// Path relative to the target's payload directory.
    pub relative_path: String,
    pub bytes: Vec<u8>,
}

impl RawPayload {
    fn extension(&self) -> String {
        self.relative_path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetCandidate {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Candidate fields extracted from a payload, before any policy check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CandidateRecord {
    pub title: Option<String>,
    pub text: Option<String>,
    /// Per-record license as written in the payload, if any.
    pub license: Option<String>,
    pub asset: Option<AssetCandidate>,
    /// `path` or `path#L<n>`; identifies the record in ledgers.
    pub locator: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub locator: String,
    pub code: ReasonCode,
    pub detail: String,
}

pub type ParsedUnit = Result<CandidateRecord, ParseFailure>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookVerdict {
    Clean,
    Redacted { count: usize },
    Flag { code: ReasonCode, detail: String },
}

/// Secret/PII/dual-use inspection applied to every candidate before acceptance.
pub trait RedactionHook: Send + Sync {
    fn name(&self) -> &'static str;

    fn inspect(&self, record: &mut CandidateRecord) -> HookVerdict;
}

pub trait DomainScreener: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this screener can parse the file at `relative_path`.
    fn supports(&self, relative_path: &str) -> bool;

    fn parse(&self, payload: &RawPayload) -> Vec<ParsedUnit>;

    fn redaction_hook(&self) -> Option<&dyn RedactionHook> {
        None
    }
}

const REGISTERED: [&str; 4] = ["text_jsonl", "plain_text", "html_text", "binary_asset"];

pub fn registered_screeners() -> &'static [&'static str] {
    &REGISTERED
}

pub fn screener_for(name: &str) -> Option<Box<dyn DomainScreener>> {
    match name {
        "text_jsonl" => Some(Box::new(TextJsonlScreener)),
        "plain_text" => Some(Box::new(PlainTextScreener {
            hook: EmailRedactionHook,
        })),
        "html_text" => Some(Box::new(HtmlTextScreener {
            hook: EmailRedactionHook,
        })),
        "binary_asset" => Some(Box::new(BinaryAssetScreener)),
        _ => None,
    }
}

fn has_extension(relative_path: &str, allowed: &[&str]) -> bool {
    relative_path
        .rsplit_once('.')
        .is_some_and(|(_, ext)| allowed.iter().any(|a| ext.eq_ignore_ascii_case(a)))
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn decode_utf8(payload: &RawPayload) -> Result<&str, ParseFailure> {
    std::str::from_utf8(&payload.bytes).map_err(|e| ParseFailure {
        locator: payload.relative_path.clone(),
        code: ReasonCode::UnreadablePayload,
        detail: format!("not valid UTF-8: {e}"),
    })
}

/// One record per JSON line (`.jsonl`/`.ndjson`), or per array element in `.json`.
pub struct TextJsonlScreener;

const TEXT_FIELDS: [&str; 3] = ["text", "content", "body"];
const LICENSE_FIELDS: [&str; 2] = ["license", "license_spdx"];

fn string_field(object: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| object.get(*name).and_then(Value::as_str).and_then(text_or_none))
}

impl TextJsonlScreener {
    fn candidate(value: &Value, locator: String) -> ParsedUnit {
        let Some(object) = value.as_object() else {
            return Err(ParseFailure {
                locator,
                code: ReasonCode::ParseError,
                detail: "expected a JSON object".to_string(),
            });
        };
        let Some(text) = string_field(object, &TEXT_FIELDS) else {
            return Err(ParseFailure {
                locator,
                code: ReasonCode::EmptyPayload,
                detail: "no text, content or body field".to_string(),
            });
        };
        Ok(CandidateRecord {
            title: string_field(object, &["title"]),
            text: Some(text),
            license: string_field(object, &LICENSE_FIELDS),
            asset: None,
            locator,
        })
    }
}

impl DomainScreener for TextJsonlScreener {
    fn name(&self) -> &'static str {
        "text_jsonl"
    }

    fn supports(&self, relative_path: &str) -> bool {
        has_extension(relative_path, &["jsonl", "ndjson", "json"])
    }

    fn parse(&self, payload: &RawPayload) -> Vec<ParsedUnit> {
        let text = match decode_utf8(payload) {
            Ok(text) => text,
            Err(failure) => return vec![Err(failure)],
        };

        if payload.extension() == "json" {
            return match serde_json::from_str::<Value>(text) {
                Ok(Value::Array(items)) => items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        Self::candidate(item, format!("{}#{}", payload.relative_path, i))
                    })
                    .collect(),
                Ok(value) => vec![Self::candidate(&value, payload.relative_path.clone())],
                Err(e) => vec![Err(ParseFailure {
                    locator: payload.relative_path.clone(),
                    code: ReasonCode::ParseError,
                    detail: e.to_string(),
                })],
            };
        }

        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                let locator = format!("{}#L{}", payload.relative_path, i + 1);
                match serde_json::from_str::<Value>(line) {
                    Ok(value) => Self::candidate(&value, locator),
                    Err(e) => Err(ParseFailure {
                        locator,
                        code: ReasonCode::ParseError,
                        detail: e.to_string(),
                    }),
                }
            })
            .collect()
    }
}

/// One record per text file; the first non-empty line is the title.
pub struct PlainTextScreener {
    hook: EmailRedactionHook,
}

const MAX_TITLE_CHARS: usize = 200;

impl DomainScreener for PlainTextScreener {
    fn name(&self) -> &'static str {
        "plain_text"
    }

    fn supports(&self, relative_path: &str) -> bool {
        has_extension(relative_path, &["txt", "md", "rst", "tex"])
    }

    fn parse(&self, payload: &RawPayload) -> Vec<ParsedUnit> {
        let text = match decode_utf8(payload) {
            Ok(text) => text,
            Err(failure) => return vec![Err(failure)],
        };
        let Some(body) = text_or_none(text) else {
            return Vec::new();
        };
        let title = body
            .lines()
            .find_map(text_or_none)
            .map(|line| line.trim_start_matches('#').trim().chars().take(MAX_TITLE_CHARS).collect());
        vec![Ok(CandidateRecord {
            title,
            text: Some(body),
            license: None,
            asset: None,
            locator: payload.relative_path.clone(),
        })]
    }

    fn redaction_hook(&self) -> Option<&dyn RedactionHook> {
        Some(&self.hook)
    }
}

/// Title plus visible body text of an HTML page.
pub struct HtmlTextScreener {
    hook: EmailRedactionHook,
}

const INVISIBLE_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, String> {
    let sel = Selector::parse(selector).map_err(|e| e.to_string())?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>())))
}

fn visible_body_text(document: &Html) -> Result<Option<String>, String> {
    let sel = Selector::parse("body").map_err(|e| e.to_string())?;
    let Some(body) = document.select(&sel).next() else {
        return Ok(None);
    };
    let mut chunks = Vec::new();
    for node in body.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| INVISIBLE_ELEMENTS.iter().any(|name| *name == el.name()))
        });
        if !hidden {
            if let Some(chunk) = text_or_none(text) {
                chunks.push(chunk);
            }
        }
    }
    Ok(text_or_none(&chunks.join("\n")))
}

impl DomainScreener for HtmlTextScreener {
    fn name(&self) -> &'static str {
        "html_text"
    }

    fn supports(&self, relative_path: &str) -> bool {
        has_extension(relative_path, &["html", "htm", "xhtml"])
    }

    fn parse(&self, payload: &RawPayload) -> Vec<ParsedUnit> {
        let text = match decode_utf8(payload) {
            Ok(text) => text,
            Err(failure) => return vec![Err(failure)],
        };
        let document = Html::parse_document(text);
        let parsed = select_first_text(&document, "title")
            .and_then(|title| visible_body_text(&document).map(|body| (title, body)));
        match parsed {
            Ok((_, None)) => Vec::new(),
            Ok((title, Some(body))) => vec![Ok(CandidateRecord {
                title,
                text: Some(body),
                license: None,
                asset: None,
                locator: payload.relative_path.clone(),
            })],
            Err(detail) => vec![Err(ParseFailure {
                locator: payload.relative_path.clone(),
                code: ReasonCode::ParseError,
                detail,
            })],
        }
    }

    fn redaction_hook(&self) -> Option<&dyn RedactionHook> {
        Some(&self.hook)
    }
}

/// Every file is one asset record, identified by its raw bytes.
pub struct BinaryAssetScreener;

impl DomainScreener for BinaryAssetScreener {
    fn name(&self) -> &'static str {
        "binary_asset"
    }

    fn supports(&self, _relative_path: &str) -> bool {
        true
    }

    fn parse(&self, payload: &RawPayload) -> Vec<ParsedUnit> {
        if payload.bytes.is_empty() {
            return Vec::new();
        }
        let title = payload
            .relative_path
            .rsplit('/')
            .next()
            .and_then(text_or_none);
        vec![Ok(CandidateRecord {
            title,
            text: None,
            license: None,
            asset: Some(AssetCandidate {
                path: payload.relative_path.clone(),
                bytes: payload.bytes.clone(),
            }),
            locator: payload.relative_path.clone(),
        })]
    }
}

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid regex")
});

/// Replaces e-mail addresses in free text with a placeholder.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailRedactionHook;

impl RedactionHook for EmailRedactionHook {
    fn name(&self) -> &'static str {
        "email_redaction"
    }

    fn inspect(&self, record: &mut CandidateRecord) -> HookVerdict {
        let Some(text) = record.text.as_deref() else {
            return HookVerdict::Clean;
        };
        let count = EMAIL_RE.find_iter(text).count();
        if count == 0 {
            return HookVerdict::Clean;
        }
        record.text = Some(EMAIL_RE.replace_all(text, "[email]").into_owned());
        HookVerdict::Redacted { count }
    }
}

/// Flags any candidate whose title or text matches a configured secret pattern.
#[derive(Debug, Clone)]
pub struct PatternRedactionHook {
    patterns: Vec<Regex>,
}

impl PatternRedactionHook {
    pub fn new(patterns: &[String]) -> Result<Self, CurioError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| CurioError::Config(format!("invalid secret pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl RedactionHook for PatternRedactionHook {
    fn name(&self) -> &'static str {
        "secret_patterns"
    }

    fn inspect(&self, record: &mut CandidateRecord) -> HookVerdict {
        let fields = [record.title.as_deref(), record.text.as_deref()];
        for pattern in &self.patterns {
            if fields.iter().flatten().any(|field| pattern.is_match(field)) {
                return HookVerdict::Flag {
                    code: ReasonCode::SecretMatch,
                    detail: format!("matched secret pattern {}", pattern.as_str()),
                };
            }
        }
        HookVerdict::Clean
    }
}
