//! Grammars for model output.
//!
//! Actions are written as `<action|object|param1,param2>`. Conversation lines
//! are written as `Speaker@[mood]<action|object|params>@<words>@`. Both
//! grammars accept full-width `｜` and `，` inside action tags.

use std::sync::LazyLock;

use regex::Regex;

use crate::sys::{Action, Line};

static ACTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([^<>|]*)\|([^<>|]*)(?:\|([^<>]*))?>").expect("valid regex")
});
static MOOD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@\[([^\[\]]*)\]").expect("valid regex"));
static ACTION_SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^<>]*)>@<").expect("valid regex"));
static DIALOGUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)>@<(.*?)>@").expect("valid regex"));

/// Folds full-width pipe and comma into their ASCII forms.
pub fn normalize_punctuation(text: &str) -> String {
    text.replace('｜', "|").replace('，', ",")
}

/// Extracts the first action tag in `text`. No tag yields the empty sentinel.
pub fn parse_action(text: &str) -> Action {
    let text = normalize_punctuation(text);
    let Some(caps) = ACTION_RE.captures(&text) else {
        return Action::default();
    };

    let parameters = match caps.get(3) {
        Some(params) => params
            .as_str()
            .split(',')
            .map(|p| p.trim().to_string())
            .collect(),
        None => vec![],
    };

    Action {
        action: caps[1].trim().to_string(),
        object: caps[2].trim().to_string(),
        parameters,
    }
}

/// The three independently optional regions of a conversation line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LineParts {
    pub mood: String,
    pub action: String,
    pub dialogue: String,
}

pub fn parse_line_parts(text: &str) -> LineParts {
    let capture = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default()
    };

    LineParts {
        mood: capture(&MOOD_RE),
        action: capture(&ACTION_SEGMENT_RE),
        dialogue: capture(&DIALOGUE_RE),
    }
}

/// One conversation line, or `None` when there is no speaker or nothing said.
pub fn parse_line(row: &str) -> Option<Line> {
    let (speaker, _) = row.split_once('@')?;
    let speaker = speaker
        .trim()
        .trim_start_matches(|c: char| c == '-' || c == '*' || c.is_ascii_digit() || c == '.')
        .trim();
    if speaker.is_empty() {
        return None;
    }

    let parts = parse_line_parts(row);
    if parts.dialogue.is_empty() {
        return None;
    }

    let action = if parts.action.is_empty() {
        None
    } else {
        Some(parse_action(&format!("<{}>", parts.action))).filter(|a| !a.is_empty())
    };

    Some(Line {
        speaker: speaker.to_string(),
        mood: parts.mood,
        utterance: parts.dialogue,
        action,
    })
}

pub fn parse_lines(text: &str) -> Vec<Line> {
    text.lines().filter_map(parse_line).collect()
}
