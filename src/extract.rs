//! Conclusion extraction from free-text model output.
//!
//! [`extract_conclusion`] is a heuristic cascade: the first rule that yields a
//! substantive span wins. It is deterministic for a given input and content
//! type and never fails; weaker rules take over when stronger ones miss.

use std::sync::LazyLock;

use regex::Regex;

use crate::state_machine::ContentType;

/// Spans at or below this many characters are not considered substantive.
const MIN_CONCLUSION_CHARS: usize = 10;
/// Quoted spans must be at least this long to stand in for an answer.
const MIN_QUOTE_CHARS: usize = 20;
/// Size of the last-resort tail.
const TAIL_CHARS: usize = 200;

pub(crate) fn re(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid built-in pattern {pattern}: {e}"))
}

static FINAL_BLOCK: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        re(r"(?is)\*\*'?final conclusion'?\*\*:?\s*(.*?)(?:\n\n\*\*'?verification'?\*\*|\*\*'?verification'?\*\*|\z)"),
        re(r"(?is)\*\*'?final conclusion'?\*\*:?\s*(.*?)(?:\n\n\*\*|\z)"),
    ]
});

static TRANSCRIPTION_INTRO: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?is)^the transcribed text.*?(?:is|are).*?(?:as )?follows?:\s*(.*)")
});

static BOLD: LazyLock<Regex> = LazyLock::new(|| re(r"\*\*([^*]+)\*\*"));
static ITALIC: LazyLock<Regex> = LazyLock::new(|| re(r"\*([^*]+)\*"));

static OCR_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        re(r"(?is)(?:final transcription|transcription|transcribed text|extracted text):\s*(.*?)(?:\n\n|\z)"),
        re(r"(?is)the text (?:in the image )?(?:reads?|says?):\s*(.*?)(?:\n\n|\z)"),
        re(r"(?is)(?:handwritten text|visible text|text content):\s*(.*?)(?:\n\n|\z)"),
    ]
});

static MEDICAL_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        re(r"(?is)(?:final diagnosis:?|diagnosis:|findings?:|conclusion:)\s*(.*?)(?:\n\n|\z)"),
        re(r"(?is)(?:the patient.*?has|consistent with|diagnosis.*?is)\s+(.*?)(?:\.|\z)"),
        re(r"(?is)\b(?:therefore|thus|in conclusion),?\s*(.*?)(?:\n\n|\z)"),
    ]
});

static GENERAL_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        re(r"(?is)(?:final conclusion|in conclusion|therefore|thus|to conclude|in summary):\s*(.*?)(?:\n\n|\z)"),
        re(r"(?is)(?:the answer is|my answer is|i conclude that):?\s*(.*?)(?:\n\n|\z)"),
        re(r"(?is)\b(?:so|therefore|thus),?\s+(.+?)(?:\.|\z)"),
    ]
});

static QUOTED: LazyLock<Regex> = LazyLock::new(|| re(r#""([^"]+)""#));

static REASONING_META: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(?:inner thinking|verification|let me|okay|now|wait|hmm|alright|putting it all together)\b")
});

/// Pull the most answer-like span out of `text`.
///
/// Returns an empty string only for blank input.
pub fn extract_conclusion(text: &str, content_type: ContentType) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }

    if let Some(found) = final_conclusion_block(text, content_type) {
        return found;
    }

    if content_type == ContentType::Ocr {
        if let Some(found) = first_capture(OCR_PATTERNS.iter(), text) {
            return found;
        }
        if let Some(quote) = longest_quote(text) {
            return quote;
        }
    }

    if content_type == ContentType::Medical {
        if let Some(found) = first_capture(MEDICAL_PATTERNS.iter(), text) {
            return found;
        }
    }

    if let Some(found) = first_capture(GENERAL_PATTERNS.iter(), text) {
        return found;
    }

    if let Some(quote) = longest_quote(text) {
        return quote;
    }

    if let Some(paragraph) = longest_plain_paragraph(text) {
        return paragraph;
    }

    tail(text, TAIL_CHARS).trim().to_string()
}

fn final_conclusion_block(text: &str, content_type: ContentType) -> Option<String> {
    if !text.contains("**Final Conclusion**") && !text.contains("**'Final Conclusion'**") {
        return None;
    }

    for pattern in FINAL_BLOCK.iter() {
        let Some(caps) = pattern.captures(text) else {
            continue;
        };
        let block = caps.get(1).map_or("", |m| m.as_str()).trim();

        if content_type == ContentType::Ocr {
            if let Some(intro) = TRANSCRIPTION_INTRO.captures(block) {
                let body = intro.get(1).map_or("", |m| m.as_str()).trim();
                if !body.is_empty() {
                    return Some(body.to_string());
                }
            }
        }

        let cleaned = strip_emphasis(block);
        if cleaned.chars().count() > MIN_CONCLUSION_CHARS {
            return Some(cleaned);
        }
    }
    None
}

/// Removes `**bold**` and `*italic*` markers, keeping the inner text.
pub fn strip_emphasis(text: &str) -> String {
    let unbolded = BOLD.replace_all(text, "$1");
    ITALIC.replace_all(&unbolded, "$1").trim().to_string()
}

fn first_capture<'a>(patterns: impl Iterator<Item = &'a Regex>, text: &str) -> Option<String> {
    patterns
        .filter_map(|p| p.captures(text))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .find(|s| s.chars().count() > MIN_CONCLUSION_CHARS)
}

fn longest_quote(text: &str) -> Option<String> {
    let longest = QUOTED
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .fold(None::<&str>, |best, q| match best {
            Some(b) if b.chars().count() >= q.chars().count() => Some(b),
            _ => Some(q),
        })?;
    (longest.chars().count() >= MIN_QUOTE_CHARS).then(|| longest.to_string())
}

fn longest_plain_paragraph(text: &str) -> Option<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty() && !REASONING_META.is_match(p))
        .fold(None::<&str>, |best, p| match best {
            Some(b) if b.chars().count() >= p.chars().count() => Some(b),
            _ => Some(p),
        })
        .map(str::to_string)
}

fn tail(text: &str, chars: usize) -> &str {
    let count = text.chars().count();
    if count <= chars {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - chars)
        .map_or(0, |(idx, _)| idx);
    &text[start..]
}
