//! Tokenization and snippet extraction.
//!
//! Tokenization is simple and deterministic:
//! - Split on non-alphanumeric characters (including `_` and `.`), Unicode-aware.
//! - Split camelCase/PascalCase boundaries (FreightCo → freight + co).
//! - Lowercase everything.
//! - Ignore very short tokens and common stopwords.
//! - Han, kana and Hangul runs have no word breaks; they become overlapping
//!   character bigrams (東京物流 → 東京 + 京物 + 物流).

use std::ops::Range;

const MIN_TOKEN_LEN: usize = 2;
const MAX_TOKEN_LEN: usize = 64;
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "as", "at", "by", "for", "in", "is", "of", "on", "or", "the", "to", "with",
];

/// A token and its byte range in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub span: Range<usize>,
}

pub fn tokenize(text: &str) -> Vec<String> {
    tokenize_with_spans(text)
        .into_iter()
        .map(|t| t.text)
        .collect()
}

/// Scripts written without spaces between words.
fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3040..=0x30FF     // hiragana, katakana
            | 0x3400..=0x4DBF // CJK extension A
            | 0x4E00..=0x9FFF // CJK unified ideographs
            | 0xAC00..=0xD7AF // Hangul syllables
            | 0xF900..=0xFAFF // CJK compatibility ideographs
            | 0xFF66..=0xFF9F // halfwidth katakana
    )
}

#[derive(Default)]
struct Word {
    text: String,
    chars: usize,
    start: usize,
}

pub fn tokenize_with_spans(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = Word::default();
    let mut run: Vec<(usize, char)> = Vec::new();
    let mut prev_was_lower = false;

    for (i, c) in text.char_indices() {
        if is_cjk(c) {
            push_word(&mut tokens, &mut word, i);
            run.push((i, c));
            prev_was_lower = false;
            continue;
        }
        push_run(&mut tokens, &mut run);

        if c.is_alphanumeric() {
            // "freightCo" -> "freight" "co"
            if c.is_uppercase() && prev_was_lower {
                push_word(&mut tokens, &mut word, i);
            }
            if word.chars == 0 {
                word.start = i;
            }
            if word.chars < MAX_TOKEN_LEN {
                word.text.extend(c.to_lowercase());
                word.chars += 1;
            }
            prev_was_lower = c.is_lowercase();
            continue;
        }

        push_word(&mut tokens, &mut word, i);
        prev_was_lower = false;
    }

    push_word(&mut tokens, &mut word, text.len());
    push_run(&mut tokens, &mut run);
    tokens
}

fn push_word(tokens: &mut Vec<Token>, word: &mut Word, end: usize) {
    if word.chars == 0 {
        return;
    }
    let w = std::mem::take(word);
    if w.chars >= MIN_TOKEN_LEN && !STOPWORDS.contains(&w.text.as_str()) {
        tokens.push(Token {
            text: w.text,
            span: w.start..end,
        });
    }
}

fn push_run(tokens: &mut Vec<Token>, run: &mut Vec<(usize, char)>) {
    match run.as_slice() {
        [] => {}
        [(i, c)] => tokens.push(Token {
            text: c.to_string(),
            span: *i..*i + c.len_utf8(),
        }),
        chars => {
            for pair in chars.windows(2) {
                let (start, a) = pair[0];
                let (at, b) = pair[1];
                tokens.push(Token {
                    text: [a, b].iter().collect(),
                    span: start..at + b.len_utf8(),
                });
            }
        }
    }
    run.clear();
}

/// Roughly `width` bytes of `text` centred on `focus`, on char boundaries,
/// whitespace-collapsed, with `...` marking cut ends.
pub fn snippet(text: &str, focus: Range<usize>, width: usize) -> String {
    let half = width / 2;
    let mut start = focus.start.saturating_sub(half);
    let mut end = (focus.end + half).min(text.len());
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }

    let body = text[start..end]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut out = String::with_capacity(body.len() + 6);
    if start > 0 {
        out.push_str("...");
    }
    out.push_str(&body);
    if end < text.len() {
        out.push_str("...");
    }
    out
}
