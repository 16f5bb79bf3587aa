//! Keyword extraction for the lexical index.
//!
//! Latin-script text is split into lower-cased words (stop words and
//! single letters dropped). Runs of CJK characters have no word boundaries,
//! so they are indexed as overlapping bigrams; a lone CJK character is kept
//! as a unigram.

use std::collections::HashMap;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "how", "in", "is",
    "it", "of", "on", "or", "that", "the", "this", "to", "was", "what", "when", "where", "which",
    "who", "why", "with",
];

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{3040}'..='\u{30FF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{4E00}'..='\u{9FFF}'
        | '\u{AC00}'..='\u{D7AF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{20000}'..='\u{2A6DF}'
    )
}

/// Split text into index terms, in order of appearance (duplicates kept).
pub fn tokenize(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut word = String::new();
    let mut run: Vec<char> = Vec::new();

    let flush_word = |word: &mut String, terms: &mut Vec<String>| {
        if !word.is_empty() {
            let w = std::mem::take(word);
            let keep = if w.chars().all(|c| c.is_ascii_digit()) {
                true
            } else {
                w.chars().count() > 1 && !STOP_WORDS.contains(&w.as_str())
            };
            if keep {
                terms.push(w);
            }
        }
    };
    let flush_run = |run: &mut Vec<char>, terms: &mut Vec<String>| {
        match run.len() {
            0 => {}
            1 => terms.push(run[0].to_string()),
            _ => {
                for pair in run.windows(2) {
                    terms.push(pair.iter().collect());
                }
            }
        }
        run.clear();
    };

    for ch in text.chars() {
        if is_cjk(ch) {
            flush_word(&mut word, &mut terms);
            run.push(ch);
        } else if ch.is_alphanumeric() {
            flush_run(&mut run, &mut terms);
            word.extend(ch.to_lowercase());
        } else {
            flush_word(&mut word, &mut terms);
            flush_run(&mut run, &mut terms);
        }
    }
    flush_word(&mut word, &mut terms);
    flush_run(&mut run, &mut terms);

    terms
}

/// Term counts for a text.
pub fn term_frequencies(text: &str) -> HashMap<String, usize> {
    let mut tf = HashMap::new();
    for term in tokenize(text) {
        *tf.entry(term).or_insert(0) += 1;
    }
    tf
}

/// The `max` most frequent terms, ties broken by first appearance.
pub fn extract_keywords(text: &str, max: usize) -> Vec<String> {
    let terms = tokenize(text);
    let mut first_seen: HashMap<&str, usize> = HashMap::new();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (i, t) in terms.iter().enumerate() {
        first_seen.entry(t.as_str()).or_insert(i);
        *counts.entry(t.as_str()).or_insert(0) += 1;
    }

    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(first_seen[a.0].cmp(&first_seen[b.0])));
    ranked
        .into_iter()
        .take(max)
        .map(|(t, _)| t.to_string())
        .collect()
}
