//! Keyword and sentence heuristics for pulling death facts out of prose.
//!
//! Deliberately generic: every scraping provider funnels its article text
//! through [`extract_details`], so per-site code only has to find the text.

use epitaph_core::models::{DeathDetails, Subject};

const DEATH_KEYWORDS: &[&str] = &[
    " died",
    " dies ",
    " death",
    "passed away",
    " killed",
    "succumbed",
    "was found dead",
];

/// Phrases that introduce a cause, longest first so "died of complications
/// from" wins over "died of".
const CAUSE_MARKERS: &[&str] = &[
    "died of complications from ",
    "died of complications of ",
    "died from complications of ",
    "cause of death was ",
    "cause of death was listed as ",
    "death was caused by ",
    "death was attributed to ",
    "after a battle with ",
    "after a long battle with ",
    "complications of ",
    "complications from ",
    "succumbed to ",
    "died of ",
    "died from ",
];

/// Words that end a cause phrase.
const CAUSE_TERMINATORS: &[&str] = &[
    " at ", " on ", " in ", " while ", " after ", " according ", " his ", " her ", " their ",
    " said ", " surrounded ", " aged ", " age ",
];

/// Checked in order; only applied to sentences already about a death.
const LOCATION_MARKERS: &[&str] = &[
    "at his home in ",
    "at her home in ",
    "at their home in ",
    "at home in ",
    "at a hospital in ",
    "in a hospital in ",
    "in hospital in ",
    "died in ",
];

const FACTOR_KEYWORDS: &[(&str, &str)] = &[
    ("suicide", "suicide"),
    ("took his own life", "suicide"),
    ("took her own life", "suicide"),
    ("overdose", "overdose"),
    ("car crash", "accident"),
    ("car accident", "accident"),
    ("plane crash", "accident"),
    ("accident", "accident"),
    ("murdered", "homicide"),
    ("homicide", "homicide"),
    ("shot and killed", "homicide"),
    ("covid", "covid-19"),
    ("cancer", "cancer"),
    ("alzheimer", "dementia"),
    ("dementia", "dementia"),
    ("heart attack", "cardiac"),
    ("cardiac", "cardiac"),
    ("autopsy", "autopsy"),
];

/// Split prose into sentences on terminal punctuation.
pub fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = text.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        current.push(if c == '\n' { ' ' } else { c });
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.get(i + 1).is_none_or(|n| n.is_whitespace());
        if at_boundary || c == '\n' && chars.get(i + 1) == Some(&'\n') {
            push_sentence(&mut out, &current);
            current.clear();
        }
    }
    push_sentence(&mut out, &current);
    out
}

fn push_sentence(out: &mut Vec<String>, raw: &str) {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c: char| c == '*' || c == '#' || c.is_whitespace());
    if trimmed.chars().any(char::is_alphanumeric) {
        out.push(trimmed.to_string());
    }
}

/// Sentences about a death, preferring those naming the subject.
pub fn death_sentences(text: &str, surname: &str) -> Vec<String> {
    let surname = surname.to_lowercase();
    let mut matches: Vec<(bool, String)> = sentences(text)
        .into_iter()
        .filter_map(|s| {
            let lower = format!(" {}", s.to_lowercase());
            DEATH_KEYWORDS
                .iter()
                .any(|k| lower.contains(k))
                .then(|| (lower.contains(&surname), s))
        })
        .collect();
    // Stable: sentences naming the subject first, document order otherwise.
    matches.sort_by_key(|(names_subject, _)| !names_subject);
    matches.into_iter().map(|(_, s)| s).collect()
}

/// The cause named in a sentence, if any.
pub fn extract_cause(sentence: &str) -> Option<String> {
    let lower = sentence.to_lowercase();
    let (pos, marker) = CAUSE_MARKERS
        .iter()
        .filter_map(|m| lower.find(m).map(|p| (p, *m)))
        .min_by_key(|(p, m)| (*p, std::cmp::Reverse(m.len())))?;
    let start = pos + marker.len();
    let rest = &lower[start..];
    let end = CAUSE_TERMINATORS
        .iter()
        .filter_map(|t| rest.find(t))
        .chain(rest.find(['.', ',', ';', '(']))
        .min()
        .unwrap_or(rest.len());
    let cause = rest[..end]
        .trim()
        .trim_start_matches("a ")
        .trim_start_matches("an ")
        .trim();
    let words = cause.split_whitespace().count();
    (words > 0 && words <= 8).then(|| cause.to_string())
}

/// A place named after "died in"-style phrases, kept as written.
pub fn extract_location(sentence: &str) -> Option<String> {
    let lower = sentence.to_lowercase();
    let (pos, marker) = LOCATION_MARKERS
        .iter()
        .find_map(|m| lower.find(m).map(|p| (p, *m)))?;
    // Lowercasing can shift byte offsets for non-ASCII text.
    let rest = sentence.get(pos + marker.len()..)?;

    let mut words: Vec<&str> = Vec::new();
    let mut seen_comma = false;
    for word in rest.split_whitespace() {
        let bare = word.trim_end_matches(['.', ';', ')', ',']);
        if !bare.chars().next().is_some_and(char::is_uppercase) {
            break;
        }
        words.push(word.trim_end_matches(['.', ';', ')']));
        if word.ends_with(['.', ';', ')']) || words.len() >= 5 {
            break;
        }
        // "Los Angeles, California" keeps one chunk after the comma.
        if word.ends_with(',') {
            if seen_comma {
                break;
            }
            seen_comma = true;
        }
    }
    let place = words.join(" ");
    let place = place.trim_end_matches(',');
    (!place.is_empty()).then(|| place.to_string())
}

/// Normalized tags for notable factors mentioned in the text.
pub fn notable_factors(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut tags: Vec<String> = Vec::new();
    for (needle, tag) in FACTOR_KEYWORDS {
        if lower.contains(needle) && !tags.iter().any(|t| t == tag) {
            tags.push((*tag).to_string());
        }
    }
    tags
}

/// Best-effort death details from article text about `subject`.
pub fn extract_details(subject: &Subject, text: &str) -> DeathDetails {
    let relevant = death_sentences(text, subject.surname());
    if relevant.is_empty() {
        return DeathDetails::default();
    }

    let cause_of_death = relevant.iter().find_map(|s| extract_cause(s));
    let location_of_death = relevant.iter().find_map(|s| extract_location(s));
    let circumstances = relevant
        .iter()
        .take(2)
        .cloned()
        .collect::<Vec<_>>()
        .join(" ");
    let joined = relevant.join(" ");

    DeathDetails {
        cause_of_death,
        circumstances: Some(circumstances),
        location_of_death,
        notable_factors: notable_factors(&joined),
        ..Default::default()
    }
}

/// True if the text plausibly concerns this subject's death.
pub fn mentions_subject(subject: &Subject, text: &str) -> bool {
    let lower = text.to_lowercase();
    if !lower.contains(&subject.surname().to_lowercase()) {
        return false;
    }
    match subject.death_year() {
        Some(year) => lower.contains(&year.to_string()),
        None => true,
    }
}
