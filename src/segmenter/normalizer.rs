use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

pub const TITLE_MARKER: &str = "Title: ";
const BEGIN_TOKEN: &str = "I";
const END_TOKEN: &str = "FIM";

/// Removed in this order. `--` goes before single hyphens are turned into spaces.
const STRIPPED: [&str; 28] = [
    "\"", "!", "@", "#", "$", "%", "&", "*", "(", ")", "--", "_", "=", "+", "[", "{", "]", "}",
    ",", "<", ".", ">", ";", ":", "/", "?", "|", "'",
];

static NON_ASCII: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\x00-\x7F]").expect("static regex is valid"));

/// Normalizes one line of text into space-separated lowercase ASCII words.
///
/// Accented letters keep their base letter (`é` -> `e`); any other non-ASCII
/// character disappears.
pub fn normalize_line(line: &str) -> String {
    let mut text = line.trim().to_lowercase();

    text = text.replace("d'e", "de e").replace("d'a", "de a");

    let decomposed: String = text.nfd().collect();
    text = NON_ASCII.replace_all(&decomposed, "").into_owned();

    for symbol in STRIPPED {
        text = text.replace(symbol, "");
    }

    text.replace('-', " ")
}

/// Returns the title text if the line carries a `Title: ` marker.
pub fn extract_title(line: &str) -> Option<String> {
    if line.contains(TITLE_MARKER) {
        Some(line.replacen(TITLE_MARKER, "", 1))
    } else {
        None
    }
}

/// A beginning marker is a line of at most two words, one of which is `I`
/// (e.g. `I`, `CAPÍTULO I`).
pub fn is_begin_marker(line: &str) -> bool {
    let upper = line.trim().to_uppercase();
    let words: Vec<&str> = upper.split(' ').collect();

    words.len() <= 2 && words.contains(&BEGIN_TOKEN)
}

/// An end marker is a line consisting of the single word `FIM`.
pub fn is_end_marker(line: &str) -> bool {
    let upper = line.trim().to_uppercase();
    let words: Vec<&str> = upper.split(' ').collect();

    words.len() <= 1 && words.contains(&END_TOKEN)
}
