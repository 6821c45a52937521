//! Word normalization
//!
//! Maps raw submissions to the comparison key used to merge equivalent words:
//! "Canción", "cancion" and " CANCION " all land on the same tally entry.

use crate::error::RoomError;
use crate::types::MAX_WORD_LENGTH;

/// Letters that change meaning when stripped and are never folded.
pub const RESERVED_LETTERS: &[char] = &['ñ'];

/// Collapse every whitespace run to one space and trim both ends
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fold a lowercase letter with diacritics to its base letter.
/// Reserved letters fall through unchanged.
fn fold_diacritic(c: char) -> char {
    match c {
        'á' | 'à' | 'ä' | 'â' | 'ā' | 'ã' | 'å' | 'ą' => 'a',
        'é' | 'è' | 'ë' | 'ê' | 'ē' | 'ė' | 'ę' => 'e',
        'í' | 'ì' | 'ï' | 'î' | 'ī' | 'į' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' | 'ō' | 'õ' | 'ø' | 'ő' => 'o',
        'ú' | 'ù' | 'ü' | 'û' | 'ū' | 'ů' | 'ű' | 'ų' => 'u',
        'ń' | 'ň' | 'ņ' => 'n',
        'ç' | 'ć' | 'č' | 'ĉ' | 'ċ' => 'c',
        'ř' | 'ŕ' => 'r',
        'š' | 'ś' | 'ŝ' | 'ş' => 's',
        'ť' | 'ţ' => 't',
        'ý' | 'ÿ' => 'y',
        'ž' | 'ź' | 'ż' => 'z',
        'ď' | 'đ' => 'd',
        'ğ' | 'ĝ' | 'ġ' | 'ģ' => 'g',
        'ĥ' | 'ħ' => 'h',
        'ĵ' => 'j',
        'ķ' | 'ĸ' => 'k',
        'ĺ' | 'ļ' | 'ľ' | 'ŀ' | 'ł' => 'l',
        'ŵ' => 'w',
        _ => c,
    }
}

fn is_key_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | ' ')
}

fn is_invisible(c: char) -> bool {
    c.is_control() || matches!(c, '\u{200B}'..='\u{200D}' | '\u{FEFF}')
}

/// Normalize a raw word into its comparison key.
///
/// Pure and idempotent: `normalize_word(&normalize_word(s)) == normalize_word(s)`.
/// Whitespace is collapsed again at the end because dropping symbols can
/// leave adjacent spaces behind ("a ! b").
pub fn normalize_word(raw: &str) -> String {
    let folded: String = collapse_whitespace(raw)
        .to_lowercase()
        .chars()
        .map(fold_diacritic)
        .filter(|c| is_key_char(*c))
        .filter(|c| !is_invisible(*c))
        .collect();

    collapse_whitespace(&folded)
}

/// A key is usable when it still holds at least one letter or digit
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.chars().any(char::is_alphanumeric)
}

fn is_allowed_raw_char(c: char) -> bool {
    c.is_alphabetic() || c.is_ascii_digit() || c.is_whitespace() || matches!(c, '-' | '_' | '.')
}

/// Validate raw input before normalization, returning the trimmed word
pub fn validate_word(raw: &str) -> Result<&str, RoomError> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return Err(RoomError::InvalidWord("Word cannot be empty".to_string()));
    }

    if trimmed.chars().count() > MAX_WORD_LENGTH {
        return Err(RoomError::InvalidWord(format!(
            "Word cannot be longer than {} characters",
            MAX_WORD_LENGTH
        )));
    }

    if !trimmed.chars().all(is_allowed_raw_char) {
        return Err(RoomError::InvalidWord(
            "Word contains characters that are not allowed".to_string(),
        ));
    }

    Ok(trimmed)
}
