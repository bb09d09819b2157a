use std::sync::OnceLock;

use regex::Regex;

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

re!(re_hash_number, r"^#\d+$");
re!(re_reference_code, r"^[A-Z0-9]{6,}$");
re!(re_date_fragment, r"^\d{1,2}/\d{1,2}(?:/\d{2,4})?$");

/// Card-processor and channel prefixes. Longer entries first so that
/// "DEBIT CARD PURCHASE " wins over "PURCHASE ".
const PREFIXES: &[&str] = &[
    "DEBIT CARD PURCHASE ",
    "RECURRING PAYMENT ",
    "RECURRING ",
    "CHECKCARD ",
    "PURCHASE ",
    "PAYPAL *",
    "POS ",
    "ACH ",
    "TST* ",
    "SQ *",
    "PP*",
];

/// Transfer-mechanism suffixes.
const SUFFIXES: &[&str] = &[
    "ONLINE PMT",
    "DIRECT DEP",
    "WEB PMT",
    "DIR DEP",
    "PAYROLL",
    "ACH",
    "PPD",
];

const MAX_WORDS: usize = 3;

/// Reduces a raw bank description to a short canonical merchant token,
/// e.g. `"POS STARBUCKS STORE 1234 01/15"` becomes `"STARBUCKS STORE 1234"`.
///
/// Returns an empty string when nothing meaningful is left; callers treat
/// that as "no rule applies".
pub fn extract_pattern(description: &str) -> String {
    let upper = description.to_uppercase();
    let mut text = upper.split_whitespace().collect::<Vec<_>>().join(" ");

    loop {
        let Some(rest) = PREFIXES.iter().find_map(|p| text.strip_prefix(p)) else {
            break;
        };
        text = rest.trim_start().to_string();
    }

    let mut words: Vec<&str> = text.split(' ').filter(|w| !w.is_empty()).collect();
    loop {
        let before = words.len();
        strip_suffix_phrase(&mut words);
        while let Some(last) = words.last() {
            if is_trailing_noise(last) {
                words.pop();
            } else {
                break;
            }
        }
        if words.len() == before {
            break;
        }
    }

    words.truncate(MAX_WORDS);
    words.join(" ")
}

fn strip_suffix_phrase(words: &mut Vec<&str>) {
    for suffix in SUFFIXES {
        let parts: Vec<&str> = suffix.split(' ').collect();
        if words.len() >= parts.len() && words[words.len() - parts.len()..] == parts[..] {
            words.truncate(words.len() - parts.len());
            return;
        }
    }
}

fn is_trailing_noise(word: &str) -> bool {
    if !word.chars().any(char::is_alphanumeric) {
        return true;
    }
    if re_hash_number().is_match(word) || re_date_fragment().is_match(word) {
        return true;
    }
    re_reference_code().is_match(word) && word.chars().any(|c| c.is_ascii_digit())
}
