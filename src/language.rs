//! Answer-language selection for the two supported languages.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Ar,
    #[default]
    En,
}

impl Lang {
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        match raw.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
            Some("ar") => Some(Lang::Ar),
            Some("en") => Some(Lang::En),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Lang::Ar => "ar",
            Lang::En => "en",
        }
    }

    /// The user turn appended by the continuation loop.
    pub fn continuation_prompt(&self) -> &'static str {
        match self {
            Lang::Ar => {
                "أكمل من النقطة التي توقفت عندها تمامًا، بنفس اللغة ونفس البنية، دون تكرار أو تلخيص."
            }
            Lang::En => {
                "Continue from exactly where you stopped, in the same language and structure, with no repetition or summary."
            }
        }
    }
}

fn is_arabic_script(c: char) -> bool {
    matches!(c as u32,
        0x0600..=0x06FF | 0x0750..=0x077F | 0x08A0..=0x08FF | 0xFB50..=0xFDFF | 0xFE70..=0xFEFF)
}

/// Picks Arabic when Arabic-script letters make up at least 30% of the letters seen.
pub fn detect(text: &str) -> Lang {
    let mut arabic = 0usize;
    let mut letters = 0usize;
    for c in text.chars() {
        if is_arabic_script(c) {
            arabic += 1;
            letters += 1;
        } else if c.is_alphabetic() {
            letters += 1;
        }
    }
    if letters > 0 && arabic * 10 >= letters * 3 {
        Lang::Ar
    } else {
        Lang::En
    }
}

/// `force_lang` wins over detection.
pub fn resolve(forced: Option<Lang>, user_text: &str) -> Lang {
    match forced {
        Some(lang) => lang,
        None => detect(user_text),
    }
}
