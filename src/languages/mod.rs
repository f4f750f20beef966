//! Language names as the engine reports them, and their short codes.

/// Engine language name and its ISO 639-1 code
pub const LANGUAGES: &[(&str, &str)] = &[
    ("Afrikaans", "af"),
    ("Arabic", "ar"),
    ("Azerbaijani", "az"),
    ("Bulgarian", "bg"),
    ("Catalan", "ca"),
    ("Chinese", "zh"),
    ("Croatian", "hr"),
    ("Czech", "cs"),
    ("Danish", "da"),
    ("Dutch", "nl"),
    ("English", "en"),
    ("Estonian", "et"),
    ("Finnish", "fi"),
    ("French", "fr"),
    ("German", "de"),
    ("Greek", "el"),
    ("Hebrew", "he"),
    ("Hindi", "hi"),
    ("Hungarian", "hu"),
    ("Indonesian", "id"),
    ("Irish", "ga"),
    ("Italian", "it"),
    ("Japanese", "ja"),
    ("Korean", "ko"),
    ("Latvian", "lv"),
    ("Lithuanian", "lt"),
    ("Malay", "ms"),
    ("Norwegian", "no"),
    ("Persian", "fa"),
    ("Polish", "pl"),
    ("Portuguese", "pt"),
    ("Romanian", "ro"),
    ("Russian", "ru"),
    ("Serbian", "sr"),
    ("Slovak", "sk"),
    ("Slovenian", "sl"),
    ("Spanish", "es"),
    ("Swedish", "sv"),
    ("Tagalog", "tl"),
    ("Thai", "th"),
    ("Turkish", "tr"),
    ("Ukrainian", "uk"),
    ("Urdu", "ur"),
    ("Vietnamese", "vi"),
];

/// Default translation targets
pub const LANGUAGES_TO_TRANSCRIBE: &[&str] = &[
    "English", "French", "German", "Spanish", "Russian", "Japanese", "Chinese", "Portuguese",
    "Italian", "Arabic", "Hindi", "Turkish",
];

/// Resolve a name or code to the canonical entry, ignoring case
fn lookup(language: &str) -> Option<&'static (&'static str, &'static str)> {
    let language = language.trim();
    LANGUAGES.iter().find(|(name, code)| {
        name.eq_ignore_ascii_case(language) || code.eq_ignore_ascii_case(language)
    })
}

/// Short code for a language name, e.g. `French` -> `fr`
pub fn code_for(language: &str) -> Option<&'static str> {
    lookup(language).map(|(_, code)| *code)
}

/// Canonical capitalised name, e.g. `french` or `fr` -> `French`
pub fn canonical_name(language: &str) -> Option<&'static str> {
    lookup(language).map(|(name, _)| *name)
}

/// Default targets minus the source language
pub fn default_targets_for(source: &str) -> Vec<String> {
    let source = canonical_name(source).unwrap_or(source);
    LANGUAGES_TO_TRANSCRIBE
        .iter()
        .filter(|target| !target.eq_ignore_ascii_case(source))
        .map(|target| target.to_string())
        .collect()
}
