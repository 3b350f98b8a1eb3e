//! Reassembles streamed transcription fragments into whole turns.

use crate::generic_types::Role;

/// Languages written in Latin script, by code and by name.
const LATIN_SCRIPT_LANGUAGES: &[&str] = &[
    "en", "english", "es", "spanish", "fr", "french", "de", "german", "it", "italian", "pt",
    "portuguese", "nl", "dutch", "sv", "swedish", "da", "danish", "no", "norwegian", "fi",
    "finnish", "pl", "polish", "cs", "czech", "ro", "romanian", "tr", "turkish", "id",
    "indonesian", "ms", "malay", "vi", "vietnamese", "sw", "swahili", "tl", "tagalog",
];

/// Suffixes that end an English contraction (`that's`, `don't`, `we're`...).
const CONTRACTION_SUFFIXES: &[&str] = &["s", "t", "re", "ve", "ll", "d", "m"];

/// Lifecycle of the turn currently being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Empty,
    Accumulating,
    Finalized,
}

#[derive(Debug, Default)]
struct RoleBuffer {
    fragments: Vec<String>,
    /// Whether the raw fragment at the same position began with whitespace.
    word_starts: Vec<bool>,
    joined: String,
    last_sent: Option<String>,
}

impl RoleBuffer {
    fn push(&mut self, fragment: &str, starts_word: bool) -> Option<String> {
        self.fragments.push(fragment.to_string());
        self.word_starts.push(starts_word);
        self.joined = self.fragments.join(" ");
        if self.last_sent.as_deref() == Some(self.joined.as_str()) {
            return None;
        }
        self.last_sent = Some(self.joined.clone());
        Some(self.joined.clone())
    }

    /// Fragments that arrived with leading whitespace open a new word group;
    /// gap closing only ever happens inside a group.
    fn normalized(&self, language: &str) -> String {
        let mut groups: Vec<String> = Vec::new();
        for (fragment, starts_word) in self.fragments.iter().zip(&self.word_starts) {
            match groups.last_mut() {
                Some(group) if !starts_word => {
                    group.push(' ');
                    group.push_str(fragment);
                }
                _ => groups.push(fragment.clone()),
            }
        }
        groups
            .iter()
            .map(|group| normalize_transcript(group, language))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Text of both roles once a turn-complete signal arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedTurn {
    pub user_text: String,
    pub assistant_text: String,
}

/// Per-connection buffer of user and assistant fragments for one turn.
#[derive(Debug)]
pub struct TurnAggregator {
    target_language: String,
    phase: TurnPhase,
    user: RoleBuffer,
    assistant: RoleBuffer,
}

impl TurnAggregator {
    pub fn new(target_language: impl Into<String>) -> Self {
        Self {
            target_language: target_language.into(),
            phase: TurnPhase::Empty,
            user: RoleBuffer::default(),
            assistant: RoleBuffer::default(),
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    fn buffer_mut(&mut self, role: Role) -> &mut RoleBuffer {
        match role {
            Role::User => &mut self.user,
            Role::Assistant => &mut self.assistant,
        }
    }

    /// Buffers a fragment and returns the role's running transcript when it
    /// changed since the last value handed out. Blank fragments are ignored.
    pub fn append_fragment(&mut self, role: Role, text: &str) -> Option<String> {
        let fragment = text.trim();
        if fragment.is_empty() {
            return None;
        }
        if self.phase == TurnPhase::Finalized {
            tracing::warn!(role = role.as_str(), "Dropping fragment received after turn was finalized");
            return None;
        }
        let starts_word = text.starts_with(char::is_whitespace);
        self.phase = TurnPhase::Accumulating;
        self.buffer_mut(role).push(fragment, starts_word)
    }

    /// True once the user has said anything in this turn.
    pub fn ready_for_logging(&self) -> bool {
        !self.user.fragments.is_empty()
    }

    /// Produces the normalised text for both roles. Fragments stay buffered
    /// until [`reset`](Self::reset).
    pub fn finalize(&mut self) -> FinalizedTurn {
        self.phase = TurnPhase::Finalized;
        FinalizedTurn {
            user_text: self.user.normalized(&self.target_language),
            assistant_text: self.assistant.normalized(&self.target_language),
        }
    }

    pub fn reset(&mut self) {
        self.user = RoleBuffer::default();
        self.assistant = RoleBuffer::default();
        self.phase = TurnPhase::Empty;
    }
}

pub fn is_latin_script(language: &str) -> bool {
    let language = language.trim().to_lowercase();
    LATIN_SCRIPT_LANGUAGES.contains(&language.as_str())
}

/// Collapses whitespace and, for Latin-script languages, rejoins words that
/// speech-to-text split into letter runs (`"Tha t's"` becomes `"That's"`).
///
/// A gap between two letters is closed unless the word before it already
/// ends in a contraction or the next piece starts with a capital letter.
pub fn normalize_transcript(text: &str, language: &str) -> String {
    let mut tokens = text.split_whitespace();
    if !is_latin_script(language) {
        return tokens.collect::<Vec<_>>().join(" ");
    }

    let Some(first) = tokens.next() else {
        return String::new();
    };
    let mut out = first.to_string();
    let mut word_start = 0;
    for token in tokens {
        if !closes_gap(&out[word_start..], token) {
            out.push(' ');
            word_start = out.len();
        }
        out.push_str(token);
    }
    out
}

fn closes_gap(left: &str, right: &str) -> bool {
    let (Some(l), Some(r)) = (left.chars().last(), right.chars().next()) else {
        return false;
    };
    l.is_alphabetic() && r.is_alphabetic() && !r.is_uppercase() && !ends_with_contraction(left)
}

fn ends_with_contraction(word: &str) -> bool {
    let Some((idx, apostrophe)) = word
        .char_indices()
        .rev()
        .find(|(_, c)| *c == '\'' || *c == '\u{2019}')
    else {
        return false;
    };
    let suffix = word[idx + apostrophe.len_utf8()..].to_lowercase();
    CONTRACTION_SUFFIXES.contains(&suffix.as_str())
}
