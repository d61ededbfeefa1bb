//! Transcript parser
//!
//! Turns the word list produced by the speech recognizer into a [`Command`].
//! Parsing never fails: anything unrecognized becomes [`Command::invalid`].

use crate::domain::command::{Command, Opcode, MAX_TICK};

/// Trigger substrings, tested in this order against every word.
const TRIGGERS: &[(&str, Opcode)] = &[
    ("fire", Opcode::Fire),
    ("prime", Opcode::Prime),
    ("up", Opcode::TiltUp),
    ("down", Opcode::TiltDown),
    ("left", Opcode::RotateLeft),
    ("right", Opcode::RotateRight),
    // Common recognizer mishearings of "right"
    ("write", Opcode::RotateRight),
    ("rite", Opcode::RotateRight),
];

const NUMBER_WORDS: &[(&str, u8)] = &[
    ("one", 1),
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("six", 6),
    ("seven", 7),
    ("eight", 8),
    ("nine", 9),
    ("ten", 10),
];

/// Parse one utterance into a command.
pub fn parse<S: AsRef<str>>(words: &[S]) -> Command {
    let Some((opcode, index)) = find_opcode(words) else {
        return Command::invalid();
    };

    if !opcode.requires_argument() {
        return Command::new(opcode, 0).unwrap_or_default();
    }

    find_argument(words, index)
        .and_then(|argument| Command::new(opcode, argument))
        .unwrap_or_default()
}

/// Flatten recognizer candidates into a single ordered word list.
pub fn words_from_candidates<S: AsRef<str>>(candidates: &[S]) -> Vec<String> {
    candidates
        .iter()
        .flat_map(|sentence| sentence.as_ref().split_whitespace())
        .map(str::to_string)
        .collect()
}

/// First word containing a trigger, with its index.
fn find_opcode<S: AsRef<str>>(words: &[S]) -> Option<(Opcode, usize)> {
    words.iter().enumerate().find_map(|(index, word)| {
        let word = word.as_ref().to_lowercase();
        TRIGGERS
            .iter()
            .find(|(trigger, _)| word.contains(trigger))
            .map(|(_, opcode)| (*opcode, index))
    })
}

/// First token from `start` that reads as a tick count.
fn find_argument<S: AsRef<str>>(words: &[S], start: usize) -> Option<u8> {
    words
        .iter()
        .skip(start)
        .find_map(|word| tick_from_token(word.as_ref()))
}

fn tick_from_token(token: &str) -> Option<u8> {
    if let Ok(n) = token.parse::<i64>() {
        return (1..=i64::from(MAX_TICK))
            .contains(&n)
            .then(|| n as u8);
    }
    NUMBER_WORDS
        .iter()
        .find(|(word, _)| *word == token)
        .map(|(_, n)| *n)
}
