/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::{config::AliasConfig, model::NodeId, voice::recognizer::RecognizerResult};
use regex::Regex;
use std::{collections::HashMap, sync::OnceLock, time::Duration};
use tracing::debug;

/// Lowercased, punctuation stripped, whitespace collapsed. Both wake
/// phrases and spoken text go through this before any matching.
pub fn normalize(text: &str) -> String {
    static PUNCTUATION: OnceLock<Regex> = OnceLock::new();
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    let punctuation =
        PUNCTUATION.get_or_init(|| Regex::new(r"[^\p{L}\p{N}\s]").expect("static regex"));
    let whitespace = WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("static regex"));

    let lowered = text.to_lowercase();
    let stripped = punctuation.replace_all(&lowered, "");
    whitespace.replace_all(&stripped, " ").trim().to_owned()
}

/// Spoken phrase -> canonical command, with node-scoped entries preferred
/// over global ones.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    node_scoped: HashMap<(NodeId, String), String>,
    global: HashMap<String, String>,
}

impl AliasTable {
    pub fn from_config(aliases: &[AliasConfig]) -> Self {
        let mut table = AliasTable::default();
        for alias in aliases {
            let phrase = normalize(&alias.phrase);
            match &alias.node {
                Some(node) => {
                    table
                        .node_scoped
                        .insert((node.clone(), phrase), alias.command.clone());
                }
                None => {
                    table.global.insert(phrase, alias.command.clone());
                }
            }
        }
        table
    }

    pub fn resolve(&self, node: &str, normalized_phrase: &str) -> Option<&str> {
        self.node_scoped
            .get(&(node.to_owned(), normalized_phrase.to_owned()))
            .or_else(|| self.global.get(normalized_phrase))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateEvent {
    Wake {
        node_id: NodeId,
        phrase: String,
    },
    Command {
        target_node: NodeId,
        command: String,
        raw_text: String,
        confidence: f32,
    },
    WakeTimeout {
        node_id: NodeId,
    },
}

struct OpenWindow {
    node_id: NodeId,
    phrase: String,
    opened_at_micros: u64,
}

/// The wake-word gate and command extractor. Feed it recognizer results in
/// order; it never emits a command without a preceding wake inside the
/// active window, and the window is single-shot per wake.
pub struct WakeGate {
    phrases: Vec<(NodeId, String)>,
    aliases: AliasTable,
    window: Duration,
    open: Option<OpenWindow>,
}

impl WakeGate {
    pub fn new(
        wake_words: &HashMap<String, String>,
        aliases: AliasTable,
        window: Duration,
    ) -> Self {
        let mut phrases: Vec<(NodeId, String)> = wake_words
            .iter()
            .map(|(node, phrase)| (node.clone(), normalize(phrase)))
            .filter(|(_, p)| !p.is_empty())
            .collect();
        phrases.sort();
        Self {
            phrases,
            aliases,
            window,
            open: None,
        }
    }

    /// Closes an expired window. Call periodically even when no results
    /// arrive, otherwise silence never times out.
    pub fn check_timeout(&mut self, now_micros: u64) -> Option<GateEvent> {
        let expired = self
            .open
            .as_ref()
            .map(|w| now_micros.saturating_sub(w.opened_at_micros) > self.window.as_micros() as u64)
            .unwrap_or(false);
        if expired {
            let window = self.open.take()?;
            debug!("Wake window for '{}' timed out", window.node_id);
            return Some(GateEvent::WakeTimeout {
                node_id: window.node_id,
            });
        }
        None
    }

    pub fn on_result(&mut self, result: &RecognizerResult, now_micros: u64) -> Vec<GateEvent> {
        let mut events = Vec::new();
        if let Some(timeout) = self.check_timeout(now_micros) {
            events.push(timeout);
        }

        let normalized = normalize(&result.text);
        if normalized.is_empty() {
            return events;
        }

        // Wake detection on any result kind whose text ends with a phrase.
        if self.open.is_none()
            && let Some((node_id, phrase)) = self
                .phrases
                .iter()
                .find(|(_, phrase)| normalized.ends_with(phrase.as_str()))
                .cloned()
        {
            debug!("Wake phrase '{phrase}' for '{node_id}' detected");
            self.open = Some(OpenWindow {
                node_id: node_id.clone(),
                phrase: phrase.clone(),
                opened_at_micros: now_micros,
            });
            events.push(GateEvent::Wake { node_id, phrase });
        }

        if !result.is_final {
            return events;
        }

        let Some(window) = &self.open else {
            return events;
        };

        // Strip the wake phrase when the final contains it, so that
        // "computer indigo play" matches the alias "play".
        let candidate = match normalized.find(window.phrase.as_str()) {
            Some(idx) => normalized[idx + window.phrase.len()..].trim().to_owned(),
            None => normalized,
        };
        if candidate.is_empty() {
            // The wake-only utterance; keep listening.
            return events;
        }

        match self.aliases.resolve(&window.node_id, &candidate) {
            Some(command) => {
                let window = self.open.take().expect("window is open");
                events.push(GateEvent::Command {
                    target_node: window.node_id,
                    command: command.to_owned(),
                    raw_text: candidate,
                    confidence: result.confidence,
                });
            }
            None => {
                debug!("No alias for '{candidate}', window stays open");
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> WakeGate {
        let wake_words = [("indigo".to_owned(), "computer indigo".to_owned())]
            .into_iter()
            .collect();
        let aliases = AliasTable::from_config(&[AliasConfig {
            phrase: "play".to_owned(),
            command: "jack_transport_start".to_owned(),
            node: None,
        }]);
        WakeGate::new(&wake_words, aliases, Duration::from_secs(5))
    }

    #[test]
    fn normalization_strips_case_punctuation_and_extra_whitespace() {
        assert_eq!(normalize("  Computer,   Indigo!  "), "computer indigo");
        assert_eq!(normalize("PLAY."), "play");
        assert_eq!(normalize("..."), "");
    }

    #[test]
    fn wake_then_command_in_one_utterance() {
        let mut gate = gate();
        let partial = RecognizerResult::partial("computer indigo");
        let events = gate.on_result(&partial, 0);
        assert_eq!(
            events,
            vec![GateEvent::Wake {
                node_id: "indigo".to_owned(),
                phrase: "computer indigo".to_owned(),
            }]
        );

        let final_result =
            RecognizerResult::final_with_confidence("computer indigo play", 0.93);
        let events = gate.on_result(&final_result, 1_000_000);
        assert_eq!(
            events,
            vec![GateEvent::Command {
                target_node: "indigo".to_owned(),
                command: "jack_transport_start".to_owned(),
                raw_text: "play".to_owned(),
                confidence: 0.93,
            }]
        );

        // Window is single shot: closed after the command.
        assert!(gate.check_timeout(10_000_000).is_none());
    }

    #[test]
    fn commands_without_a_wake_are_never_emitted() {
        let mut gate = gate();
        let final_result = RecognizerResult::final_with_confidence("play", 0.9);
        assert!(gate.on_result(&final_result, 0).is_empty());
    }

    #[test]
    fn the_window_times_out_without_a_command() {
        let mut gate = gate();
        gate.on_result(&RecognizerResult::partial("computer indigo"), 0);
        assert!(gate.check_timeout(4_000_000).is_none());
        assert_eq!(
            gate.check_timeout(6_000_000),
            Some(GateEvent::WakeTimeout {
                node_id: "indigo".to_owned(),
            })
        );
        // Closed; no second timeout.
        assert!(gate.check_timeout(20_000_000).is_none());
    }

    #[test]
    fn unknown_phrases_keep_the_window_open() {
        let mut gate = gate();
        gate.on_result(&RecognizerResult::partial("computer indigo"), 0);
        let events = gate.on_result(
            &RecognizerResult::final_with_confidence("computer indigo fly me to the moon", 0.8),
            1_000_000,
        );
        assert!(events.is_empty());
        // Still open: a later matching final within the window works.
        let events = gate.on_result(
            &RecognizerResult::final_with_confidence("play", 0.85),
            2_000_000,
        );
        assert!(matches!(events.as_slice(), [GateEvent::Command { .. }]));
    }

    #[test]
    fn node_scoped_aliases_win_over_global_ones() {
        let wake_words = [("indigo".to_owned(), "computer indigo".to_owned())]
            .into_iter()
            .collect();
        let aliases = AliasTable::from_config(&[
            AliasConfig {
                phrase: "play".to_owned(),
                command: "global_start".to_owned(),
                node: None,
            },
            AliasConfig {
                phrase: "play".to_owned(),
                command: "indigo_start".to_owned(),
                node: Some("indigo".to_owned()),
            },
        ]);
        let mut gate = WakeGate::new(&wake_words, aliases, Duration::from_secs(5));
        gate.on_result(&RecognizerResult::partial("computer indigo"), 0);
        let events = gate.on_result(
            &RecognizerResult::final_with_confidence("play", 0.9),
            1_000,
        );
        assert!(matches!(
            events.as_slice(),
            [GateEvent::Command { command, .. }] if command == "indigo_start"
        ));
    }

    #[test]
    fn a_wake_mid_sentence_is_ignored_unless_it_is_the_suffix() {
        let mut gate = gate();
        let events = gate.on_result(
            &RecognizerResult::partial("computer indigo is a nice name"),
            0,
        );
        assert!(events.is_empty());
    }
}
