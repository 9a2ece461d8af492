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

#[derive(Debug, Clone, PartialEq)]
pub struct RecognizerResult {
    pub text: String,
    pub is_final: bool,
    pub confidence: f32,
}

impl RecognizerResult {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence: 0.0,
        }
    }

    pub fn final_with_confidence(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence,
        }
    }
}

/// The streaming contract the pipeline needs from an STT engine: feed PCM,
/// get back zero or more partial hypotheses eventually followed by exactly
/// one final per utterance.
pub trait SpeechRecognizer: Send + 'static {
    fn feed(&mut self, pcm: &[i16]) -> Vec<RecognizerResult>;

    /// Flushes the current utterance, if any.
    fn finalize(&mut self) -> Option<RecognizerResult>;
}

#[cfg(feature = "vosk")]
pub use vosk_backend::VoskRecognizer;

#[cfg(feature = "vosk")]
mod vosk_backend {
    use super::{RecognizerResult, SpeechRecognizer};
    use crate::error::{SkeletonCrewError, SkeletonCrewResult};
    use std::path::Path;
    use tracing::{info, warn};
    use vosk::{CompleteResult, DecodingState, Model, Recognizer};

    /// Kaldi-based local streaming recognizer.
    pub struct VoskRecognizer {
        // The model must outlive the recognizer built from it.
        _model: Model,
        recognizer: Recognizer,
        last_partial: String,
    }

    impl VoskRecognizer {
        pub fn new(model_path: &Path, sample_rate: u32) -> SkeletonCrewResult<Self> {
            let path = model_path.to_string_lossy();
            let model = Model::new(path.as_ref()).ok_or_else(|| {
                SkeletonCrewError::Other(format!("could not load vosk model from {path}"))
            })?;
            let mut recognizer =
                Recognizer::new(&model, sample_rate as f32).ok_or_else(|| {
                    SkeletonCrewError::Other("could not create vosk recognizer".to_owned())
                })?;
            recognizer.set_words(true);
            info!("Vosk recognizer ready at {sample_rate} Hz (model: {path})");
            Ok(Self {
                _model: model,
                recognizer,
                last_partial: String::new(),
            })
        }

        fn complete_to_result(complete: CompleteResult) -> Option<RecognizerResult> {
            let single = complete.single()?;
            let text = single.text.trim().to_owned();
            if text.is_empty() {
                return None;
            }
            let confidence = if single.result.is_empty() {
                1.0
            } else {
                single.result.iter().map(|w| w.conf).sum::<f32>() / single.result.len() as f32
            };
            Some(RecognizerResult::final_with_confidence(text, confidence))
        }
    }

    impl SpeechRecognizer for VoskRecognizer {
        fn feed(&mut self, pcm: &[i16]) -> Vec<RecognizerResult> {
            let mut results = Vec::new();
            match self.recognizer.accept_waveform(pcm) {
                Ok(DecodingState::Finalized) => {
                    self.last_partial.clear();
                    if let Some(result) = Self::complete_to_result(self.recognizer.result()) {
                        results.push(result);
                    }
                }
                Ok(DecodingState::Running) => {
                    let partial = self.recognizer.partial_result().partial.trim().to_owned();
                    if !partial.is_empty() && partial != self.last_partial {
                        results.push(RecognizerResult::partial(partial.clone()));
                        self.last_partial = partial;
                    }
                }
                Ok(DecodingState::Failed) => warn!("Vosk decoding failed for one buffer"),
                Err(e) => warn!("Vosk rejected waveform: {e}"),
            }
            results
        }

        fn finalize(&mut self) -> Option<RecognizerResult> {
            self.last_partial.clear();
            Self::complete_to_result(self.recognizer.final_result())
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::{RecognizerResult, SpeechRecognizer};
    use std::collections::VecDeque;

    /// Scripted recognizer: yields the queued results one per `feed` call.
    pub struct ScriptedRecognizer {
        script: VecDeque<RecognizerResult>,
    }

    impl ScriptedRecognizer {
        pub fn new(results: impl IntoIterator<Item = RecognizerResult>) -> Self {
            Self {
                script: results.into_iter().collect(),
            }
        }
    }

    impl SpeechRecognizer for ScriptedRecognizer {
        fn feed(&mut self, _pcm: &[i16]) -> Vec<RecognizerResult> {
            self.script.pop_front().into_iter().collect()
        }

        fn finalize(&mut self) -> Option<RecognizerResult> {
            self.script.pop_front()
        }
    }
}
