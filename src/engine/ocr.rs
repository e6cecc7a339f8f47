//! Table engine backed by the `ocrs` text detector and recogniser.
//!
//! Both models are rten files supplied through [`EngineOptions`]; fetching
//! or converting them is outside this crate. Recognised words are handed
//! to [`super::layout::assemble`] for row and cell grouping.

use super::layout::{self, Word};
use super::TableEngine;
use crate::config::EngineOptions;
use crate::error::EngineError;
use crate::outcome::TableResult;
use crate::pipeline::prepare::TaskInput;
use ocrs::{ImageSource, OcrEngine, OcrEngineParams, TextItem};
use rten::Model;
use std::path::Path;
use tracing::debug;

/// OCR-based table extractor.
pub struct OcrTableEngine {
    engine: OcrEngine,
}

impl OcrTableEngine {
    /// Load the detection and recognition models named in `options`.
    pub fn load(options: &EngineOptions) -> Result<Self, EngineError> {
        let detection_model = load_model(&options.detection_model)?;
        let recognition_model = load_model(&options.recognition_model)?;
        let engine = OcrEngine::new(OcrEngineParams {
            detection_model: Some(detection_model),
            recognition_model: Some(recognition_model),
            ..Default::default()
        })
        .map_err(|e| EngineError::Init(format!("OCR engine setup failed: {e}")))?;
        Ok(Self { engine })
    }
}

fn load_model(path: &Path) -> Result<Model, EngineError> {
    if !path.is_file() {
        return Err(EngineError::Init(format!(
            "model file not found: {}",
            path.display()
        )));
    }
    Model::load_file(path)
        .map_err(|e| EngineError::Init(format!("failed to load {}: {e}", path.display())))
}

fn inference(stage: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::Inference(format!("{stage} failed: {e}"))
}

impl TableEngine for OcrTableEngine {
    fn extract(&self, input: &TaskInput) -> Result<TableResult, EngineError> {
        let source = ImageSource::from_bytes(&input.pixels, (input.width, input.height))
            .map_err(|e| inference("image conversion", e))?;
        let ocr_input = self
            .engine
            .prepare_input(source)
            .map_err(|e| inference("preprocessing", e))?;

        let word_rects = self
            .engine
            .detect_words(&ocr_input)
            .map_err(|e| inference("text detection", e))?;
        let line_rects = self.engine.find_text_lines(&ocr_input, &word_rects);
        let lines = self
            .engine
            .recognize_text(&ocr_input, &line_rects)
            .map_err(|e| inference("text recognition", e))?;
        debug!(
            "Detected {} word regions in {} lines",
            word_rects.len(),
            line_rects.len()
        );

        let words: Vec<Word> = lines
            .iter()
            .flatten()
            .flat_map(|line| line.words())
            .map(|word| {
                let rect = word.bounding_rect();
                Word {
                    text: word.to_string(),
                    left: rect.left() as f32,
                    top: rect.top() as f32,
                    right: rect.right() as f32,
                    bottom: rect.bottom() as f32,
                }
            })
            .collect();

        layout::assemble(&words, word_rects.len())
    }
}
