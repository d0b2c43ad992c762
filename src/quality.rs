//! Quality checks for recognized pages.

use std::fmt;

/// Why a page was flagged as low quality. The page is still written.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum QualityWarning {
    /// Fewer non-whitespace characters than the configured minimum.
    TooFewCharacters { found: usize, minimum: usize },
    /// Confidence below the configured threshold.
    LowConfidence { found: f64, minimum: f64 },
}

impl fmt::Display for QualityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityWarning::TooFewCharacters { found, minimum } => {
                write!(f, "only {found} characters (minimum {minimum})")
            }
            QualityWarning::LowConfidence { found, minimum } => {
                write!(f, "confidence {found:.1} below {minimum:.1}")
            }
        }
    }
}

/// Flags pages whose text is too short or whose confidence is too low.
#[derive(Clone, Copy, Debug)]
pub struct QualityGate {
    pub min_chars: usize,
    pub min_confidence: f64,
}

impl QualityGate {
    /// Check one page. Confidence is on the 0–100 scale.
    pub fn assess(&self, text: &str, confidence: f64) -> Option<QualityWarning> {
        let found = text.chars().filter(|c| !c.is_whitespace()).count();
        if found < self.min_chars {
            Some(QualityWarning::TooFewCharacters {
                found,
                minimum: self.min_chars,
            })
        } else if confidence < self.min_confidence {
            Some(QualityWarning::LowConfidence {
                found: confidence,
                minimum: self.min_confidence,
            })
        } else {
            None
        }
    }
}
