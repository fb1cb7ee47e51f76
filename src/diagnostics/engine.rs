//! Classify -> synthesize signature -> lookup/learn.

use std::sync::Arc;

use chrono::Utc;

use crate::knowledge::{
    update_confidence, FailurePattern, FixRecord, KnowledgeStore, PatternSource, Result as KnowledgeResult,
};

use super::{Classifier, FailureInput};

/// Result of [`DiagnosticsEngine::diagnose`].
#[derive(Debug, Clone)]
pub struct DiagnosisResult {
    pub pattern: FailurePattern,
    pub suggested_fix: Option<String>,
    pub confidence: f64,
    pub fix_history: Vec<FixRecord>,
    pub is_new_pattern: bool,
}

/// Binds the [`Classifier`] rule chain to a [`KnowledgeStore`], implementing
/// the learn-then-match loop: classify, look up a matching pattern by
/// signature, and fall back to seeding a new one when nothing matches.
pub struct DiagnosticsEngine {
    knowledge: Arc<dyn KnowledgeStore>,
}

impl DiagnosticsEngine {
    pub fn new(knowledge: Arc<dyn KnowledgeStore>) -> Self {
        Self { knowledge }
    }

    /// Classifies `input`, synthesizes its signature, and looks it up in the
    /// knowledge store. Lookup tries the detailed per-suite signature first
    /// -- so a previously-learned pattern for this exact failure shape wins
    /// -- and falls back to the category's built-in signature
    /// (`builtin::<CATEGORY>`) so an unseen failure still matches the seeded
    /// pattern for its category rather than spawning a duplicate learned one.
    /// A hit increments `occurrences` and bumps `lastSeenAt`; a miss (neither
    /// lookup resolves) creates a `learned` pattern with `confidence = 0.33`,
    /// `occurrences = 1`.
    pub async fn diagnose(&self, input: &FailureInput) -> KnowledgeResult<DiagnosisResult> {
        let category = Classifier::classify(input);
        let signature = Classifier::signature(input, category);
        let builtin_signature = format!("builtin::{}", category.as_str());
        let now = Utc::now().timestamp_millis();

        let found = match self.knowledge.find_by_signature(&signature).await? {
            Some(p) => Some(p),
            None => self.knowledge.find_by_signature(&builtin_signature).await?,
        };

        match found {
            Some(mut pattern) => {
                pattern.occurrences += 1;
                pattern.last_seen_ms = now;
                pattern.updated_ms = now;
                self.knowledge.update_pattern(pattern.clone()).await?;
                let fix_history = self.knowledge.fix_history(&pattern.id).await?;
                Ok(DiagnosisResult {
                    suggested_fix: pattern.suggested_fix.clone(),
                    confidence: pattern.confidence,
                    pattern,
                    fix_history,
                    is_new_pattern: false,
                })
            }
            None => {
                let pattern = FailurePattern {
                    id: ulid::Ulid::new().to_string(),
                    category: category.as_str().to_string(),
                    signature: signature.clone(),
                    signature_pattern: signature,
                    description: format!("Learned failure pattern for {}", category.as_str()),
                    suggested_fix: None,
                    confidence: 0.33,
                    occurrences: 1,
                    resolutions: 0,
                    source: PatternSource::Learned,
                    first_seen_ms: now,
                    last_seen_ms: now,
                    created_ms: now,
                    updated_ms: now,
                };
                self.knowledge.insert_pattern(pattern.clone()).await?;
                Ok(DiagnosisResult {
                    suggested_fix: None,
                    confidence: pattern.confidence,
                    pattern,
                    fix_history: Vec::new(),
                    is_new_pattern: true,
                })
            }
        }
    }

    /// Records a [`FixRecord`] and updates the pattern's confidence by the
    /// exponentially-weighted success ratio (`alpha = 0.7`); `resolutions`
    /// increments iff `success`.
    pub async fn report_fix(
        &self,
        pattern_id: &str,
        run_id: &str,
        case_name: &str,
        description: &str,
        success: bool,
    ) -> KnowledgeResult<FailurePattern> {
        let mut pattern = self
            .knowledge
            .find_by_id(pattern_id)
            .await?
            .ok_or_else(|| crate::knowledge::KnowledgeError::PatternNotFound(pattern_id.to_string()))?;

        let now = Utc::now().timestamp_millis();
        pattern.confidence = update_confidence(pattern.confidence, success);
        if success {
            pattern.resolutions += 1;
        }
        pattern.updated_ms = now;
        self.knowledge.update_pattern(pattern.clone()).await?;

        self.knowledge
            .record_fix(FixRecord {
                id: ulid::Ulid::new().to_string(),
                pattern_id: pattern.id.clone(),
                run_id: run_id.to_string(),
                case_name: case_name.to_string(),
                description: description.to_string(),
                success,
                created_ms: now,
            })
            .await?;

        Ok(pattern)
    }
}
