use async_trait::async_trait;
use parking_lot::Mutex;

use super::{builtin_seeds, FailurePattern, FixRecord, KnowledgeError, KnowledgeStore, Result};

#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    patterns: Mutex<Vec<FailurePattern>>,
    fixes: Mutex<Vec<FixRecord>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn seed_builtins(&self) -> Result<()> {
        let mut patterns = self.patterns.lock();
        let now = chrono::Utc::now().timestamp_millis();
        for seed in builtin_seeds(now) {
            if !patterns.iter().any(|p| p.signature == seed.signature) {
                patterns.push(seed);
            }
        }
        Ok(())
    }

    async fn find_by_signature(&self, signature: &str) -> Result<Option<FailurePattern>> {
        Ok(self
            .patterns
            .lock()
            .iter()
            .find(|p| p.signature == signature)
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<FailurePattern>> {
        Ok(self.patterns.lock().iter().find(|p| p.id == id).cloned())
    }

    async fn insert_pattern(&self, pattern: FailurePattern) -> Result<()> {
        self.patterns.lock().push(pattern);
        Ok(())
    }

    async fn update_pattern(&self, pattern: FailurePattern) -> Result<()> {
        let mut patterns = self.patterns.lock();
        match patterns.iter_mut().find(|p| p.id == pattern.id) {
            Some(existing) => {
                *existing = pattern;
                Ok(())
            }
            None => Err(KnowledgeError::PatternNotFound(pattern.id)),
        }
    }

    async fn record_fix(&self, fix: FixRecord) -> Result<()> {
        self.fixes.lock().push(fix);
        Ok(())
    }

    async fn fix_history(&self, pattern_id: &str) -> Result<Vec<FixRecord>> {
        Ok(self
            .fixes
            .lock()
            .iter()
            .filter(|f| f.pattern_id == pattern_id)
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
