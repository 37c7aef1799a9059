use std::{
    collections::VecDeque,
    hash::{DefaultHasher, Hash, Hasher},
    time::Duration,
};

use parking_lot::Mutex;

use crate::sys::llm::{normalize, Completion, Content, Embedder, LlmError, Role};

/// Offline completion backend.
///
/// Replies come from a script in order; once the script runs dry the last
/// user message is echoed back.
pub struct EchoCompletion {
    script: Mutex<VecDeque<Result<String, ()>>>,
    delay: Duration,
}

impl EchoCompletion {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
        }
    }

    #[cfg(test)]
    pub fn with_script<I: IntoIterator<Item = S>, S: Into<String>>(replies: I) -> Self {
        let echo = Self::new();
        for reply in replies {
            echo.push(reply);
        }
        echo
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push(&self, reply: impl Into<String>) {
        self.script.lock().push_back(Ok(reply.into()));
    }

    /// Queue a failed call.
    pub fn push_failure(&self) {
        self.script.lock().push_back(Err(()));
    }
}

impl Completion for EchoCompletion {
    fn complete(&self, prompts: &[Content]) -> Result<String, LlmError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        match self.script.lock().pop_front() {
            Some(Ok(reply)) => return Ok(reply),
            Some(Err(())) => return Err(LlmError::Http("scripted failure".to_string())),
            None => {}
        }

        prompts
            .iter()
            .rev()
            .find(|c| c.role == Role::User)
            .map(|c| c.message.clone())
            .ok_or(LlmError::EmptyResponse)
    }
}

/// Deterministic bag-of-bigrams embedder. Texts sharing characters land close.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Embedder for HashEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let chars: Vec<char> = text
            .chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();

        let mut vector = vec![0.0; self.dim];
        let mut bump = |token: &[char]| {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            vector[(hasher.finish() % self.dim as u64) as usize] += 1.0;
        };
        for c in chars.windows(1) {
            bump(c);
        }
        for pair in chars.windows(2) {
            bump(pair);
        }

        normalize(&mut vector);
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_then_echo() {
        let echo = EchoCompletion::with_script(["<chat|a|b>"]);
        echo.push_failure();
        let prompts = [Content::system("sys"), Content::user("hello")];

        assert_eq!(echo.complete(&prompts).unwrap(), "<chat|a|b>");
        assert!(echo.complete(&prompts).is_err());
        assert_eq!(echo.complete(&prompts).unwrap(), "hello");
    }

    #[test]
    fn similar_texts_embed_closer() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("我把西瓜汁给了李大爷").unwrap();
        let b = embedder.embed("李大爷喝了西瓜汁").unwrap();
        let c = embedder.embed("the quick brown fox").unwrap();
        let dot = |x: &[f32], y: &[f32]| x.iter().zip(y).map(|(p, q)| p * q).sum::<f32>();

        assert_eq!(a.len(), 64);
        assert!((dot(&a, &a) - 1.0).abs() < 1e-5);
        assert!(dot(&a, &b) > dot(&a, &c));
        assert_eq!(a, embedder.embed("我把西瓜汁给了李大爷").unwrap());
    }
}
