//! Reasoning oracle boundary: prompt in, text and token usage out

use crate::error::OracleError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Tokens consumed by one oracle call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input: u64,
    /// Completion tokens
    pub output: u64,
}

impl TokenUsage {
    /// Create usage
    #[inline]
    #[must_use]
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    /// Sum of both directions
    #[inline]
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Successful oracle answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleReply {
    /// Raw text
    pub text: String,
    /// Tokens billed
    pub usage: TokenUsage,
}

/// Black-box language-reasoning service
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Ask once; the caller is responsible for rate and budget checks.
    async fn ask(&self, prompt: &str, max_tokens: u32) -> Result<OracleReply, OracleError>;
}
