use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HoplineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(String);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn parse(input: &str) -> Result<Self> {
        if input.len() != 32 || !input.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HoplineError::Parse(format!("invalid trace id: {input}")));
        }
        if input.bytes().all(|b| b == b'0') {
            return Err(HoplineError::Parse("all-zero trace id".into()));
        }
        Ok(Self(input.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl SpanId {
    pub fn generate() -> Self {
        // Low bit forced so a generated id can never collide with the
        // all-zero "no parent" marker on the wire.
        let bits = Uuid::new_v4().as_u128() as u64 | 1;
        Self(format!("{bits:016x}"))
    }

    pub fn parse(input: &str) -> Result<Self> {
        if input.len() != 16 || !input.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HoplineError::Parse(format!("invalid span id: {input}")));
        }
        if input.bytes().all(|b| b == b'0') {
            return Err(HoplineError::Parse("all-zero span id".into()));
        }
        Ok(Self(input.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
