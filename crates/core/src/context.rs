use serde::{Deserialize, Serialize};

use crate::error::{HoplineError, Result};
use crate::ids::{SpanId, TraceId};

/// HTTP header carrying the encoded trace context between hops.
pub const TRACE_HEADER: &str = "traceparent";

const VERSION: &str = "00";
const NO_PARENT: &str = "0000000000000000";
const FLAG_SAMPLED: u8 = 0b0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingPolicy {
    #[default]
    Always,
    Never,
}

impl SamplingPolicy {
    pub fn decide(self) -> bool {
        matches!(self, Self::Always)
    }

    pub fn parse(input: &str) -> Result<Self> {
        match input.to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(HoplineError::Config(format!(
                "unknown sampling policy: {other}"
            ))),
        }
    }
}

/// Identity of one trace as it travels the chain. The trace id never changes
/// after `new`; each hop derives a child context via `extend` before
/// forwarding so the downstream span parents correctly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub parent_span_id: Option<SpanId>,
    pub sampled: bool,
}

impl TraceContext {
    pub fn new(policy: SamplingPolicy) -> Self {
        Self {
            trace_id: TraceId::generate(),
            parent_span_id: None,
            sampled: policy.decide(),
        }
    }

    pub fn extend(&self, parent: SpanId) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            parent_span_id: Some(parent),
            sampled: self.sampled,
        }
    }

    /// Renders `00-{trace_id}-{parent}-{flags}`; an absent parent is encoded
    /// as sixteen zeros so the field widths stay fixed.
    pub fn encode(&self) -> String {
        let parent = self
            .parent_span_id
            .as_ref()
            .map(SpanId::as_str)
            .unwrap_or(NO_PARENT);
        let flags = if self.sampled { FLAG_SAMPLED } else { 0 };
        format!("{VERSION}-{}-{parent}-{flags:02x}", self.trace_id)
    }

    pub fn decode(input: &str) -> Result<Self> {
        let raw = input.trim();
        let parts: Vec<&str> = raw.split('-').collect();
        if parts.len() != 4 {
            return Err(HoplineError::MalformedContext(format!(
                "expected 4 dash-separated fields, got {}",
                parts.len()
            )));
        }
        if parts[0] != VERSION {
            return Err(HoplineError::MalformedContext(format!(
                "unsupported version: {}",
                parts[0]
            )));
        }
        let trace_id = TraceId::parse(parts[1])
            .map_err(|e| HoplineError::MalformedContext(e.to_string()))?;
        let parent_span_id = if parts[2] == NO_PARENT {
            None
        } else {
            Some(
                SpanId::parse(parts[2])
                    .map_err(|e| HoplineError::MalformedContext(e.to_string()))?,
            )
        };
        if parts[3].len() != 2 {
            return Err(HoplineError::MalformedContext(format!(
                "invalid flags field: {}",
                parts[3]
            )));
        }
        let flags = u8::from_str_radix(parts[3], 16)
            .map_err(|_| HoplineError::MalformedContext(format!("invalid flags field: {}", parts[3])))?;
        Ok(Self {
            trace_id,
            parent_span_id,
            sampled: flags & FLAG_SAMPLED != 0,
        })
    }
}
