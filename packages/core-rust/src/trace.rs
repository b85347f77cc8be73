//! Distributed trace context and its header carrier.
//!
//! The wire form is the `uber-trace-id` header:
//! `{trace-id}:{span-id}:{parent-span-id}:{flags}`, each field lowercase hex.
//! A parent id of `0` marks a root span.

use std::fmt;

use crate::header::Headers;

/// Header used to propagate trace context between services.
pub const TRACE_HEADER: &str = "uber-trace-id";

/// Sampled bit in [`SpanContext::flags`].
pub const FLAG_SAMPLED: u8 = 0x01;

/// Identity of one span within a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub parent_id: u64,
    pub flags: u8,
}

impl SpanContext {
    /// Starts a new sampled trace with a random root span.
    #[must_use]
    pub fn new_root() -> Self {
        Self {
            trace_id: nonzero_u128(),
            span_id: nonzero_u64(),
            parent_id: 0,
            flags: FLAG_SAMPLED,
        }
    }

    /// Derives a child span in the same trace.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: nonzero_u64(),
            parent_id: self.span_id,
            flags: self.flags,
        }
    }

    #[must_use]
    pub fn is_sampled(&self) -> bool {
        self.flags & FLAG_SAMPLED != 0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id == 0
    }

    /// Parses the `uber-trace-id` wire form. Returns `None` on any malformed
    /// field or a zero trace/span id.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split(':');
        let trace_id = u128::from_str_radix(parts.next()?, 16).ok()?;
        let span_id = u64::from_str_radix(parts.next()?, 16).ok()?;
        let parent_id = u64::from_str_radix(parts.next()?, 16).ok()?;
        let flags = u8::from_str_radix(parts.next()?, 16).ok()?;
        if parts.next().is_some() || trace_id == 0 || span_id == 0 {
            return None;
        }
        Some(Self {
            trace_id,
            span_id,
            parent_id,
            flags,
        })
    }

    /// Reads trace context from `headers`, if a valid one is present.
    #[must_use]
    pub fn extract(headers: &Headers) -> Option<Self> {
        headers.get(TRACE_HEADER).and_then(Self::parse)
    }

    /// Writes this context into `headers`, replacing any previous value.
    pub fn inject(&self, headers: &mut Headers) {
        headers.set(TRACE_HEADER, self.to_string());
    }

    /// Trace id in its hex wire form, used as a log field.
    #[must_use]
    pub fn trace_id_hex(&self) -> String {
        format!("{:x}", self.trace_id)
    }
}

impl fmt::Display for SpanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}:{:x}:{:x}:{:x}",
            self.trace_id, self.span_id, self.parent_id, self.flags
        )
    }
}

fn nonzero_u64() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

fn nonzero_u128() -> u128 {
    loop {
        let id: u128 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn child_shares_trace_and_points_at_parent() {
        let root = SpanContext::new_root();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_id, root.span_id);
        assert_ne!(child.span_id, root.span_id);
        assert!(root.is_root());
        assert!(!child.is_root());
    }

    #[test]
    fn parse_known_value() {
        let ctx = SpanContext::parse("abc:12:0:1").unwrap();
        assert_eq!(ctx.trace_id, 0xabc);
        assert_eq!(ctx.span_id, 0x12);
        assert!(ctx.is_sampled());
        assert_eq!(ctx.to_string(), "abc:12:0:1");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(SpanContext::parse("").is_none());
        assert!(SpanContext::parse("a:b:c").is_none());
        assert!(SpanContext::parse("a:b:c:d:e").is_none());
        assert!(SpanContext::parse("0:1:0:1").is_none());
        assert!(SpanContext::parse("zz:1:0:1").is_none());
    }

    #[test]
    fn inject_then_extract() {
        let ctx = SpanContext::new_root().child();
        let mut headers = Headers::new();
        ctx.inject(&mut headers);
        assert_eq!(SpanContext::extract(&headers), Some(ctx));
    }

    proptest! {
        #[test]
        fn display_parses_back(t in 1u128.., s in 1u64.., p in any::<u64>(), f in any::<u8>()) {
            let ctx = SpanContext { trace_id: t, span_id: s, parent_id: p, flags: f };
            prop_assert_eq!(SpanContext::parse(&ctx.to_string()), Some(ctx));
        }
    }
}
