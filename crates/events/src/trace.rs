//! W3C trace-context propagation.
//!
//! An outbox row captures the producer's trace context at enqueue time. When the
//! dispatcher publishes the row, possibly minutes later and in another process,
//! it starts a new trace that *links* to the stored context and forwards its own
//! context to the broker as `traceparent` / `tracestate` headers.
//!
//! Request handling code makes its context ambient for the duration of a
//! future with [`scope`]; [`current`] reads it back.

use std::future::Future;

use thiserror::Error;

/// Sampled flag (bit 0 of `trace-flags`).
pub const FLAG_SAMPLED: u8 = 0x01;

tokio::task_local! {
    static CURRENT: TraceContext;
}

/// Malformed `traceparent`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid traceparent {value:?}: {reason}")]
pub struct TraceContextError {
    value: String,
    reason: &'static str,
}

impl TraceContextError {
    fn new(value: &str, reason: &'static str) -> Self {
        Self {
            value: value.to_string(),
            reason,
        }
    }
}

/// A W3C trace context (`traceparent` + optional `tracestate`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: [u8; 16],
    span_id: [u8; 8],
    flags: u8,
    state: Option<String>,
}

impl TraceContext {
    /// Build from raw parts. All-zero ids are invalid and yield `None`.
    pub fn from_parts(
        trace_id: [u8; 16],
        span_id: [u8; 8],
        flags: u8,
        state: Option<String>,
    ) -> Option<Self> {
        if trace_id == [0; 16] || span_id == [0; 8] {
            return None;
        }
        Some(Self {
            trace_id,
            span_id,
            flags,
            state: state.filter(|s| !s.is_empty()),
        })
    }

    /// Start a new sampled trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: random_nonzero(),
            span_id: random_nonzero(),
            flags: FLAG_SAMPLED,
            state: None,
        }
    }

    /// A new span in the same trace, inheriting flags and state.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: random_nonzero(),
            flags: self.flags,
            state: self.state.clone(),
        }
    }

    /// Parse a `traceparent` header (`{version}-{trace-id}-{span-id}-{flags}`).
    pub fn parse(traceparent: &str, tracestate: Option<&str>) -> Result<Self, TraceContextError> {
        let value = traceparent.trim();
        let parts: Vec<&str> = value.split('-').collect();
        if parts.len() < 4 {
            return Err(TraceContextError::new(value, "expected four fields"));
        }

        let version = parse_hex::<1>(parts[0])
            .ok_or_else(|| TraceContextError::new(value, "bad version"))?[0];
        if version == 0xff || (version == 0 && parts.len() != 4) {
            return Err(TraceContextError::new(value, "unsupported version"));
        }

        let trace_id = parse_hex::<16>(parts[1])
            .ok_or_else(|| TraceContextError::new(value, "bad trace-id"))?;
        let span_id = parse_hex::<8>(parts[2])
            .ok_or_else(|| TraceContextError::new(value, "bad parent-id"))?;
        let flags = parse_hex::<1>(parts[3])
            .ok_or_else(|| TraceContextError::new(value, "bad trace-flags"))?[0];

        Self::from_parts(trace_id, span_id, flags, tracestate.map(str::to_string))
            .ok_or_else(|| TraceContextError::new(value, "all-zero id"))
    }

    /// Rebuild from the hex strings stored on an outbox row.
    pub fn from_stored(
        trace_id: &str,
        span_id: &str,
        flags: u8,
        state: Option<&str>,
    ) -> Option<Self> {
        Self::from_parts(
            parse_hex::<16>(trace_id)?,
            parse_hex::<8>(span_id)?,
            flags,
            state.map(str::to_string),
        )
    }

    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id_hex(),
            self.span_id_hex(),
            self.flags
        )
    }

    pub fn trace_id_hex(&self) -> String {
        hex::encode(self.trace_id)
    }

    pub fn span_id_hex(&self) -> String {
        hex::encode(self.span_id)
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn is_sampled(&self) -> bool {
        self.flags & FLAG_SAMPLED != 0
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }
}

/// Run `fut` with `ctx` as the ambient trace context.
pub async fn scope<F: Future>(ctx: TraceContext, fut: F) -> F::Output {
    CURRENT.scope(ctx, fut).await
}

/// The ambient trace context, if the current task runs inside [`scope`].
pub fn current() -> Option<TraceContext> {
    CURRENT.try_with(Clone::clone).ok()
}

fn parse_hex<const N: usize>(s: &str) -> Option<[u8; N]> {
    if s.len() != N * 2 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return None;
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(s, &mut out).ok()?;
    Some(out)
}

fn random_nonzero<const N: usize>() -> [u8; N] {
    loop {
        let mut bytes = [0u8; N];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        if bytes != [0u8; N] {
            return bytes;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn parses_and_formats_traceparent() {
        let ctx = TraceContext::parse(SAMPLE, Some("vendor=abc")).unwrap();
        assert_eq!(ctx.trace_id_hex(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.span_id_hex(), "00f067aa0ba902b7");
        assert!(ctx.is_sampled());
        assert_eq!(ctx.state(), Some("vendor=abc"));
        assert_eq!(ctx.to_traceparent(), SAMPLE);
    }

    #[test]
    fn rejects_malformed_traceparent() {
        assert!(TraceContext::parse("garbage", None).is_err());
        assert!(TraceContext::parse("ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01", None).is_err());
        assert!(TraceContext::parse("00-00000000000000000000000000000000-00f067aa0ba902b7-01", None).is_err());
        assert!(TraceContext::parse("00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01", None).is_err());
        assert!(TraceContext::parse("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra", None).is_err());
    }

    #[test]
    fn child_keeps_trace_and_changes_span() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(root.trace_id_hex(), child.trace_id_hex());
        assert_ne!(root.span_id_hex(), child.span_id_hex());
    }

    #[test]
    fn from_stored_round_trips() {
        let ctx = TraceContext::new_root();
        let restored =
            TraceContext::from_stored(&ctx.trace_id_hex(), &ctx.span_id_hex(), ctx.flags(), None)
                .unwrap();
        assert_eq!(restored, ctx);
    }

    #[tokio::test]
    async fn scope_makes_context_ambient() {
        assert!(current().is_none());
        let ctx = TraceContext::new_root();
        let seen = scope(ctx.clone(), async { current() }).await;
        assert_eq!(seen, Some(ctx));
        assert!(current().is_none());
    }
}
