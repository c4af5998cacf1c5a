//! Persona prompt for the low-latency conversational model
//!
//! The delegation protocol depends on this prompt: the primary model is told to
//! speak one of the trigger phrases verbatim when a question is too complex for
//! it, which the session orchestrator detects as a cheap, deterministic handoff
//! signal (no confidence scores to parse).

/// Base persona instructions sent in the session configuration message
pub const PERSONA_PROMPT: &str = "\
You are Parley, a warm, quick-witted voice assistant. Keep replies short and \
conversational; you are being spoken aloud, so avoid lists, markdown, and long \
monologues. Answer simple questions directly.

When a question needs research, multi-step reasoning, or up-to-date facts you \
are unsure of, do NOT guess. Instead say exactly one of these phrases, then \
stop: \"let me think about that\", \"let me research that\", \"give me a \
moment\", or \"that's a good question\". A deeper analysis will be handed to \
you shortly; read it back naturally as your own answer.";

/// Build the full instruction text for session configuration.
///
/// Appends the knowledge context when one is available; an absent or empty
/// context yields the bare persona prompt.
#[must_use]
pub fn build_instructions(context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.trim().is_empty() => {
            format!("{PERSONA_PROMPT}\n\nWhat you remember about this user:\n{ctx}")
        }
        _ => PERSONA_PROMPT.to_string(),
    }
}
