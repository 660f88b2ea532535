//! Attention gate: deterministic pre-filter that rejects conversational
//! noise before anything touches the store or an LLM.
//!
//! Two profiles. The user gate screens out greetings, filler, platform
//! metadata, and wrapper markup. The assistant gate is strictly stronger: it
//! additionally rejects self-narration, code dumps, and open proposals
//! ("want me to …?"), which would otherwise pollute long-term memory with
//! statements the user never confirmed.
//!
//! Both predicates are pure: no I/O, no clock, no randomness.

use std::sync::LazyLock;

use regex::Regex;

const USER_MIN_CHARS: usize = 30;
const USER_MAX_CHARS: usize = 2000;
const USER_MIN_WORDS: usize = 8;
const USER_MAX_EMOJI: usize = 3;

const ASSISTANT_MAX_CHARS: usize = 1000;
const ASSISTANT_MIN_WORDS: usize = 10;

/// Markers injected by the memory system itself; text containing them is a
/// prompt artefact, never an utterance.
const INJECTED_MARKERS: &[&str] = &["<relevant-memories>", "<core-memory-refresh>"];

/// Tool-call wrappers that leak into assistant transcripts.
const TOOL_MARKERS: &[&str] = &["<tool_result>", "<tool_use>", "<function_call>"];

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("gate pattern must compile"))
        .collect()
}

/// Noise the user gate rejects outright.
static USER_NOISE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        // Greetings, acknowledgements, and filler.
        r"(?i)^(hi|hey|hello|yo|sup|ok|okay|kk?|yes|yeah|yep|no|nope|nah|sure|thanks|thank you|thx|ty|cool|nice|great|good|fine|alright|got it|sounds good|perfect|awesome|bye|goodbye|good night|gn|brb|hm+|hmm+|huh|oh|ah|wow|lol|lmao|haha+|idk|nvm)[.!?\s]*$",
        // Two-word affirmations ("ok thanks", "yes please").
        r"(?i)^(ok(ay)?|yes|yeah|yep|sure|no|nah|thanks?|thank)\s+\w+[.!?\s]*$",
        // Deictic short responses that only make sense mid-conversation.
        r"(?i)^(i need (those|that|it|them)|let me (test|try|check) (it|that|this)|do (it|that)|try (it|that)|send (it|them)|go ahead)[.!?\s]*$",
        // Three characters or fewer after trimming.
        r"^.{0,3}$",
        // Pure markup: nothing but XML-ish tags and whitespace.
        r"^(<[^<>]+>\s*)+$",
        // Session-reset prompts from the chat surface.
        r"(?i)^a new session was started via",
        // Raw chat-platform metadata.
        r"(?i)\[(slack|telegram) message id:",
        // Heartbeat and cron wrappers.
        r"(?i)^\[?(heartbeat|cron)\b",
        r"(?i)^\[scheduled (task|reminder)\b",
        // Conversation-info blocks forwarded verbatim.
        r"(?i)^<conversation[-_ ]info",
    ])
});

/// Open proposals: questions that hand the next move back to the user.
/// Shared between the assistant gate and the sleep cycle's noise purge,
/// which re-screens the whole store against the same table.
pub static OPEN_PROPOSAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"(?i)\bwant me to\b[^?]*\?",
        r"(?i)\bshould i\b[^?]*\?",
        r"(?i)\bshall i\b[^?]*\?",
        r"(?i)\bwould you like me to\b[^?]*\?",
        r"(?i)\bdo you want me to\b[^?]*\?",
        r"(?i)\bcan i\b[^?]*\?",
        r"(?i)\bmay i\b[^?]*\?",
        r"(?i)\bready to\b[^?]*\?",
        r"(?i)\bproceed with\b[^?]*\?",
    ])
});

/// Assistant self-narration: process talk with no durable content.
static ASSISTANT_NARRATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        // Self-talk openers.
        r"(?i)^(let me|i'll|i will|now let me|first,? i|next,? i)\b",
        // Status narration.
        r"(?i)^(starting|running|processing|executing|checking|fetching|loading|analyzing|searching)\b",
        // Exclamatory openers.
        r"(?i)^(great|perfect|done|excellent|awesome)[!.]",
        // Step and page narration.
        r"(?i)^(step \d|on page\b|page \d)",
        // Filler presence statements.
        r"(?i)^(i'm here|i can see|i see)\b",
        // Completion wrap-ups.
        r"(?i)^done\b",
        r"(?i)^all (good|set|done)[!.]?\s*$",
        r"(?i)\bhere's what (changed|i did)\b",
        // Voice-mode metadata.
        r"(?i)\[voice mode\b",
        r"(?i)\[voice\]",
    ])
});

/// Why a text was rejected, for structured logging at ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
    TooShort,
    TooLong,
    TooFewWords,
    InjectedMarker,
    NoisePattern,
    TooManyEmoji,
    EmojiOnly,
    CodeDominant,
    ToolMarkup,
    Narration,
    OpenProposal,
}

impl GateRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TooShort => "too_short",
            Self::TooLong => "too_long",
            Self::TooFewWords => "too_few_words",
            Self::InjectedMarker => "injected_marker",
            Self::NoisePattern => "noise_pattern",
            Self::TooManyEmoji => "too_many_emoji",
            Self::EmojiOnly => "emoji_only",
            Self::CodeDominant => "code_dominant",
            Self::ToolMarkup => "tool_markup",
            Self::Narration => "narration",
            Self::OpenProposal => "open_proposal",
        }
    }
}

/// `Ok(())` means the text is worth storing.
pub fn user_gate(text: &str) -> Result<(), GateRejection> {
    let text = text.trim();
    let len = text.chars().count();
    if len < USER_MIN_CHARS {
        return Err(GateRejection::TooShort);
    }
    if len > USER_MAX_CHARS {
        return Err(GateRejection::TooLong);
    }
    if text.split_whitespace().count() < USER_MIN_WORDS {
        return Err(GateRejection::TooFewWords);
    }
    if INJECTED_MARKERS.iter().any(|m| text.contains(m)) {
        return Err(GateRejection::InjectedMarker);
    }
    if USER_NOISE_PATTERNS.iter().any(|p| p.is_match(text)) {
        return Err(GateRejection::NoisePattern);
    }
    if is_emoji_only(text) {
        return Err(GateRejection::EmojiOnly);
    }
    if emoji_count(text) > USER_MAX_EMOJI {
        return Err(GateRejection::TooManyEmoji);
    }
    Ok(())
}

/// Strictly stronger than [`user_gate`]: everything the user gate rejects,
/// plus narration, code dumps, tool markup, and open proposals.
pub fn assistant_gate(text: &str) -> Result<(), GateRejection> {
    let text = text.trim();
    let len = text.chars().count();
    if len > ASSISTANT_MAX_CHARS {
        return Err(GateRejection::TooLong);
    }
    if text.split_whitespace().count() < ASSISTANT_MIN_WORDS {
        return Err(GateRejection::TooFewWords);
    }
    user_gate(text)?;
    if fenced_code_chars(text) * 2 > len {
        return Err(GateRejection::CodeDominant);
    }
    if TOOL_MARKERS.iter().any(|m| text.contains(m)) {
        return Err(GateRejection::ToolMarkup);
    }
    if OPEN_PROPOSAL_PATTERNS.iter().any(|p| p.is_match(text)) {
        return Err(GateRejection::OpenProposal);
    }
    if ASSISTANT_NARRATION_PATTERNS.iter().any(|p| p.is_match(text)) {
        return Err(GateRejection::Narration);
    }
    Ok(())
}

pub fn passes_user_gate(text: &str) -> bool {
    user_gate(text).is_ok()
}

pub fn passes_assistant_gate(text: &str) -> bool {
    assistant_gate(text).is_ok()
}

// ── Emoji handling ────────────────────────────────────────────────────────────

/// The standard emoji blocks. Variation selectors and ZWJ are treated as
/// glue, not as emoji in their own right.
fn is_emoji(c: char) -> bool {
    matches!(u32::from(c),
        0x1F300..=0x1F5FF   // symbols & pictographs
        | 0x1F600..=0x1F64F // emoticons
        | 0x1F680..=0x1F6FF // transport & map
        | 0x1F900..=0x1F9FF // supplemental symbols
        | 0x1FA70..=0x1FAFF // extended-A
        | 0x2600..=0x26FF   // miscellaneous symbols
        | 0x2700..=0x27BF   // dingbats
    )
}

fn is_emoji_glue(c: char) -> bool {
    matches!(u32::from(c), 0xFE0E | 0xFE0F | 0x200D | 0x1F3FB..=0x1F3FF)
}

fn emoji_count(text: &str) -> usize {
    text.chars().filter(|&c| is_emoji(c)).count()
}

fn is_emoji_only(text: &str) -> bool {
    let mut saw_emoji = false;
    for c in text.chars() {
        if is_emoji(c) {
            saw_emoji = true;
        } else if !c.is_whitespace() && !is_emoji_glue(c) {
            return false;
        }
    }
    saw_emoji
}

// ── Fenced code measurement ───────────────────────────────────────────────────

/// Characters inside triple-backtick fences. Segments alternate outside /
/// inside; an unclosed final fence counts as inside.
fn fenced_code_chars(text: &str) -> usize {
    text.split("```")
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, seg)| seg.chars().count())
        .sum()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_gate_rejects_short_and_long_texts() {
        assert!(!passes_user_gate("ok thanks!"));
        assert!(!passes_user_gate(""));
        assert!(!passes_user_gate(&"x".repeat(2001)));
        // 29 chars exactly is still too short.
        assert!(!passes_user_gate(&"a".repeat(29)));
    }

    #[test]
    fn user_gate_accepts_substantive_text() {
        assert!(passes_user_gate(
            "I have been using the new grocery-delivery service for three weeks and it works well."
        ));
    }

    #[test]
    fn user_gate_rejects_too_few_words() {
        // Long enough in characters, but only 5 words.
        assert!(!passes_user_gate("supercalifragilistic expialidocious pneumonoultramicroscopic silicovolcanoconiosis antidisestablishmentarianism"));
    }

    #[test]
    fn user_gate_rejects_injected_markers() {
        let text = "here is some context <relevant-memories> about the user that was injected upstream";
        assert!(!passes_user_gate(text));
        let refresh = "please note this block <core-memory-refresh> repeats stored state for the model";
        assert!(!passes_user_gate(refresh));
    }

    #[test]
    fn user_gate_rejects_platform_metadata_and_session_resets() {
        assert!(!passes_user_gate(
            "A new session was started via the scheduler and the previous context was discarded"
        ));
        assert!(!passes_user_gate(
            "[slack message id: 17283332] forwarded content from the general channel yesterday"
        ));
        assert!(!passes_user_gate(
            "[Heartbeat] periodic keep-alive ping issued by the gateway process at interval"
        ));
    }

    #[test]
    fn user_gate_rejects_excess_emoji() {
        assert!(!passes_user_gate(
            "This dinner was amazing 🎉🎉🎉🎉 and we should definitely come back here again soon"
        ));
        // Three emoji is the ceiling, not a violation.
        assert!(passes_user_gate(
            "This dinner was amazing 🎉🎉🎉 and we should definitely come back here again soon"
        ));
    }

    #[test]
    fn assistant_gate_is_strictly_stronger() {
        // Passes the user gate but narrates, so the assistant gate refuses it.
        let narration = "Let me check the deployment logs for that service and report back with findings.";
        assert!(passes_user_gate(narration));
        assert!(!passes_assistant_gate(narration));
    }

    #[test]
    fn assistant_gate_rejects_open_proposals() {
        assert!(!passes_assistant_gate(
            "Want me to submit that pull request for you once the remaining tests have passed?"
        ));
        assert!(!passes_assistant_gate(
            "The branch is rebased and green. Should I go ahead and merge it into main now?"
        ));
    }

    #[test]
    fn assistant_gate_rejects_code_dominant_messages() {
        let msg = format!(
            "Here is the fix applied to the parser module today:\n```\n{}\n```",
            "let x = compute_the_thing();\n".repeat(8)
        );
        assert!(!passes_assistant_gate(&msg));
    }

    #[test]
    fn assistant_gate_rejects_tool_markup_and_length() {
        assert!(!passes_assistant_gate(
            "<tool_result> the command finished with exit status zero and produced no output lines </tool_result>"
        ));
        assert!(!passes_assistant_gate(&"word ".repeat(300)));
    }

    #[test]
    fn assistant_gate_accepts_durable_statements() {
        assert!(passes_assistant_gate(
            "The production database is hosted in the Frankfurt region and failover targets Dublin."
        ));
    }

    #[test]
    fn emoji_only_text_is_rejected_regardless_of_spacing() {
        assert!(is_emoji_only("🎉 🎉 ✅"));
        assert!(!is_emoji_only("party 🎉"));
        assert!(!is_emoji_only("   "));
    }

    #[test]
    fn fenced_code_measurement_handles_unclosed_fences() {
        assert_eq!(fenced_code_chars("no code at all"), 0);
        assert_eq!(fenced_code_chars("a```bb```c"), 2);
        // Unclosed fence: everything after the opener counts.
        assert_eq!(fenced_code_chars("x```yyyy"), 4);
    }

    #[test]
    fn open_proposal_patterns_match_phase_seven_targets() {
        for text in [
            "Want me to submit that pull request for you?",
            "should I restart the staging cluster?",
            "Ready to deploy whenever you are?",
            "Would you like me to clean up the old branches?",
        ] {
            assert!(
                OPEN_PROPOSAL_PATTERNS.iter().any(|p| p.is_match(text)),
                "expected open-proposal match: {text}"
            );
        }
        assert!(
            !OPEN_PROPOSAL_PATTERNS
                .iter()
                .any(|p| p.is_match("I deployed the service and it is healthy."))
        );
    }
}
