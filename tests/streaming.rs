//! Streaming-parser behavior: progressive views, partial UTF-8, recovery.

use harmonium::{
    load_harmony_encoding, HarmonyEncoding, HarmonyEncodingName, Role, StreamState,
    StreamableParser,
};
use std::sync::LazyLock;

static ENCODING: LazyLock<HarmonyEncoding> =
    LazyLock::new(|| load_harmony_encoding(HarmonyEncodingName::HarmonyGptOss).unwrap());

const START: u32 = 200_000;
const END: u32 = 200_001;
const MESSAGE: u32 = 200_002;
const ASSISTANT: u32 = 200_009;

fn parser() -> StreamableParser {
    StreamableParser::new(ENCODING.clone(), None)
}

#[test]
fn progressive_views_during_streaming() {
    let tok = ENCODING.tokenizer();
    let mut p = parser();

    let head = tok.encode_with_special_tokens("<|start|><|assistant|><|channel|>analysis<|message|>Hel");
    for token in head {
        p.process(token).unwrap();
    }
    assert_eq!(p.state(), StreamState::Content);
    assert_eq!(p.current_role(), Some(Role::Assistant));
    assert_eq!(p.current_channel(), Some("analysis"));
    assert_eq!(p.current_content(), "Hel");
    assert!(p.last_content_delta().is_some());
    assert!(p.messages().is_empty());

    for token in tok.encode_ordinary("lo") {
        p.process(token).unwrap();
    }
    assert_eq!(p.current_content(), "Hello");

    p.process(END).unwrap();
    assert_eq!(p.state(), StreamState::ExpectStart);
    assert_eq!(p.messages().len(), 1);
    let message = &p.messages()[0];
    assert_eq!(message.author.role, Role::Assistant);
    assert_eq!(message.channel.as_deref(), Some("analysis"));
    assert_eq!(message.content[0].as_text(), Some("Hello"));
}

#[test]
fn split_code_point_delays_delta() {
    // "é" is C3 A9; the single-byte registry tokens are the byte values.
    let mut p = parser();
    for token in [START, ASSISTANT, MESSAGE] {
        p.process(token).unwrap();
    }
    p.process(0xC3).unwrap();
    assert_eq!(p.last_content_delta(), None);
    assert_eq!(p.current_content(), "");

    p.process(0xA9).unwrap();
    assert_eq!(p.last_content_delta(), Some("é"));
    assert_eq!(p.current_content(), "é");

    p.process(END).unwrap();
    assert_eq!(p.messages()[0].content[0].as_text(), Some("é"));
}

#[test]
fn delta_is_per_token_not_cumulative() {
    let tok = ENCODING.tokenizer();
    let mut p = parser();
    for token in [START, ASSISTANT, MESSAGE] {
        p.process(token).unwrap();
    }
    let mut deltas = String::new();
    for token in tok.encode_ordinary("one two three") {
        p.process(token).unwrap();
        if let Some(delta) = p.last_content_delta() {
            deltas.push_str(delta);
        }
    }
    assert_eq!(deltas, "one two three");
    assert_eq!(p.current_content(), "one two three");
}

#[test]
fn structural_token_produces_no_delta() {
    let mut p = parser();
    p.process(START).unwrap();
    assert_eq!(p.last_content_delta(), None);
    p.process(ASSISTANT).unwrap();
    assert_eq!(p.last_content_delta(), None);
}

#[test]
fn eos_finalizes_open_content() {
    let tok = ENCODING.tokenizer();
    let mut p = parser();
    for token in [START, ASSISTANT, MESSAGE] {
        p.process(token).unwrap();
    }
    for token in tok.encode_ordinary("unterminated") {
        p.process(token).unwrap();
    }
    p.process_eos().unwrap();
    assert_eq!(p.messages().len(), 1);
    assert_eq!(p.messages()[0].content[0].as_text(), Some("unterminated"));
}

#[test]
fn eos_on_partial_code_point_is_invalid_utf8() {
    let mut p = parser();
    for token in [START, ASSISTANT, MESSAGE, 0xC3] {
        p.process(token).unwrap();
    }
    let err = p.process_eos().unwrap_err();
    assert!(matches!(
        err,
        harmonium::HarmonyError::Tokenizer(harmonium::TokenizerError::InvalidUtf8)
    ));
}

#[test]
fn terminator_on_partial_code_point_is_invalid_utf8() {
    let mut p = parser();
    for token in [START, ASSISTANT, MESSAGE, 0xC3] {
        p.process(token).unwrap();
    }
    assert!(p.process(END).is_err());
}

#[test]
fn eos_outside_content_is_a_noop() {
    let mut p = parser();
    p.process_eos().unwrap();
    assert!(p.messages().is_empty());

    p.process(START).unwrap();
    p.process(ASSISTANT).unwrap();
    p.process_eos().unwrap();
    assert!(p.messages().is_empty());
}

#[test]
fn tokens_before_start_are_recorded_without_effect() {
    let tok = ENCODING.tokenizer();
    let mut p = parser();
    for token in tok.encode_ordinary("stray bytes") {
        p.process(token).unwrap();
    }
    assert_eq!(p.state(), StreamState::ExpectStart);
    assert!(p.messages().is_empty());

    let rest = tok.encode_with_special_tokens("<|start|><|assistant|><|message|>ok<|end|>");
    for token in rest {
        p.process(token).unwrap();
    }
    assert_eq!(p.messages().len(), 1);
    assert!(p.tokens().len() > 5, "stray tokens are still recorded");
}

#[test]
fn malformed_header_recovers() {
    let mut p = parser();
    p.process(START).unwrap();
    // Terminator inside a header is impossible.
    assert!(p.process(END).is_err());
    assert_eq!(p.state(), StreamState::ExpectStart);

    // The same parser keeps working afterwards.
    let tok = ENCODING.tokenizer();
    for token in tok.encode_with_special_tokens("<|start|><|assistant|><|message|>fine<|end|>") {
        p.process(token).unwrap();
    }
    assert_eq!(p.messages().len(), 1);
    assert_eq!(p.messages()[0].content[0].as_text(), Some("fine"));
}

#[test]
fn streaming_agrees_with_batch_parsing() {
    let tok = ENCODING.tokenizer();
    let text = "<|start|><|assistant|><|channel|>analysis<|message|>hmm<|end|>\
                <|start|><|assistant|><|channel|>final<|message|>done<|return|>";
    let tokens = tok.encode_with_special_tokens(text);

    let batch = ENCODING
        .parse_messages_from_completion_tokens(tokens.clone(), None)
        .unwrap();

    let mut p = parser();
    for token in tokens {
        p.process(token).unwrap();
    }
    p.process_eos().unwrap();

    assert_eq!(p.messages(), batch.as_slice());
}

#[test]
fn role_hint_starts_in_header() {
    let tok = ENCODING.tokenizer();
    let mut p = StreamableParser::new(ENCODING.clone(), Some(Role::Assistant));
    assert_eq!(p.state(), StreamState::Header);
    assert_eq!(p.current_role(), Some(Role::Assistant));

    let mut tokens = tok.encode_with_special_tokens("<|channel|>final<|message|>hi");
    tokens.push(200_006); // <|return|>
    for token in tokens {
        p.process(token).unwrap();
    }
    assert_eq!(p.messages().len(), 1);
    assert_eq!(p.messages()[0].author.role, Role::Assistant);
}

#[test]
fn role_hint_tolerates_explicit_start() {
    let tok = ENCODING.tokenizer();
    let mut p = StreamableParser::new(ENCODING.clone(), Some(Role::Assistant));
    for token in tok.encode_with_special_tokens("<|start|><|user|><|message|>hi<|end|>") {
        p.process(token).unwrap();
    }
    // The explicit role marker wins over the hint.
    assert_eq!(p.messages()[0].author.role, Role::User);
}

#[test]
fn state_json_snapshot() {
    let tok = ENCODING.tokenizer();
    let mut p = parser();
    for token in tok.encode_with_special_tokens("<|start|><|assistant|><|channel|>final<|message|>42") {
        p.process(token).unwrap();
    }
    let snapshot: serde_json::Value = serde_json::from_str(&p.state_json().unwrap()).unwrap();
    assert_eq!(snapshot["state"], "content");
    assert_eq!(snapshot["current_role"], "assistant");
    assert_eq!(snapshot["current_channel"], "final");
    assert_eq!(snapshot["current_content"], "42");
}

#[test]
fn content_may_contain_nonterminator_specials_as_text() {
    let mut p = parser();
    for token in [START, ASSISTANT, MESSAGE] {
        p.process(token).unwrap();
    }
    // A stray <|channel|> inside content decodes to its text form.
    p.process(200_003).unwrap();
    p.process(END).unwrap();
    assert_eq!(
        p.messages()[0].content[0].as_text(),
        Some("<|channel|>")
    );
}
