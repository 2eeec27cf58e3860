/// Extract the final answer from a response transcript.
///
/// Returns everything after the last occurrence of `marker`, trimmed. When
/// the marker does not occur (or is empty) the whole text is the answer.
pub fn extract_answer<'a>(text: &'a str, marker: &str) -> &'a str {
    if marker.is_empty() {
        return text;
    }
    match text.rfind(marker) {
        Some(pos) => text[pos + marker.len()..].trim(),
        None => text,
    }
}
