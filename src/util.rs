//! Shared helpers for reading structured data out of free-form agent output.

use std::any::Any;
use std::collections::HashMap;

/// Find the first balanced `[...]` span in `text` that parses as JSON.
///
/// Brackets inside JSON strings are ignored while matching. Spans that are
/// balanced but not valid JSON (e.g. `[note]` in prose) are skipped and the
/// search continues at the next `[`.
pub fn extract_json_array(text: &str) -> Option<&str> {
    // start offset -> end offset of its span, or None if it never closes
    let mut spans: HashMap<usize, Option<usize>> = HashMap::new();
    let mut from = 0;
    while let Some(offset) = text[from..].find('[') {
        let start = from + offset;
        if !spans.contains_key(&start) {
            record_spans(text, start, &mut spans);
        }
        if let Some(Some(end)) = spans.get(&start) {
            let candidate = &text[start..*end];
            if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                return Some(candidate);
            }
        }
        from = start + 1;
    }
    None
}

/// Scan the bracketed span opening at `text[start]`, recording the end of
/// every `[` passed outside a string along the way. Those starts share this
/// scan's string state, so they never need a scan of their own.
fn record_spans(text: &str, start: usize, spans: &mut HashMap<usize, Option<usize>>) {
    let mut open: Vec<Option<usize>> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        let at = start + i;
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => open.push(Some(at)),
            '{' => open.push(None),
            ']' | '}' => {
                if let Some(Some(opened)) = open.pop() {
                    spans.entry(opened).or_insert(Some(at + 1));
                }
                if open.is_empty() {
                    return;
                }
            }
            _ => {}
        }
    }
    for opened in open.into_iter().flatten() {
        spans.entry(opened).or_insert(None);
    }
}

/// Text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
