//! Recover a JSON payload from free-form model output.

/// Extract the JSON payload from `raw`.
///
/// Tries, in order: the first fenced code block, a leading `json:` prefix,
/// a direct parse, then the largest balanced `{...}`/`[...]` substring that
/// parses (shrinking the right boundary until one does).
pub fn normalize_patch_output(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let fenced = extract_fenced_block(trimmed);
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(inner) = fenced {
        candidates.push(inner);
    }
    candidates.push(trimmed);

    for candidate in candidates {
        let body = strip_json_prefix(candidate.trim());
        if parses(body) {
            return Some(body.to_string());
        }
        if let Some(found) = largest_json_substring(body) {
            return Some(found.to_string());
        }
    }
    None
}

fn parses(text: &str) -> bool {
    !text.is_empty() && serde_json::from_str::<serde_json::Value>(text).is_ok()
}

/// Inner text of the first ``` fence, without the info string.
fn extract_fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_ticks = &text[open + 3..];
    let body_start = after_ticks.find('\n').map(|i| i + 1)?;
    let body = &after_ticks[body_start..];
    let close = body.find("```").unwrap_or(body.len());
    Some(body[..close].trim())
}

fn strip_json_prefix(text: &str) -> &str {
    match text.get(..5) {
        Some(head) if head.eq_ignore_ascii_case("json:") => text[5..].trim_start(),
        _ => text,
    }
}

/// Largest substring bounded by a matching opener/closer pair that parses.
fn largest_json_substring(text: &str) -> Option<&str> {
    let openers: Vec<(usize, u8)> = text
        .bytes()
        .enumerate()
        .filter(|(_, b)| *b == b'{' || *b == b'[')
        .collect();
    let closers: Vec<(usize, u8)> = text
        .bytes()
        .enumerate()
        .filter(|(_, b)| *b == b'}' || *b == b']')
        .collect();

    let mut best: Option<&str> = None;
    for &(start, open) in &openers {
        let want = if open == b'{' { b'}' } else { b']' };
        for &(end, close) in closers.iter().rev() {
            if end <= start {
                break;
            }
            let len = end - start + 1;
            if best.map(|b| len <= b.len()).unwrap_or(false) {
                break;
            }
            if close != want {
                continue;
            }
            let slice = &text[start..=end];
            if parses(slice) {
                best = Some(slice);
                break;
            }
        }
    }
    best
}
