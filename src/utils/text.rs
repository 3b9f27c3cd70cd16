use once_cell::sync::Lazy;
use regex::Regex;

static CODE_FENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[a-zA-Z0-9_-]*\s*(.*?)\s*```").expect("valid code fence regex")
});

pub fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

/// Returns at most `limit` chars of `value`, cut on a char boundary.
pub fn take_chars(value: &str, limit: usize) -> &str {
    match value.char_indices().nth(limit) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}

/// Model replies often wrap JSON or prompts in markdown fences; keep the body.
pub fn strip_code_fence(value: &str) -> &str {
    let trimmed = value.trim();
    match CODE_FENCE_RE.captures(trimmed).and_then(|caps| caps.get(1)) {
        Some(body) => body.as_str(),
        None => trimmed,
    }
}

pub fn strip_wrapping_quotes(value: &str) -> &str {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return trimmed[1..trimmed.len() - 1].trim();
        }
    }
    trimmed
}
