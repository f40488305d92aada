//! Pure secret-masking function applied before every Log Sink append.
//!
//! Per spec.md §4.4, the Redactor masks exact host-token substrings,
//! `Bearer <token>` / `Authorization: <token>` patterns, `apikey=`/`token=`
//! query parameters, and any agent API key value known from process env.
//! It deliberately does not attempt general PII scrubbing or URL
//! sanitization beyond those patterns (spec.md §4.4 non-goals).

const MASK: &str = "[REDACTED]";

/// A redactor bound to the secret values known for one in-flight pipeline
/// run: the user's host access token and agent API key, plus whatever
/// process-env agent keys are configured as defaults. Constructed fresh
/// per Executor run from already-decrypted credentials — it never touches
/// the Credential Store itself.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new() -> Self {
        Self { secrets: Vec::new() }
    }

    /// Register a secret value to mask. Empty strings are ignored — masking
    /// an empty substring would match everywhere.
    pub fn with_secret(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.secrets.push(value);
        }
        self
    }

    pub fn add_secret(&mut self, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.secrets.push(value);
        }
    }

    /// Mask every known secret value, `Bearer`/`Authorization` headers, and
    /// `apikey=`/`token=` query parameters in `input`. Idempotent: running
    /// this twice over its own output is a no-op (spec.md §8 property 8),
    /// since `[REDACTED]` never itself matches a registered secret or the
    /// header/query patterns below.
    pub fn redact(&self, input: &str) -> String {
        let mut out = input.to_string();

        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), MASK);
            }
        }

        out = redact_bearer(&out);
        out = redact_authorization_header(&out);
        out = redact_query_param(&out, "apikey");
        out = redact_query_param(&out, "token");

        out
    }
}

fn redact_bearer(input: &str) -> String {
    redact_keyword_value(input, "Bearer ")
}

fn redact_authorization_header(input: &str) -> String {
    redact_keyword_value(input, "Authorization: ")
}

/// Replace the token that follows `keyword` (up to the next whitespace)
/// with the mask, for every occurrence in `input`.
fn redact_keyword_value(input: &str, keyword: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find(keyword) {
        out.push_str(&rest[..pos + keyword.len()]);
        let after = &rest[pos + keyword.len()..];
        let value_len = after.find(char::is_whitespace).unwrap_or(after.len());
        if value_len == 0 {
            rest = after;
            continue;
        }
        out.push_str(MASK);
        rest = &after[value_len..];
    }
    out.push_str(rest);
    out
}

/// Replace `name=<value>` with `name=[REDACTED]` for every occurrence,
/// where `<value>` runs until the next `&`, whitespace, or end of string.
fn redact_query_param(input: &str, name: &str) -> String {
    let pattern = format!("{}=", name);
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    loop {
        match rest.find(pattern.as_str()) {
            Some(pos) => {
                out.push_str(&rest[..pos]);
                out.push_str(&pattern);
                let after = &rest[pos + pattern.len()..];
                let value_len = after
                    .find(|c: char| c == '&' || c.is_whitespace())
                    .unwrap_or(after.len());
                out.push_str(MASK);
                rest = &after[value_len..];
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out
}
