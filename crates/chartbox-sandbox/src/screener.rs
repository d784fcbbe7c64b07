//! Pre-execution screening of callback sources.
//!
//! This screener is **defense-in-depth**: the V8 isolate, its heap ceiling
//! and the execution watchdog are the real boundary. These checks reject
//! obviously hostile text before a context is spent on it and give readable
//! reasons for the rejection.
//!
//! Screening is a pure function of the source text.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::SandboxError;

/// Maximum callback source size in bytes (64 KB).
pub const DEFAULT_MAX_SOURCE_SIZE: usize = 64 * 1024;

/// Deny-list of `(label, pattern)` pairs. The label is reported on rejection.
const DENY_LIST: &[(&str, &str)] = &[
    // Module loading and code generation
    ("require(", r"\brequire\s*\("),
    ("import", r"\bimport\b"),
    ("eval(", r"\beval\s*\("),
    ("Function(", r"\bFunction\s*\("),
    // Host objects
    ("process", r"\bprocess\b"),
    ("global", r"\bglobal(This)?\b"),
    ("window", r"\bwindow\b"),
    ("Deno", r"\bDeno\b"),
    ("Reflect", r"\bReflect\b"),
    ("Proxy", r"\bProxy\b"),
    ("WebAssembly", r"\bWebAssembly\b"),
    // Prototype chain and receiver reflection
    ("constructor", r"(?i)constructor"),
    ("prototype", r"prototype"),
    ("__proto__", r"__proto__"),
    ("this", r"\bthis\b"),
    ("arguments", r"\barguments\b"),
    ("callee", r"\bcallee\b"),
    // Dynamic property names
    ("[\"", r#"\[\s*['"`]"#),
    // String obfuscation
    ("fromCharCode", r"(?i)fromCharCode"),
    ("fromCodePoint", r"(?i)fromCodePoint"),
    ("unescape", r"(?i)unescape"),
    ("\\u escape", r"\\u(\{|[0-9a-fA-F]{4})"),
    ("\\x escape", r"\\x[0-9a-fA-F]{2}"),
    // Callbacks run synchronously per data point
    ("async", r"\basync\b"),
    ("await", r"\bawait\b"),
    ("Promise", r"\bPromise\b"),
];

static DENY_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    DENY_LIST
        .iter()
        .map(|(label, pattern)| (*label, Regex::new(pattern).expect("static regex is valid")))
        .collect()
});

/// Whether `source` passes screening with the default size limit.
pub fn accepts(source: &str) -> bool {
    screen(source, None).is_ok()
}

/// Screen a callback source, returning the first reason it is rejected.
pub fn screen(source: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_SOURCE_SIZE);

    // 1. Size limit
    if source.len() > max {
        return Err(SandboxError::CodeTooLarge {
            max,
            actual: source.len(),
        });
    }

    // 2. Empty source
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::ValidationFailed {
            reason: "source is empty".into(),
        });
    }

    // 3. Anonymous function literal only
    if !starts_with_function_token(trimmed) {
        return Err(SandboxError::ValidationFailed {
            reason: "source must be a `function` literal".into(),
        });
    }

    // 4. Deny-list
    for (label, pattern) in DENY_PATTERNS.iter() {
        if pattern.is_match(trimmed) {
            return Err(SandboxError::BannedPattern {
                pattern: (*label).to_string(),
            });
        }
    }

    Ok(())
}

fn starts_with_function_token(source: &str) -> bool {
    match source.strip_prefix("function") {
        Some(rest) => rest
            .chars()
            .next()
            .is_some_and(|c| c.is_whitespace() || c == '(' || c == '*'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BENIGN: &[&str] = &[
        "function(v){return v[1];}",
        "function(p){return p.data[1]>100?'red':'blue';}",
        "function (value) { return Math.sqrt(value[2]) * 4; }",
        "  function(params) {\n  var d = params.data;\n  return d[0] > d[1] ? '#c23531' : '#2f4554';\n}  ",
        "function size(v) { return v.length > 2 ? v[2] / 10 : 5; }",
        "function(p){ return p.name === 'north' ? 1 : 0; }",
    ];

    const ADVERSARIAL: &[&str] = &[
        "function(){return process.exit()}",
        "function(){return this.constructor}",
        "function(){return global.require('fs')}",
        "function(){return globalThis}",
        "function(){return eval('1+1')}",
        "function(){return new Function('return 1')()}",
        "function(){ return import('fs'); }",
        "function(){return window.location}",
        "function(){return Deno.readFile('/etc/passwd')}",
        "function(v){return v['constructor']}",
        "function(v){return v[\"x\"]}",
        "function(v){return v[`x`]}",
        "function(){return ({}).__proto__}",
        "function(){return Object.prototype}",
        "function(){return arguments.callee}",
        "function(){return String.fromCharCode(101,118,97,108)}",
        "function(){return unescape('%65')}",
        "function(){return '\\u0065val'}",
        "function(){return '\\u{65}val'}",
        "function(){return '\\x65val'}",
        "function(){return Reflect.ownKeys({})}",
        "function(){return new Proxy({}, {})}",
        "function(){return Promise.resolve(1)}",
        "function(){ return (async () => 1)(); }",
        "function(){ return CONSTRUCTOR; }",
    ];

    #[test]
    fn accepts_benign_corpus() {
        for source in BENIGN {
            assert!(accepts(source), "should accept: {source}");
        }
    }

    #[test]
    fn rejects_adversarial_corpus() {
        for source in ADVERSARIAL {
            assert!(!accepts(source), "should reject: {source}");
        }
    }

    #[test]
    fn screening_is_deterministic() {
        for source in BENIGN.iter().chain(ADVERSARIAL) {
            assert_eq!(accepts(source), accepts(source));
        }
    }

    #[test]
    fn rejects_non_function_prefixes() {
        for source in [
            "(v) => v[1]",
            "v => v",
            "return 1",
            "class A {}",
            "{ color: 'red' }",
            "functional(v)",
            "function",
            "red",
            "async function(){}",
        ] {
            let err = screen(source, None).unwrap_err();
            assert!(
                matches!(err, SandboxError::ValidationFailed { .. }),
                "expected structural rejection for {source}, got {err:?}"
            );
        }
    }

    #[test]
    fn accepts_generator_and_spaced_forms() {
        assert!(accepts("function* (v) { yield v; }"));
        assert!(accepts("function\t(v){return v;}"));
    }

    #[test]
    fn rejects_empty_source() {
        assert!(screen("", None).is_err());
        assert!(matches!(
            screen("   \n", None),
            Err(SandboxError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn rejects_oversized_source() {
        let big = format!("function(v){{return v;}}{}", " ".repeat(DEFAULT_MAX_SOURCE_SIZE));
        let err = screen(&big, None).unwrap_err();
        assert!(matches!(err, SandboxError::CodeTooLarge { .. }));
    }

    #[test]
    fn custom_max_size() {
        let source = "function(v){return v;}";
        assert!(screen(source, Some(5)).is_err());
        assert!(screen(source, Some(500)).is_ok());
    }

    #[test]
    fn reports_matched_label() {
        let err = screen("function(){return process.env.SECRET}", None).unwrap_err();
        match err {
            SandboxError::BannedPattern { pattern } => assert_eq!(pattern, "process"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn numeric_bracket_access_is_allowed() {
        assert!(accepts("function(v){ return v [ 0 ] + v[1]; }"));
    }

    #[test]
    fn identifiers_containing_banned_words_as_substrings_pass() {
        // Word boundaries: `processed`, `thisValue` and `awaiting` are fine.
        assert!(accepts("function(p){ return p.processed ? p.thisValue : p.awaiting; }"));
    }
}
