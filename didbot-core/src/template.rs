//! Template rendering against machine memory.
//!
//! Two substitution styles are supported:
//!
//! - `FORMAT` - single positional slot: the first `%s` (or `%v`) in the
//!   format string is replaced by the triggering input, `%%` is a literal `%`.
//! - `FORMAT_MEM` - a template rendered against the whole register map:
//!   `"Hello {{ NAME }}"`. The leading-dot form `{{.NAME}}` is accepted as a
//!   shorthand for `{{ NAME }}`.
//!
//! Registers that are not set render as an empty string.

use crate::error::CoreError;
use crate::memory::Memory;
use minijinja::Environment;
use regex::Regex;
use std::sync::OnceLock;

fn dot_reference() -> &'static Regex {
    static DOT_REF: OnceLock<Regex> = OnceLock::new();
    DOT_REF.get_or_init(|| {
        Regex::new(r"\{\{(-?)\s*\.([A-Za-z_][A-Za-z0-9_]*)").expect("static regex is valid")
    })
}

/// Rewrites `{{.NAME}}` register references into plain `{{ NAME }}` form.
fn normalize(source: &str) -> std::borrow::Cow<'_, str> {
    dot_reference().replace_all(source, "{{$1 $2")
}

/// Renders a template against the register map.
pub fn render(source: &str, memory: &Memory) -> Result<String, CoreError> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    let source = normalize(source);
    env.render_str(&source, memory.as_map())
        .map_err(|e| CoreError::Template {
            reason: e.to_string(),
        })
}

/// Substitutes `input` into the single positional slot of `format`.
pub fn format_input(format: &str, input: &str) -> String {
    let mut out = String::with_capacity(format.len() + input.len());
    let mut chars = format.chars().peekable();
    let mut used = false;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some('s') | Some('v') if !used => {
                chars.next();
                out.push_str(input);
                used = true;
            }
            _ => out.push('%'),
        }
    }

    out
}

/// Generates a six digit PIN.
pub fn generate_pin() -> String {
    let n = uuid::Uuid::new_v4().as_u128() % 1_000_000;
    format!("{:06}", n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem(pairs: &[(&str, &str)]) -> Memory {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_render_dot_reference() {
        let out = render("echo {{.LINE}}", &mem(&[("LINE", "hi")])).unwrap();
        assert_eq!(out, "echo hi");
    }

    #[test]
    fn test_render_plain_reference() {
        let out = render("echo {{ LINE }}", &mem(&[("LINE", "hi")])).unwrap();
        assert_eq!(out, "echo hi");
    }

    #[test]
    fn test_render_multiple_registers() {
        let memory = mem(&[("NAME", "Alice"), ("EMAIL", "alice@example.com")]);
        let out = render("{{.NAME}} <{{ .EMAIL }}>", &memory).unwrap();
        assert_eq!(out, "Alice <alice@example.com>");
    }

    #[test]
    fn test_render_missing_register_is_empty() {
        let out = render("[{{.NOPE}}]", &Memory::new()).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn test_render_syntax_error() {
        let result = render("{{ unclosed", &Memory::new());
        assert!(matches!(result, Err(CoreError::Template { .. })));
    }

    #[test]
    fn test_format_single_slot() {
        assert_eq!(format_input("she says: %s", "TEST"), "she says: TEST");
        assert_eq!(format_input("%v!", "hey"), "hey!");
    }

    #[test]
    fn test_format_only_first_slot() {
        assert_eq!(format_input("%s and %s", "a"), "a and %s");
    }

    #[test]
    fn test_format_escaped_percent() {
        assert_eq!(format_input("100%% %s", "done"), "100% done");
        assert_eq!(format_input("no slot", "x"), "no slot");
        assert_eq!(format_input("trailing %", "x"), "trailing %");
    }

    #[test]
    fn test_generate_pin() {
        let pin = generate_pin();
        assert_eq!(pin.len(), 6);
        assert!(pin.chars().all(|c| c.is_ascii_digit()));
    }
}
