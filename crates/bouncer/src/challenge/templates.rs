//! Positional `{}` template rendering for messages and prompts.

use std::fmt::{Display, Write};

/// Fill `{}` placeholders left to right. Placeholders without an argument
/// are kept verbatim; extra arguments are ignored.
pub fn render(template: &str, args: &[&dyn Display]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut rest = template;

    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        match args.next() {
            Some(arg) => {
                let _ = write!(out, "{}", arg);
            }
            None => out.push_str("{}"),
        }
        rest = &rest[pos + 2..];
    }

    out.push_str(rest);
    out
}
