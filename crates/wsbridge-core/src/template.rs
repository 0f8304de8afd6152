//! `${name}` placeholder substitution for outbound URL templates.
//!
//! A placeholder with no matching variable is an error, never an empty
//! string: a partially substituted URL must not be dialed. A variable whose
//! value is the empty string is substituted normally.

use crate::error::{BridgeError, BridgeResult};
use std::collections::HashMap;

/// Substitute every `${name}` in `template` from `vars`.
pub fn resolve(template: &str, vars: &HashMap<String, String>) -> BridgeResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            BridgeError::InvalidTemplate(format!("unterminated placeholder in {template}"))
        })?;
        let name = after[..end].trim();
        if name.is_empty() {
            return Err(BridgeError::InvalidTemplate(format!(
                "empty placeholder in {template}"
            )));
        }
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => return Err(BridgeError::UnresolvedPlaceholder(name.to_string())),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
