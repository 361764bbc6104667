// src/proxy/circuit.rs

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

// The proxy announces hops as e.g. `circuit entry hop: 7f3a...`.
static ENTRY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bentry\s+hop\s*[:=]\s*([A-Za-z0-9~=._-]+)").expect("valid entry regex"));
static MIDDLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bmiddle\s+hop\s*[:=]\s*([A-Za-z0-9~=._-]+)").expect("valid middle regex"));
static EXIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bexit\s+hop\s*[:=]\s*([A-Za-z0-9~=._-]+)").expect("valid exit regex"));

/// Relay identities of the current garlic circuit, learnt from proxy output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Circuit {
    pub entry: Option<String>,
    pub middle: Option<String>,
    pub exit: Option<String>,
}

impl Circuit {
    /// Pick up any hop mentioned in `line`. Hops that do not match keep their
    /// previous value. Returns true if anything changed.
    pub fn observe(&mut self, line: &str) -> bool {
        let mut changed = false;
        for (re, slot) in [
            (&*ENTRY_RE, &mut self.entry),
            (&*MIDDLE_RE, &mut self.middle),
            (&*EXIT_RE, &mut self.exit),
        ] {
            if let Some(found) = re.captures(line).and_then(|c| c.get(1)) {
                if slot.as_deref() != Some(found.as_str()) {
                    *slot = Some(found.as_str().to_string());
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn is_complete(&self) -> bool {
        self.entry.is_some() && self.middle.is_some() && self.exit.is_some()
    }

    pub fn clear(&mut self) {
        *self = Circuit::default();
    }
}
