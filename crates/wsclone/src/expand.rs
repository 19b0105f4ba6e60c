use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::error::{Error, Result};

/// Expands build variables inside configured strings.
pub trait VarExpander {
    fn expand(&self, raw: &str) -> Result<String>;
}

/// Expansion backed by a fixed set of variables.
///
/// `${NAME}` and `$NAME` are substituted, `$$` yields a literal `$`.
/// Referencing an unknown variable fails the whole expansion.
#[derive(Debug, Clone, Default)]
pub struct MapExpander {
    vars: BTreeMap<String, String>,
}

impl MapExpander {
    pub fn new(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

fn var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\$|\$\{([^}]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").expect("valid variable regex")
    })
}

impl VarExpander for MapExpander {
    fn expand(&self, raw: &str) -> Result<String> {
        let mut missing = Vec::<String>::new();
        let out = var_re().replace_all(raw, |caps: &Captures<'_>| {
            let Some(name) = caps.get(1).or_else(|| caps.get(2)) else {
                return "$".to_string();
            };
            match self.vars.get(name.as_str().trim()) {
                Some(v) => v.clone(),
                None => {
                    missing.push(name.as_str().to_string());
                    caps[0].to_string()
                }
            }
        });
        if !missing.is_empty() {
            return Err(Error::msg(format!(
                "unknown variable(s) in '{}': {}",
                raw,
                missing.join(", ")
            )));
        }
        Ok(out.into_owned())
    }
}

/// Expand `raw`, falling back to it verbatim when expansion fails.
pub fn expand_or_raw(expander: &dyn VarExpander, raw: &str) -> String {
    match expander.expand(raw) {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(pattern = raw, error = %e, "variable expansion failed, using raw value");
            raw.to_string()
        }
    }
}
