use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use super::JobRole;
use crate::error::{RelayError, Result};

/// A job manifest with `{{Key}}` placeholders in its string values
#[derive(Debug, Clone, PartialEq)]
pub struct JobTemplate {
    source: Value,
}

impl JobTemplate {
    pub fn parse(text: &str) -> Result<Self> {
        let source: Value = serde_json::from_str(text)?;
        if !source.is_object() {
            return Err(RelayError::invalid_argument("job template must be a JSON object"));
        }
        Ok(Self { source })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| RelayError::io("read", path, e))?;
        Self::parse(&text).map_err(|e| match e {
            RelayError::Json(e) => {
                RelayError::invalid_argument(format!("cannot parse {}: {}", path.display(), e))
            }
            other => other,
        })
    }

    /// Substitute `values` into every string in the template.
    ///
    /// A placeholder without a value is an error rather than an empty string,
    /// so a typo in a template cannot silently submit a broken job.
    pub fn render(&self, values: &BTreeMap<&'static str, String>) -> Result<Value> {
        let mut out = self.source.clone();
        substitute(&mut out, values)?;
        Ok(out)
    }
}

fn substitute(value: &mut Value, values: &BTreeMap<&'static str, String>) -> Result<()> {
    match value {
        Value::String(s) => {
            if s.contains("{{") {
                *s = expand(s, values)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute(item, values)?;
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute(item, values)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn expand(text: &str, values: &BTreeMap<&'static str, String>) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            RelayError::invalid_argument(format!("unterminated placeholder in {:?}", text))
        })?;
        let key = after[..end].trim().trim_start_matches('.');
        let value = values.get(key).ok_or_else(|| {
            RelayError::invalid_argument(format!("job template uses unknown value {{{{{}}}}}", key))
        })?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// The templates for both job roles
#[derive(Debug, Clone)]
pub struct JobTemplates {
    pub transcode: JobTemplate,
    pub upload: JobTemplate,
}

impl JobTemplates {
    /// Load `transcode.json` and `upload.json` from a directory
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            transcode: JobTemplate::load(&dir.join("transcode.json"))?,
            upload: JobTemplate::load(&dir.join("upload.json"))?,
        })
    }

    pub fn for_role(&self, role: JobRole) -> &JobTemplate {
        match role {
            JobRole::Transcode => &self.transcode,
            JobRole::Upload => &self.upload,
        }
    }
}
