use serde_json::Value;
use std::borrow::Cow;

/// Alert is a single notification of an Alertmanager webhook batch.
/// Its fields are opaque, apart from the "Labels" object which identifies it.
pub type Alert = serde_json::Map<String, Value>;

/// Field of an Alert holding its identifying label set.
pub const LABELS: &str = "Labels";
/// Separator between rendered label values of an AlertId.
pub const SEPARATOR: &str = ":";

/// AlertId is the canonical identity of an Alert, derived from its labels.
/// It's the values of the label set, joined by SEPARATOR in ascending order of
/// their label names. Label values which themselves contain SEPARATOR may
/// produce colliding identities for distinct label sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertId(String);

impl AlertId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AlertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the AlertId of `alert` from its "Labels" object.
pub fn derive(alert: &Alert) -> Result<AlertId, crate::Error> {
    let labels = match alert.get(LABELS) {
        Some(Value::Object(labels)) => labels,
        Some(_) => return Err(crate::Error::LabelsNotObject),
        None => return Err(crate::Error::MissingLabels),
    };

    // Map iteration order depends on whether serde_json's `preserve_order`
    // feature is enabled, so don't rely on it.
    let mut names: Vec<&String> = labels.keys().collect();
    names.sort();

    let values = names
        .into_iter()
        .map(|name| render(name, &labels[name]))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AlertId(values.join(SEPARATOR)))
}

fn render<'v>(name: &str, value: &'v Value) -> Result<Cow<'v, str>, crate::Error> {
    match value {
        Value::String(s) => Ok(Cow::Borrowed(s)),
        Value::Number(n) => Ok(Cow::Owned(n.to_string())),
        Value::Bool(b) => Ok(Cow::Owned(b.to_string())),
        Value::Null => Ok(Cow::Borrowed("<nil>")),
        Value::Array(_) | Value::Object(_) => Err(crate::Error::LabelNotScalar(name.to_string())),
    }
}
