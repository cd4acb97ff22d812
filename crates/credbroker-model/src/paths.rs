use crate::ModelError;

const METADATA_SEGMENT: &str = "meta";
const INTENT_SEGMENT: &str = "intent";
const MAX_ID_LEN: usize = 128;

/// Credential-store path layout for one broker deployment.
///
/// Everything the broker writes lives under a single configured prefix:
/// - `<prefix>/<instance>`         secret payload (what bindings point at)
/// - `<prefix>/meta/<instance>`    instance record
/// - `<prefix>/intent/<instance>`  in-flight operation marker
///
/// Instance ids never contain `/`, so a payload path is always exactly one
/// segment below the prefix and can't alias a metadata or intent path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    prefix: String,
}

impl StorePaths {
    pub fn new(prefix: &str) -> Result<Self, ModelError> {
        let trimmed = prefix.trim_end_matches('/');
        if trimmed.is_empty() || trimmed == "/" {
            return Err(ModelError::InvalidPrefix(
                "credential-store prefix must not be empty".to_owned(),
            ));
        }
        if !trimmed.starts_with('/') {
            return Err(ModelError::InvalidPrefix(format!(
                "credential-store prefix must be absolute: '{prefix}'"
            )));
        }
        if trimmed[1..].split('/').any(str::is_empty) {
            return Err(ModelError::InvalidPrefix(format!(
                "credential-store prefix has an empty segment: '{prefix}'"
            )));
        }
        Ok(Self {
            prefix: trimmed.to_owned(),
        })
    }

    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    pub fn payload_path(&self, instance_id: &str) -> String {
        format!("{}/{instance_id}", self.prefix)
    }

    #[inline]
    pub fn metadata_path(&self, instance_id: &str) -> String {
        format!("{}/{METADATA_SEGMENT}/{instance_id}", self.prefix)
    }

    #[inline]
    pub fn intent_path(&self, instance_id: &str) -> String {
        format!("{}/{INTENT_SEGMENT}/{instance_id}", self.prefix)
    }
}

/// Reject identifiers that would break the path layout.
pub fn validate_identifier(kind: &str, id: &str) -> Result<(), ModelError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(ModelError::InvalidIdentifier(format!(
            "{kind} must be 1-{MAX_ID_LEN} characters"
        )));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
    {
        return Err(ModelError::InvalidIdentifier(format!(
            "{kind} must match [a-zA-Z0-9._-]: '{id}'"
        )));
    }
    if id == "." || id == ".." {
        return Err(ModelError::InvalidIdentifier(format!(
            "{kind} must not be a relative path component"
        )));
    }
    Ok(())
}
