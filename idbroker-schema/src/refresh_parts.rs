use std::fmt;

/// The triple every stored credential reduces to: a refresh token plus the
/// two optional project identifiers the OAuth dance can attach to it.
///
/// Encoded as `refreshToken|projectId|managedProjectId`, preserving empty
/// trailing segments so `"r|p|"` and `"r|p"` decode to different values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefreshParts {
    pub refresh_token: String,
    pub project_id: Option<String>,
    pub managed_project_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    input_len: usize,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "malformed credential: no refresh token in {} byte input",
            self.input_len
        )
    }
}

impl std::error::Error for DecodeError {}

impl RefreshParts {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            project_id: None,
            managed_project_id: None,
        }
    }

    /// Serialize to the opaque `refreshToken|projectId|managedProjectId` form.
    ///
    /// Always emits exactly two separators so the decoder can distinguish
    /// "field omitted" from "field present but empty".
    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}",
            self.refresh_token,
            self.project_id.as_deref().unwrap_or(""),
            self.managed_project_id.as_deref().unwrap_or("")
        )
    }

    /// Parse the opaque credential string. Splits on the first two `|`
    /// only, so a refresh token containing `|` (shouldn't happen, but the
    /// codec doesn't assume it won't) never corrupts the trailing fields.
    pub fn decode(input: &str) -> Result<Self, DecodeError> {
        let mut parts = input.splitn(3, '|');
        let refresh_token = parts.next().unwrap_or("");
        if refresh_token.is_empty() {
            return Err(DecodeError {
                input_len: input.len(),
            });
        }
        let project_id = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let managed_project_id = parts.next().filter(|s| !s.is_empty()).map(str::to_string);

        Ok(Self {
            refresh_token: refresh_token.to_string(),
            project_id,
            managed_project_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_full_triple() {
        let parts = RefreshParts {
            refresh_token: "r1".into(),
            project_id: Some("p1".into()),
            managed_project_id: Some("mp1".into()),
        };
        let encoded = parts.encode();
        assert_eq!(encoded, "r1|p1|mp1");
        assert_eq!(RefreshParts::decode(&encoded).unwrap(), parts);
    }

    #[test]
    fn missing_fields_decode_to_none() {
        let parts = RefreshParts::decode("r1").unwrap();
        assert_eq!(parts.project_id, None);
        assert_eq!(parts.managed_project_id, None);
    }

    #[test]
    fn trailing_empty_segment_is_distinct_from_omitted() {
        let with_trailing_empty = RefreshParts::decode("r1|p1|").unwrap();
        let without_trailing = RefreshParts::decode("r1|p1").unwrap();
        assert_eq!(with_trailing_empty.managed_project_id, None);
        assert_eq!(without_trailing.managed_project_id, None);
        // both decode the same way, but the encoder must still always emit
        // the trailing separator rather than trimming it off
        assert_eq!(with_trailing_empty.encode(), "r1|p1|");
    }

    #[test]
    fn empty_refresh_token_is_malformed() {
        assert!(RefreshParts::decode("").is_err());
        assert!(RefreshParts::decode("|p1|mp1").is_err());
    }

    #[test]
    fn pipe_in_trailing_field_is_preserved_verbatim() {
        let parts = RefreshParts {
            refresh_token: "r1".into(),
            project_id: Some("p1".into()),
            managed_project_id: Some("a|b".into()),
        };
        let decoded = RefreshParts::decode(&parts.encode()).unwrap();
        assert_eq!(decoded.managed_project_id.as_deref(), Some("a|b"));
    }
}
