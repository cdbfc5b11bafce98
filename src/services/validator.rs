//! Stateless checks applied to new sessions and incoming parts.

use crate::services::{
    error::{UploadError, UploadResult},
    session::{SessionSpec, UploadSession},
};

/// Hard limits every session and part is checked against.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_part_size: u64,
    pub max_upload_size: u64,
    pub allowed_content_types: Vec<String>,
}

impl UploadLimits {
    /// Compares the media type only, ignoring parameters such as `charset`.
    pub fn allows(&self, content_type: &str) -> bool {
        let essence = media_type(content_type);
        self.allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(essence))
    }
}

fn media_type(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or("").trim()
}

/// Validate a session request and return the number of parts it implies.
pub fn validate_session_spec(spec: &SessionSpec, limits: &UploadLimits) -> UploadResult<u32> {
    if !limits.allows(&spec.content_type) {
        return Err(UploadError::UnsupportedType(spec.content_type.clone()));
    }
    if spec.total_size == 0 {
        return Err(UploadError::InvalidRequest(
            "total_size must be at least 1 byte".into(),
        ));
    }
    if spec.total_size > limits.max_upload_size {
        return Err(UploadError::InvalidRequest(format!(
            "total_size {} exceeds the {} byte limit",
            spec.total_size, limits.max_upload_size
        )));
    }
    if spec.part_size == 0 || spec.part_size > limits.max_part_size {
        return Err(UploadError::InvalidRequest(format!(
            "part_size must be between 1 and {} bytes",
            limits.max_part_size
        )));
    }
    u32::try_from(spec.total_size.div_ceil(spec.part_size))
        .map_err(|_| UploadError::InvalidRequest("too many parts".into()))
}

/// Validate one part against its session.
pub fn validate_part(
    part_len: u64,
    content_type: &str,
    index: u32,
    session: &UploadSession,
    limits: &UploadLimits,
) -> UploadResult<()> {
    session.ensure_open()?;
    if index >= session.expected_part_count {
        return Err(UploadError::OutOfRange {
            index,
            expected: session.expected_part_count,
        });
    }
    if !limits.allows(content_type) {
        return Err(UploadError::UnsupportedType(content_type.to_string()));
    }
    if part_len > limits.max_part_size {
        return Err(UploadError::InvalidPart(format!(
            "{} bytes exceeds the {} byte part limit",
            part_len, limits.max_part_size
        )));
    }
    let expected = session.expected_part_size(index);
    if part_len != expected {
        return Err(UploadError::InvalidPart(format!(
            "part {} must be {} bytes, got {}",
            index, expected, part_len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::session::{SessionStatus, tests::sample_session};

    fn limits() -> UploadLimits {
        UploadLimits {
            max_part_size: 8,
            max_upload_size: 64,
            allowed_content_types: vec!["text/plain".into(), "image/png".into()],
        }
    }

    fn spec(content_type: &str, total_size: u64, part_size: u64) -> SessionSpec {
        SessionSpec {
            owner: "anonymous".into(),
            content_type: content_type.into(),
            total_size,
            part_size,
            filename: None,
            uploader_ip: None,
        }
    }

    #[test]
    fn spec_yields_part_count() {
        assert_eq!(validate_session_spec(&spec("text/plain", 20, 8), &limits()).unwrap(), 3);
        assert_eq!(validate_session_spec(&spec("image/png", 16, 8), &limits()).unwrap(), 2);
    }

    #[test]
    fn spec_rejections() {
        let l = limits();
        assert!(matches!(
            validate_session_spec(&spec("application/zip", 8, 8), &l),
            Err(UploadError::UnsupportedType(_))
        ));
        assert!(matches!(
            validate_session_spec(&spec("text/plain", 0, 8), &l),
            Err(UploadError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_session_spec(&spec("text/plain", 65, 8), &l),
            Err(UploadError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_session_spec(&spec("text/plain", 16, 9), &l),
            Err(UploadError::InvalidRequest(_))
        ));
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        assert!(limits().allows("Text/Plain; charset=utf-8"));
        assert!(!limits().allows("text/html"));
    }

    #[test]
    fn part_checks() {
        let l = UploadLimits {
            max_part_size: 4,
            ..limits()
        };
        let session = sample_session(10, 4);

        validate_part(4, "text/plain", 0, &session, &l).unwrap();
        validate_part(2, "text/plain", 2, &session, &l).unwrap();

        assert!(matches!(
            validate_part(4, "text/plain", 3, &session, &l),
            Err(UploadError::OutOfRange { index: 3, expected: 3 })
        ));
        assert!(matches!(
            validate_part(4, "application/zip", 0, &session, &l),
            Err(UploadError::UnsupportedType(_))
        ));
        assert!(matches!(
            validate_part(5, "text/plain", 0, &session, &l),
            Err(UploadError::InvalidPart(_))
        ));
        assert!(matches!(
            validate_part(3, "text/plain", 0, &session, &l),
            Err(UploadError::InvalidPart(_))
        ));
    }

    #[test]
    fn part_for_closed_session() {
        let mut session = sample_session(8, 4);
        session.transition(SessionStatus::Completing).unwrap();
        assert!(matches!(
            validate_part(4, "text/plain", 0, &session, &limits()),
            Err(UploadError::SessionNotOpen { .. })
        ));
    }
}
