use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum length for response bodies kept in error details
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error codes the identity provider reports in `error.message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorCode {
    EmailExists,
    OperationNotAllowed,
    TooManyAttemptsTryLater,
    EmailNotFound,
    InvalidPassword,
    UserDisabled,
}

impl ProviderErrorCode {
    pub const ALL: [ProviderErrorCode; 6] = [
        ProviderErrorCode::EmailExists,
        ProviderErrorCode::OperationNotAllowed,
        ProviderErrorCode::TooManyAttemptsTryLater,
        ProviderErrorCode::EmailNotFound,
        ProviderErrorCode::InvalidPassword,
        ProviderErrorCode::UserDisabled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorCode::EmailExists => "EMAIL_EXISTS",
            ProviderErrorCode::OperationNotAllowed => "OPERATION_NOT_ALLOWED",
            ProviderErrorCode::TooManyAttemptsTryLater => "TOO_MANY_ATTEMPTS_TRY_LATER",
            ProviderErrorCode::EmailNotFound => "EMAIL_NOT_FOUND",
            ProviderErrorCode::InvalidPassword => "INVALID_PASSWORD",
            ProviderErrorCode::UserDisabled => "USER_DISABLED",
        }
    }

    /// Parse a provider message such as `"EMAIL_EXISTS"` or
    /// `"TOO_MANY_ATTEMPTS_TRY_LATER : Too many unsuccessful login attempts."`.
    pub fn from_message(message: &str) -> Option<Self> {
        let code = code_of(message);
        Self::ALL.into_iter().find(|c| c.as_str() == code)
    }
}

/// The code part of a provider message, before any `" : "` description.
fn code_of(message: &str) -> &str {
    message.split(" : ").next().unwrap_or(message).trim()
}

/// Language of user-facing error messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Locale {
    #[default]
    En,
    PtBr,
}

impl Locale {
    /// Message for a provider error code, or the generic message for `None`.
    pub fn message(&self, code: Option<ProviderErrorCode>) -> &'static str {
        use ProviderErrorCode::*;
        match self {
            Locale::En => match code {
                Some(EmailExists) => "The email address is already in use by another account.",
                Some(OperationNotAllowed) => "Password sign-in is disabled for this project.",
                Some(TooManyAttemptsTryLater) => {
                    "We have blocked all requests from this device due to unusual activity. Try again later."
                }
                Some(EmailNotFound) => {
                    "There is no user record corresponding to this identifier. The user may have been deleted."
                }
                Some(InvalidPassword) => "The password is invalid or the user does not have a password.",
                Some(UserDisabled) => "The user account has been disabled by an administrator.",
                None => "An unknown error occurred.",
            },
            Locale::PtBr => match code {
                Some(EmailExists) => "O endereço de e-mail já está sendo usado por outra conta.",
                Some(OperationNotAllowed) => "O login por senha está desabilitado para este projeto.",
                Some(TooManyAttemptsTryLater) => {
                    "Bloqueamos todas as solicitações deste dispositivo devido a atividades incomuns. Tente mais tarde."
                }
                Some(EmailNotFound) => {
                    "Não há registro de usuário correspondente a este identificador. O usuário pode ter sido excluído."
                }
                Some(InvalidPassword) => "A senha é inválida ou o usuário não possui senha.",
                Some(UserDisabled) => "A conta de usuário foi desabilitada por um administrador.",
                None => "Um erro desconhecido aconteceu.",
            },
        }
    }

    pub fn unknown_error(&self) -> &'static str {
        self.message(None)
    }
}

/// A failed credential exchange. `Display` is the user-facing message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No usable response: the request failed, or the payload carried no
    /// recognizable provider error.
    #[error("{message}")]
    Transport { message: String, detail: String },

    /// The provider rejected the credentials with a known code.
    #[error("{message}")]
    ProviderRejected {
        code: ProviderErrorCode,
        message: String,
    },

    /// The provider reported a code missing from the message table.
    #[error("{message}")]
    UnknownProvider { code: String, message: String },
}

impl AuthError {
    pub fn message(&self) -> &str {
        match self {
            AuthError::Transport { message, .. }
            | AuthError::ProviderRejected { message, .. }
            | AuthError::UnknownProvider { message, .. } => message,
        }
    }

    pub fn transport(locale: Locale, detail: impl Into<String>) -> Self {
        AuthError::Transport {
            message: locale.unknown_error().to_string(),
            detail: detail.into(),
        }
    }

    /// Map a provider error payload to an error. Total: any body, JSON or
    /// not, yields exactly one variant.
    pub fn from_provider_response(locale: Locale, status: u16, body: &str) -> Self {
        let reported = serde_json::from_str::<Value>(body).ok().and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        match reported {
            Some(raw) => match ProviderErrorCode::from_message(&raw) {
                Some(code) => AuthError::ProviderRejected {
                    code,
                    message: locale.message(Some(code)).to_string(),
                },
                None => AuthError::UnknownProvider {
                    code: code_of(&raw).to_string(),
                    message: locale.unknown_error().to_string(),
                },
            },
            None => AuthError::transport(
                locale,
                format!("Status {}: {}", status, truncate_body(body)),
            ),
        }
    }
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_body(code: &str) -> String {
        format!(r#"{{"error":{{"code":400,"message":"{}","errors":[]}}}}"#, code)
    }

    #[test]
    fn test_known_codes_map_to_fixed_messages() {
        for code in ProviderErrorCode::ALL {
            let body = error_body(code.as_str());
            let err = AuthError::from_provider_response(Locale::En, 400, &body);
            assert_eq!(
                err,
                AuthError::ProviderRejected {
                    code,
                    message: Locale::En.message(Some(code)).to_string(),
                }
            );
            assert_ne!(err.message(), Locale::En.unknown_error());
        }
    }

    #[test]
    fn test_known_code_messages() {
        let err = AuthError::from_provider_response(Locale::En, 400, &error_body("EMAIL_EXISTS"));
        assert_eq!(err.to_string(), "The email address is already in use by another account.");

        let body = error_body("INVALID_PASSWORD");
        let err = AuthError::from_provider_response(Locale::PtBr, 400, &body);
        assert_eq!(err.message(), "A senha é inválida ou o usuário não possui senha.");
    }

    #[test]
    fn test_code_with_description_suffix() {
        let body =
            error_body("TOO_MANY_ATTEMPTS_TRY_LATER : Too many unsuccessful login attempts.");
        let err = AuthError::from_provider_response(Locale::En, 400, &body);
        assert!(matches!(
            err,
            AuthError::ProviderRejected {
                code: ProviderErrorCode::TooManyAttemptsTryLater,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_code_maps_to_generic_message() {
        let body = error_body("WEAK_PASSWORD : Password should be at least 6 characters");
        let err = AuthError::from_provider_response(Locale::En, 400, &body);
        assert_eq!(
            err,
            AuthError::UnknownProvider {
                code: "WEAK_PASSWORD".to_string(),
                message: "An unknown error occurred.".to_string(),
            }
        );
    }

    #[test]
    fn test_malformed_or_missing_payload_is_transport_failure() {
        let bodies = [
            "",
            "<html>502 Bad Gateway</html>",
            "{}",
            r#"{"error":{}}"#,
            r#"{"error":"nope"}"#,
            r#"{"error":{"message":42}}"#,
        ];
        for body in bodies {
            let err = AuthError::from_provider_response(Locale::PtBr, 502, body);
            assert!(matches!(err, AuthError::Transport { .. }), "body: {body}");
            assert_eq!(err.message(), "Um erro desconhecido aconteceu.");
        }
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let body = "é".repeat(MAX_ERROR_BODY_LENGTH);
        let truncated = truncate_body(&body);
        assert!(truncated.contains("truncated"));
        assert_eq!(truncate_body("short"), "short");
    }

    #[test]
    fn test_locale_serde_names() {
        assert_eq!(serde_json::to_string(&Locale::PtBr).unwrap(), "\"pt-br\"");
        assert_eq!(serde_json::from_str::<Locale>("\"en\"").unwrap(), Locale::En);
    }
}
