//! Credential resolution: explicit values first, then the environment.

use std::fmt;

use serde::Deserialize;

use crate::{
    errors::{APIError, Error, Result},
    ACCESS_TOKEN_ENV, DEFAULT_GATEWAY_URL, GATEWAY_URL_ENV, USER_ID_ENV,
};

/// Access token and user id sent with every gateway request.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_token: String,
    user_id: String,
}

impl Credentials {
    /// Build credentials from explicit values.
    ///
    /// Whitespace-only values are rejected with [`Error::Config`].
    pub fn new(access_token: impl Into<String>, user_id: impl Into<String>) -> Result<Self> {
        Self::resolve(Some(access_token.into()), Some(user_id.into()))
    }

    /// Read `PINE_ACCESS_TOKEN` and `PINE_USER_ID`.
    pub fn from_env() -> Result<Self> {
        Self::resolve(None, None)
    }

    /// Prefer the explicit values and fall back to the environment for whichever is missing.
    pub fn resolve(access_token: Option<String>, user_id: Option<String>) -> Result<Self> {
        resolve_with(access_token, user_id, |key| std::env::var(key).ok())
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

pub(crate) fn resolve_with<F>(
    access_token: Option<String>,
    user_id: Option<String>,
    lookup: F,
) -> Result<Credentials>
where
    F: Fn(&str) -> Option<String>,
{
    let access_token = non_blank(access_token)
        .or_else(|| non_blank(lookup(ACCESS_TOKEN_ENV)))
        .ok_or_else(|| {
            Error::Config(format!(
                "access token is required (pass one explicitly or set {ACCESS_TOKEN_ENV})"
            ))
        })?;
    let user_id = non_blank(user_id)
        .or_else(|| non_blank(lookup(USER_ID_ENV)))
        .ok_or_else(|| {
            Error::Config(format!(
                "user id is required (pass one explicitly or set {USER_ID_ENV})"
            ))
        })?;

    Ok(Credentials {
        access_token: strip_bearer(&access_token).to_string(),
        user_id,
    })
}

/// Gateway URL: explicit value, then `PINE_GATEWAY_URL`, then the default.
pub fn resolve_gateway_url(explicit: Option<&str>) -> String {
    gateway_url_with(explicit, |key| std::env::var(key).ok())
}

pub(crate) fn gateway_url_with<F>(explicit: Option<&str>, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    non_blank(explicit.map(str::to_string))
        .or_else(|| non_blank(lookup(GATEWAY_URL_ENV)))
        .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Path of the first step of the email-code exchange.
pub(crate) const AUTH_REQUEST_PATH: &str = "/api/v2/auth/email/request";
/// Path of the second step of the email-code exchange.
pub(crate) const AUTH_VERIFY_PATH: &str = "/api/v2/auth/email/verify";

#[derive(Deserialize)]
struct AuthEnvelope {
    #[serde(default)]
    data: Option<AuthData>,
}

#[derive(Deserialize)]
struct AuthData {
    #[serde(default)]
    request_token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

fn auth_data(body: &str) -> Option<AuthData> {
    serde_json::from_str::<AuthEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.data)
}

/// Every failure of the exchange is an authorization failure, keeping the remote code.
pub(crate) fn auth_failure(err: Error, default_code: &str) -> Error {
    match err.api_error() {
        Some(api) => {
            let mut api = api.clone();
            if api.code.is_none() {
                api.code = Some(default_code.to_string());
            }
            Error::Auth(api)
        }
        None => err,
    }
}

pub(crate) fn parse_request_token(body: &str) -> Result<String> {
    auth_data(body)
        .and_then(|data| non_blank(data.request_token))
        .ok_or_else(|| {
            Error::Auth(
                APIError::new(500, "server did not return a request token").with_code("NO_TOKEN"),
            )
        })
}

pub(crate) fn parse_verified_credentials(body: &str) -> Result<Credentials> {
    let data = auth_data(body);
    let (access_token, user_id) = match data {
        Some(data) => (non_blank(data.access_token), non_blank(data.id)),
        None => (None, None),
    };
    match (access_token, user_id) {
        (Some(access_token), Some(user_id)) => Ok(Credentials {
            access_token,
            user_id,
        }),
        _ => Err(Error::Auth(
            APIError::new(500, "server did not return valid credentials")
                .with_code("NO_CREDENTIALS"),
        )),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn strip_bearer(token: &str) -> &str {
    token
        .strip_prefix("Bearer ")
        .or_else(|| token.strip_prefix("bearer "))
        .unwrap_or(token)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn explicit_values_win_over_environment() {
        let creds = resolve_with(
            Some("tok_explicit".into()),
            None,
            env(&[(ACCESS_TOKEN_ENV, "tok_env"), (USER_ID_ENV, "user_env")]),
        )
        .unwrap();
        assert_eq!(creds.access_token(), "tok_explicit");
        assert_eq!(creds.user_id(), "user_env");
    }

    #[test]
    fn blank_values_count_as_missing() {
        let err = resolve_with(
            Some("  ".into()),
            Some("user_1".into()),
            env(&[(ACCESS_TOKEN_ENV, "\t")]),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains(ACCESS_TOKEN_ENV));

        let err = resolve_with(Some("tok".into()), None, env(&[])).unwrap_err();
        assert!(err.to_string().contains(USER_ID_ENV));
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        let creds = resolve_with(Some("Bearer abc".into()), Some("u".into()), env(&[])).unwrap();
        assert_eq!(creds.access_token(), "abc");
    }

    #[test]
    fn debug_redacts_token() {
        let creds = resolve_with(Some("secret-token".into()), Some("u1".into()), env(&[])).unwrap();
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("u1"));
    }

    #[test]
    fn auth_payloads_are_unwrapped() {
        assert_eq!(
            parse_request_token(r#"{"data":{"request_token":"rt_1"}}"#).unwrap(),
            "rt_1"
        );
        let err = parse_request_token(r#"{"data":{}}"#).unwrap_err();
        assert_eq!(err.api_error().unwrap().code.as_deref(), Some("NO_TOKEN"));

        let creds =
            parse_verified_credentials(r#"{"data":{"access_token":"at","id":"u9"}}"#).unwrap();
        assert_eq!(creds.user_id(), "u9");
        let err = parse_verified_credentials(r#"{"data":{"access_token":"at"}}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        assert_eq!(err.api_error().unwrap().code.as_deref(), Some("NO_CREDENTIALS"));
    }

    #[test]
    fn exchange_failures_become_auth_failures() {
        let err = auth_failure(Error::Api(APIError::new(400, "bad email")), "AUTH_REQUEST_FAILED");
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        assert_eq!(err.api_error().unwrap().code.as_deref(), Some("AUTH_REQUEST_FAILED"));

        let err = auth_failure(
            Error::RateLimited(APIError::new(429, "slow").with_code("RATE_LIMITED")),
            "AUTH_VERIFY_FAILED",
        );
        assert_eq!(err.api_error().unwrap().code.as_deref(), Some("RATE_LIMITED"));
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
    }

    #[test]
    fn gateway_url_falls_back_in_order() {
        assert_eq!(
            gateway_url_with(Some("https://gw.test/"), env(&[(GATEWAY_URL_ENV, "https://env")])),
            "https://gw.test"
        );
        assert_eq!(
            gateway_url_with(None, env(&[(GATEWAY_URL_ENV, "https://env.test")])),
            "https://env.test"
        );
        assert_eq!(gateway_url_with(Some(" "), env(&[])), DEFAULT_GATEWAY_URL);
    }
}
