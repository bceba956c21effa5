//! Session identity for lab requests
//!
//! The browser carries its session token in the `lab_session` cookie.
//! Non-browser clients may send `x-lab-session` instead. Requests without a
//! usable token get a freshly minted one, returned via `Set-Cookie`.

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use lab_orchestrator::SessionId;

pub const SESSION_COOKIE: &str = "lab_session";
pub const SESSION_HEADER: &str = "x-lab-session";
pub const USER_HEADER: &str = "x-lab-user";
pub const DEFAULT_USER: &str = "anonymous";

#[derive(Clone, Debug)]
pub struct LabIdentity {
    pub session_id: SessionId,
    pub user: String,
    /// True when the token was minted for this request
    pub issued: bool,
}

impl LabIdentity {
    /// Attach the session cookie if the token is new
    pub fn attach(&self, mut response: Response) -> Response {
        if self.issued {
            let cookie = format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax",
                SESSION_COOKIE, self.session_id
            );
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(SET_COOKIE, value);
            }
        }
        response
    }
}

/// Resolve the caller's identity from request headers
pub fn identify(headers: &HeaderMap) -> LabIdentity {
    let user = user_from(headers);
    match session_from(headers) {
        Some(session_id) => LabIdentity {
            session_id,
            user,
            issued: false,
        },
        None => LabIdentity {
            session_id: SessionId::new(),
            user,
            issued: true,
        },
    }
}

pub fn user_from(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_USER)
        .to_string()
}

fn session_from(headers: &HeaderMap) -> Option<SessionId> {
    let from_header = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(SessionId::parse);
    if from_header.is_some() {
        return from_header;
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| SessionId::parse(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn test_identity_from_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; lab_session=abc123"));
        headers.insert(USER_HEADER, HeaderValue::from_static("alice"));

        let identity = identify(&headers);
        assert_eq!(identity.session_id.as_str(), "abc123");
        assert_eq!(identity.user, "alice");
        assert!(!identity.issued);
    }

    #[test]
    fn test_header_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("lab_session=from-cookie"));
        headers.insert(SESSION_HEADER, HeaderValue::from_static("from-header"));

        assert_eq!(identify(&headers).session_id.as_str(), "from-header");
    }

    #[test]
    fn test_missing_or_bad_token_is_minted() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("lab_session=../../etc"));

        let identity = identify(&headers);
        assert!(identity.issued);
        assert_eq!(identity.user, DEFAULT_USER);

        let response = identity.attach(().into_response());
        let cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.starts_with(&format!("lab_session={}", identity.session_id)));
    }

    #[test]
    fn test_known_token_sets_no_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("abc123"));

        let response = identify(&headers).attach(().into_response());
        assert!(response.headers().get(SET_COOKIE).is_none());
    }
}
