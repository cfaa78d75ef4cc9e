use std::collections::BTreeMap;

use ::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StageError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub extensions: Map<String, Value>,
    /// Installed by the `cookies` stage.
    #[serde(skip)]
    pub cookies: Option<CookieJar>,
    /// Installed by the `flash` stage.
    #[serde(skip)]
    pub flash: Option<Flash>,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        let mut request = Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        };
        request.normalize();
        request
    }

    /// Upper-cases the method and lower-cases header names. Requests read from
    /// JSON go through this before dispatch.
    pub fn normalize(&mut self) {
        self.method = self.method.trim().to_ascii_uppercase();
        if self.path.is_empty() {
            self.path = "/".to_string();
        }
        let headers = std::mem::take(&mut self.headers);
        self.headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn extension(&self, key: &str) -> Option<&Value> {
        self.extensions.get(key)
    }

    pub fn set_extension(&mut self, key: impl Into<String>, value: Value) {
        self.extensions.insert(key.into(), value);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.set_header("content-type", "text/plain");
        response.body = body.into();
        response
    }

    pub fn json(status: u16, body: &Value) -> Self {
        let mut response = Self::new(status);
        response.set_header("content-type", "application/json");
        response.body = body.to_string();
        response
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.append_header(name, value);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Replaces every existing value of `name`.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.append_header(name, value);
    }

    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CookieChange {
    Set(String),
    Delete,
}

/// Plain-text cookie jar: what the client sent plus what the application
/// changed during this request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    incoming: BTreeMap<String, String>,
    changes: BTreeMap<String, CookieChange>,
}

impl CookieJar {
    pub fn parse(header: &str) -> Self {
        let incoming = header
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), decode_cookie_value(value.trim())))
            })
            .collect();
        Self {
            incoming,
            changes: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        match self.changes.get(name) {
            Some(CookieChange::Set(value)) => Some(value.as_str()),
            Some(CookieChange::Delete) => None,
            None => self.incoming.get(name).map(String::as_str),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), StageError> {
        let name = checked_cookie_name(name.into())?;
        self.changes.insert(name, CookieChange::Set(value.into()));
        Ok(())
    }

    pub fn delete(&mut self, name: impl Into<String>) -> Result<(), StageError> {
        let name = checked_cookie_name(name.into())?;
        self.changes.insert(name, CookieChange::Delete);
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        !self.changes.is_empty()
    }

    /// One `Set-Cookie` value per changed cookie, in name order.
    pub fn set_cookie_headers(&self, path: &str) -> Vec<String> {
        self.changes
            .iter()
            .map(|(name, change)| match change {
                CookieChange::Set(value) => {
                    format!("{name}={}; path={path}", encode_cookie_value(value))
                }
                CookieChange::Delete => format!(
                    "{name}=; path={path}; max-age=0; expires=Thu, 01 Jan 1970 00:00:00 GMT"
                ),
            })
            .collect()
    }
}

fn checked_cookie_name(name: String) -> Result<String, StageError> {
    if is_cookie_name(&name) {
        Ok(name)
    } else {
        Err(StageError::InvalidCookie { name })
    }
}

/// Messages read from the previous request (`now`) and messages queued for
/// the next one (`next`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Flash {
    now: BTreeMap<String, String>,
    next: BTreeMap<String, String>,
    #[serde(skip)]
    kept: bool,
}

impl Flash {
    pub fn from_messages(now: BTreeMap<String, String>) -> Self {
        Self {
            now,
            ..Self::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.next
            .get(key)
            .or_else(|| self.now.get(key))
            .map(String::as_str)
    }

    /// Queues a message for the following request.
    pub fn set(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.next.insert(key.into(), message.into());
    }

    /// Makes a message visible for the current request only.
    pub fn set_now(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.now.insert(key.into(), message.into());
    }

    /// Carries the current messages over to the following request.
    pub fn keep(&mut self) {
        self.kept = true;
    }

    pub fn messages(&self) -> &BTreeMap<String, String> {
        &self.now
    }

    /// Everything that must survive into the next request.
    pub fn outgoing(&self) -> BTreeMap<String, String> {
        let mut outgoing = if self.kept {
            self.now.clone()
        } else {
            BTreeMap::new()
        };
        outgoing.extend(self.next.iter().map(|(k, v)| (k.clone(), v.clone())));
        outgoing
    }
}

pub fn encode_cookie_value(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

pub fn decode_cookie_value(value: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(value.as_bytes())).into_owned()
}

/// RFC 6265 cookie names are HTTP tokens: visible ASCII minus separators.
pub fn is_cookie_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|byte| {
            byte.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&byte)
        })
}

/// Cookie paths may not carry attribute separators or control characters.
pub fn is_cookie_path(path: &str) -> bool {
    path.starts_with('/') && path.bytes().all(|byte| byte.is_ascii_graphic() && byte != b';')
}

/// A status code usable on the wire (1xx through 5xx).
pub fn status_code(code: u16) -> Option<StatusCode> {
    StatusCode::from_u16(code).ok().filter(|status| {
        status.is_informational()
            || status.is_success()
            || status.is_redirection()
            || status.is_client_error()
            || status.is_server_error()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_is_parsed_and_changes_shadow_incoming() {
        let mut jar = CookieJar::parse("session=abc; theme=dark;broken; =x");
        assert_eq!(jar.get("session"), Some("abc"));
        assert_eq!(jar.get("theme"), Some("dark"));
        assert!(!jar.contains("broken"));

        jar.set("theme", "light").unwrap();
        jar.delete("session").unwrap();
        assert_eq!(jar.get("theme"), Some("light"));
        assert_eq!(jar.get("session"), None);
        assert!(jar.is_dirty());

        let headers = jar.set_cookie_headers("/");
        assert_eq!(headers.len(), 2);
        assert!(headers[0].starts_with("session=; path=/; max-age=0"));
        assert_eq!(headers[1], "theme=light; path=/");
    }

    #[test]
    fn cookie_values_survive_escaping() {
        let raw = r#"{"notice":"Saved; 100% done"}"#;
        let encoded = encode_cookie_value(raw);
        assert!(!encoded.contains(';'));
        assert!(!encoded.contains(' '));
        assert_eq!(decode_cookie_value(&encoded), raw);
    }

    #[test]
    fn cookie_names_must_be_tokens() {
        let mut jar = CookieJar::default();
        for name in ["", "bad;name", "a=b", "two words", "tab\tname", "q\"uote"] {
            assert!(
                matches!(jar.set(name, "v"), Err(StageError::InvalidCookie { .. })),
                "{name:?} should be rejected"
            );
            assert!(jar.delete(name).is_err());
        }
        assert!(!jar.is_dirty());
        jar.set("session_id-2", "ok").unwrap();
        assert_eq!(jar.get("session_id-2"), Some("ok"));
    }

    #[test]
    fn cookie_paths_cannot_smuggle_attributes() {
        assert!(is_cookie_path("/"));
        assert!(is_cookie_path("/app/admin"));
        assert!(!is_cookie_path("app"));
        assert!(!is_cookie_path("/; HttpOnly"));
        assert!(!is_cookie_path("/a;b"));
        assert!(!is_cookie_path("/a\r\nSet-Cookie: x=1"));
        assert!(!is_cookie_path("/with space"));
    }

    #[test]
    fn status_codes_stop_at_five_hundreds() {
        assert_eq!(status_code(418).and_then(|s| s.canonical_reason()), Some("I'm a teapot"));
        assert_eq!(status_code(504), Some(StatusCode::GATEWAY_TIMEOUT));
        assert!(status_code(42).is_none());
        assert!(status_code(600).is_none());
        assert!(status_code(999).is_none());
    }

    #[test]
    fn request_normalization_lowercases_headers() {
        let mut request = Request {
            method: " post ".into(),
            path: String::new(),
            ..Request::default()
        };
        request
            .headers
            .insert("X-HTTP-Method-Override".into(), "PUT".into());
        request.normalize();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/");
        assert_eq!(request.header("x-http-method-override"), Some("PUT"));
    }

    #[test]
    fn response_headers_allow_repeats() {
        let mut response = Response::text(200, "ok")
            .with_header("Set-Cookie", "a=1")
            .with_header("set-cookie", "b=2");
        assert_eq!(response.header_values("SET-COOKIE").count(), 2);
        response.set_header("set-cookie", "c=3");
        assert_eq!(
            response.header_values("set-cookie").collect::<Vec<_>>(),
            vec!["c=3"]
        );
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
    }
}
