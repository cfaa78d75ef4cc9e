use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::{reject_unknown, take_string};
use crate::error::{ConfigurationError, StageError};
use crate::http::{CookieJar, Flash, Request, Response, is_cookie_name, is_cookie_path};
use crate::pipeline::{Next, Stage, StageParameters};

/// Installs a [`CookieJar`] on the request and turns whatever the inner
/// stages changed in it into `Set-Cookie` headers.
pub struct CookiesStage {
    path: String,
}

impl Default for CookiesStage {
    fn default() -> Self {
        Self::new("/")
    }
}

impl CookiesStage {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub(super) fn from_params(mut params: StageParameters) -> Result<Self, ConfigurationError> {
        let path = take_string(&mut params, "path").unwrap_or_else(|| "/".to_string());
        if !is_cookie_path(&path) {
            return Err(ConfigurationError::invalid(
                "cookies",
                format!(
                    "'path' must start with '/' and contain no ';', spaces or control characters, got {path:?}"
                ),
            ));
        }
        reject_unknown("cookies", &params)?;
        Ok(Self::new(path))
    }
}

impl Stage for CookiesStage {
    fn name(&self) -> &str {
        "cookies"
    }

    fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Response, StageError> {
        // Each pass gets a fresh jar; whatever was installed before is put back.
        let jar = CookieJar::parse(request.header("cookie").unwrap_or_default());
        let outer = request.cookies.replace(jar);

        let result = next.run(request);
        let jar = std::mem::replace(&mut request.cookies, outer);

        let mut response = result?;
        if let Some(jar) = jar {
            for value in jar.set_cookie_headers(&self.path) {
                response.append_header("set-cookie", value);
            }
        }
        Ok(response)
    }
}

/// Cookie-backed flash messages: what one request queues, the next one reads.
pub struct FlashStage {
    cookie: String,
}

impl Default for FlashStage {
    fn default() -> Self {
        Self::new("_flash")
    }
}

impl FlashStage {
    pub fn new(cookie: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
        }
    }

    pub(super) fn from_params(mut params: StageParameters) -> Result<Self, ConfigurationError> {
        let cookie = take_string(&mut params, "cookie").unwrap_or_else(|| "_flash".to_string());
        if !is_cookie_name(&cookie) {
            return Err(ConfigurationError::invalid(
                "flash",
                format!("'cookie' must be a valid cookie name, got {cookie:?}"),
            ));
        }
        reject_unknown("flash", &params)?;
        Ok(Self::new(cookie))
    }

    fn load(&self, request: &Request) -> Option<BTreeMap<String, String>> {
        let raw = request.cookies.as_ref()?.get(&self.cookie)?;
        match serde_json::from_str(raw) {
            Ok(messages) => Some(messages),
            Err(err) => {
                warn!(error = %err, cookie = %self.cookie, "Discarding malformed flash cookie");
                Some(BTreeMap::new())
            }
        }
    }
}

impl Stage for FlashStage {
    fn name(&self) -> &str {
        "flash"
    }

    fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Response, StageError> {
        let incoming = self.load(request);
        let had_cookie = incoming.is_some();
        request.flash = Some(Flash::from_messages(incoming.unwrap_or_default()));

        let response = next.run(request)?;

        let outgoing = request
            .flash
            .as_ref()
            .map(Flash::outgoing)
            .unwrap_or_default();
        match request.cookies.as_mut() {
            Some(jar) if !outgoing.is_empty() => {
                let encoded =
                    serde_json::to_string(&outgoing).map_err(|err| StageError::Other(err.into()))?;
                jar.set(self.cookie.clone(), encoded)?;
            }
            Some(jar) if had_cookie => jar.delete(self.cookie.clone())?,
            Some(_) => {}
            None if !outgoing.is_empty() => {
                debug!(
                    messages = outgoing.len(),
                    "No cookie jar installed; flash messages live for this request only"
                );
            }
            None => {}
        }
        Ok(response)
    }
}
