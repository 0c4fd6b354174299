//! Replay sessions.
//!
//! A session delivers queued requests as an authenticated user, either by
//! driving the application in-process ([`InternalSession`]) or over real
//! HTTP ([`ExternalSession`]). Both perform the same sign-in handshake:
//! fetch the sign-in page, lift the CSRF token out of the markup, post the
//! credentials with it, and expect a redirect back.

use std::collections::HashMap;
use std::sync::Arc;
use std::{cell::RefCell, rc::Rc};

use async_trait::async_trait;
use lol_html::{RewriteStrSettings, element, rewrite_str};
use tracing::{debug, info};
use url::Url;

use crate::config::Config;
use crate::error::CacheError;
use crate::replay::{Request, RequestMethod};
use crate::session_user::SessionUser;

/// What the application answered an in-process request with.
#[derive(Debug, Clone)]
pub struct DriverResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl DriverResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

/// In-process application seam: the host exposes its request dispatch here
/// so replays never leave the process.
#[async_trait]
pub trait AppDriver: Send + Sync {
    async fn call(
        &self,
        method: RequestMethod,
        path: &str,
        parameters: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<DriverResponse, CacheError>;
}

/// An authenticated connection a sender drains a queue through.
#[async_trait]
pub trait ReplaySession: Send {
    /// Perform the sign-in handshake if not already signed in. Idempotent.
    async fn sign_in(&mut self) -> Result<(), CacheError>;

    async fn send(&mut self, request: &Request) -> Result<(), CacheError>;

    async fn sign_out(&mut self) -> Result<(), CacheError>;
}

/// Pull the CSRF token out of sign-in page markup. Accepts either the
/// `csrf-token` meta tag or a form's `authenticity_token` hidden input;
/// the meta tag wins when both are present.
pub fn extract_csrf_token(markup: &str) -> Option<String> {
    let meta = Rc::new(RefCell::new(None::<String>));
    let input = Rc::new(RefCell::new(None::<String>));

    let scanned = rewrite_str(
        markup,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!(r#"meta[name="csrf-token"]"#, {
                    let meta = Rc::clone(&meta);
                    move |el| {
                        if meta.borrow().is_none() {
                            *meta.borrow_mut() = el.get_attribute("content");
                        }
                        Ok(())
                    }
                }),
                element!(r#"input[name="authenticity_token"]"#, {
                    let input = Rc::clone(&input);
                    move |el| {
                        if input.borrow().is_none() {
                            *input.borrow_mut() = el.get_attribute("value");
                        }
                        Ok(())
                    }
                }),
            ],
            ..RewriteStrSettings::default()
        },
    );
    if scanned.is_err() {
        return None;
    }

    let meta = meta.borrow_mut().take();
    meta.or_else(|| input.borrow_mut().take())
}

/// Session over an [`AppDriver`]. Cookies are carried between calls so the
/// application's session survives across the handshake and the replays.
pub struct InternalSession {
    driver: Arc<dyn AppDriver>,
    config: Arc<Config>,
    user: SessionUser,
    cookies: HashMap<String, String>,
    signed_in: bool,
}

impl InternalSession {
    pub fn new(driver: Arc<dyn AppDriver>, config: Arc<Config>, user: SessionUser) -> Self {
        Self {
            driver,
            config,
            user,
            cookies: HashMap::new(),
            signed_in: false,
        }
    }

    fn cookie_header(&self) -> Option<(String, String)> {
        if self.cookies.is_empty() {
            return None;
        }
        let mut pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        pairs.sort();
        Some(("cookie".to_string(), pairs.join("; ")))
    }

    fn absorb_cookies(&mut self, response: &DriverResponse) {
        for (name, value) in &response.headers {
            if !name.eq_ignore_ascii_case("set-cookie") {
                continue;
            }
            let pair = value.split(';').next().unwrap_or(value);
            if let Some((cookie, cookie_value)) = pair.split_once('=') {
                self.cookies
                    .insert(cookie.trim().to_string(), cookie_value.trim().to_string());
            }
        }
    }

    async fn call(
        &mut self,
        method: RequestMethod,
        path: &str,
        parameters: &[(String, String)],
        extra_headers: &[(String, String)],
    ) -> Result<DriverResponse, CacheError> {
        let mut headers: Vec<(String, String)> = self.cookie_header().into_iter().collect();
        headers.extend_from_slice(extra_headers);
        let response = self.driver.call(method, path, parameters, &headers).await?;
        self.absorb_cookies(&response);
        Ok(response)
    }
}

#[async_trait]
impl ReplaySession for InternalSession {
    async fn sign_in(&mut self) -> Result<(), CacheError> {
        if self.signed_in {
            return Ok(());
        }
        let Some(credentials) = self.user.credentials().cloned() else {
            // Unauthenticated user class: nothing to hand-shake.
            self.signed_in = true;
            return Ok(());
        };

        let config = self.config.clone();
        let page = self
            .call(RequestMethod::Get, &config.sign_in_path, &[], &[])
            .await?;
        let token = extract_csrf_token(&page.body).ok_or_else(|| {
            CacheError::sign_in_failure(self.user.user_type(), "no csrf token in sign-in page")
        })?;

        let mut parameters = credentials.resolve();
        parameters.push(("authenticity_token".to_string(), token));
        let response = self
            .call(RequestMethod::Post, &config.sign_in_post_path, &parameters, &[])
            .await?;

        let location = match response.header("location") {
            Some(location) if response.is_redirect() => location.to_string(),
            _ => {
                return Err(CacheError::sign_in_failure(
                    self.user.user_type(),
                    format!("sign-in returned {} without redirect", response.status),
                ));
            }
        };
        self.call(RequestMethod::Get, &location, &[], &[]).await?;

        info!(
            target: "tessella::session",
            user_type = self.user.user_type(),
            "internal session signed in"
        );
        self.signed_in = true;
        Ok(())
    }

    async fn send(&mut self, request: &Request) -> Result<(), CacheError> {
        self.sign_in().await?;
        let headers = request.headers();
        let response = self
            .call(request.method, &request.path, &request.parameters, &headers)
            .await?;
        debug!(
            target: "tessella::session",
            request = %request,
            status = response.status,
            "request replayed in-process"
        );
        Ok(())
    }

    async fn sign_out(&mut self) -> Result<(), CacheError> {
        let path = self.config.sign_out_path.clone();
        self.call(RequestMethod::Delete, &path, &[], &[]).await?;
        self.signed_in = false;
        Ok(())
    }
}

/// Session against a remote application instance over HTTP.
///
/// Redirects are never followed automatically: the sign-in handshake needs
/// to observe the login redirect itself and follow only the first hop.
pub struct ExternalSession {
    client: reqwest::Client,
    base: Url,
    config: Arc<Config>,
    user: SessionUser,
    signed_in: bool,
}

impl ExternalSession {
    pub fn new(base: Url, config: Arc<Config>, user: SessionUser) -> Result<Self, CacheError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            base,
            config,
            user,
            signed_in: false,
        })
    }

    fn url_for(&self, path: &str) -> Result<Url, CacheError> {
        self.base
            .join(path)
            .map_err(|err| CacheError::driver(format!("invalid request path {path}: {err}")))
    }
}

#[async_trait]
impl ReplaySession for ExternalSession {
    async fn sign_in(&mut self) -> Result<(), CacheError> {
        if self.signed_in {
            return Ok(());
        }
        let Some(credentials) = self.user.credentials().cloned() else {
            self.signed_in = true;
            return Ok(());
        };

        let page = self
            .client
            .get(self.url_for(&self.config.sign_in_path)?)
            .send()
            .await?
            .text()
            .await?;
        let token = extract_csrf_token(&page).ok_or_else(|| {
            CacheError::sign_in_failure(self.user.user_type(), "no csrf token in sign-in page")
        })?;

        let mut parameters = credentials.resolve();
        parameters.push(("authenticity_token".to_string(), token));
        let response = self
            .client
            .post(self.url_for(&self.config.sign_in_post_path)?)
            .form(&parameters)
            .send()
            .await?;

        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let location = match location {
            Some(location) if status.is_redirection() => location,
            _ => {
                return Err(CacheError::sign_in_failure(
                    self.user.user_type(),
                    format!("sign-in returned {status} without redirect"),
                ));
            }
        };

        // The location may be absolute or host-relative.
        let next = Url::parse(&location)
            .or_else(|_| self.base.join(&location))
            .map_err(|err| CacheError::driver(format!("bad redirect {location}: {err}")))?;
        self.client.get(next).send().await?;

        info!(
            target: "tessella::session",
            user_type = self.user.user_type(),
            host = %self.base,
            "external session signed in"
        );
        self.signed_in = true;
        Ok(())
    }

    async fn send(&mut self, request: &Request) -> Result<(), CacheError> {
        self.sign_in().await?;
        let url = self.url_for(&request.path)?;
        let mut builder = self.client.request(request.method.as_reqwest(), url);
        builder = match request.method {
            RequestMethod::Get => builder.query(&request.parameters),
            _ => builder.form(&request.parameters),
        };
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }
        let response = builder.send().await?;
        debug!(
            target: "tessella::session",
            request = %request,
            status = response.status().as_u16(),
            "request replayed remotely"
        );
        Ok(())
    }

    async fn sign_out(&mut self) -> Result<(), CacheError> {
        let url = self.url_for(&self.config.sign_out_path)?;
        self.client.delete(url).send().await?;
        self.signed_in = false;
        Ok(())
    }
}
