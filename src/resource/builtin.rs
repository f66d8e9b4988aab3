//! Resources the engine ships with.

use crate::{
    errors::{Error, HttpError},
    http::{
        request::Request,
        response::Response,
        types::{Method, MethodSet, StatusCode, Version},
        uri::Uri,
    },
    resource::{path_matches, Resource},
};
use std::collections::HashMap;

/// Renders error responses: 404, 405, parse failures and resource errors.
///
/// Without a template for a status the page is a small built-in HTML
/// document, or a JSON object when JSON errors are enabled. Templates may
/// use `{status}`, `{reason}` and `{description}` placeholders.
///
/// # Examples
/// ```
/// use kiln::{ErrorPage, StatusCode};
///
/// let page = ErrorPage::new()
///     .page(StatusCode::NOT_FOUND, "<h1>{status}: nothing at this address</h1>");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ErrorPage {
    templates: HashMap<u16, String>,
    json: bool,
}

impl ErrorPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `template` as the HTML body for `status`.
    pub fn page(mut self, status: StatusCode, template: impl Into<String>) -> Self {
        self.templates.insert(status.as_u16(), template.into());
        self
    }

    /// Renders bodies as `{"error": ..., "code": ...}` when no template applies.
    pub fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Writes a complete error response for `status`.
    ///
    /// `cause` refines the description and the JSON code for request errors.
    pub fn render(
        &self,
        status: StatusCode,
        cause: Option<HttpError>,
        resp: &mut Response<'_>,
    ) -> Result<(), Error> {
        let description = cause.map_or_else(|| description(status), |err| err.message());
        resp.status(status);

        if let Some(template) = self.templates.get(&status.as_u16()) {
            let body = template
                .replace("{status}", &status.as_u16().to_string())
                .replace("{reason}", &escape_html(status.canonical_reason()))
                .replace("{description}", &escape_html(description));

            resp.set_header("Content-Type", "text/html; charset=utf-8");
            return resp.body(body);
        }

        if self.json {
            let code = match cause {
                Some(err) => err.code().to_owned(),
                None => status.canonical_reason().to_ascii_uppercase().replace([' ', '-'], "_"),
            };
            resp.set_header("Content-Type", "application/json");
            return resp.body(format!(
                r#"{{"error":"{}","code":"{}"}}"#,
                escape_json(description),
                code
            ));
        }

        let (code, reason) = (status.as_u16(), escape_html(status.canonical_reason()));
        resp.set_header("Content-Type", "text/html; charset=utf-8");
        resp.body(format!(
            "<!DOCTYPE html>\n\
             <html>\n<head><title>{code} {reason}</title></head>\n<body>\n\
             <h1>{code} {reason}</h1>\n\
             <table>\n\
             <tr><th>Status</th><td>{code}</td></tr>\n\
             <tr><th>Reason</th><td>{reason}</td></tr>\n\
             <tr><th>Description</th><td>{}</td></tr>\n\
             </table>\n</body>\n</html>\n",
            escape_html(description),
        ))
    }
}

fn description(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "Your browser (or proxy) sent a request that this server could not understand.",
        403 => "You don't have permission to access this URL on this server.",
        404 => "The requested URL was not found on this server.",
        405 => "This method is not allowed for the requested URL.",
        413 => "The data volume exceeds the capacity limit.",
        414 => "The length of the requested URL exceeds the capacity limit for this server.",
        431 => "The length of the request headers exceeds the capacity limit for this server.",
        500 => "The server encountered an internal error and was unable to complete your request.",
        501 => "The server does not support the action requested by the browser.",
        503 => "The server is temporarily unable to handle the request.",
        _ => "No detailed description available.",
    }
}

pub(crate) fn escape_html(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for c in src.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn escape_json(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for c in src.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Redirects every request under a prefix to a fixed location.
///
/// HTTP/1.1 clients get `307`/`308`, which preserve the method; HTTP/1.0
/// clients get `302`/`301`. Relative locations are made absolute from the
/// request's `Host`.
#[derive(Debug, Clone)]
pub struct Redirect {
    prefix: String,
    location: String,
    permanent: bool,
}

impl Redirect {
    pub fn temporary(prefix: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            location: location.into(),
            permanent: false,
        }
    }

    pub fn permanent(prefix: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            permanent: true,
            ..Self::temporary(prefix, location)
        }
    }

    fn status(&self, version: Version) -> StatusCode {
        match (version, self.permanent) {
            (Version::Http11, true) => StatusCode::PERMANENT_REDIRECT,
            (Version::Http11, false) => StatusCode::TEMPORARY_REDIRECT,
            (Version::Http10, true) => StatusCode::MOVED_PERMANENTLY,
            (Version::Http10, false) => StatusCode::FOUND,
        }
    }

    fn absolute_location(&self, req: &Request<'_>) -> String {
        if self.location.starts_with("http://") || self.location.starts_with("https://") {
            return self.location.clone();
        }

        let host = match req.header("host") {
            Some(host) if !host.is_empty() => host.to_owned(),
            _ => req.server_addr().to_string(),
        };

        let mut location = format!("http://{host}");
        match (location.ends_with('/'), self.location.starts_with('/')) {
            (false, false) => location.push('/'),
            (true, true) => {
                location.pop();
            }
            _ => {}
        }
        location.push_str(&self.location);
        location
    }
}

impl Resource for Redirect {
    fn matches(&self, uri: &Uri) -> bool {
        path_matches(&self.prefix, uri.path())
    }

    fn allowed_methods(&self) -> MethodSet {
        MethodSet::of(&[
            Method::Get,
            Method::Head,
            Method::Post,
            Method::Put,
            Method::Delete,
            Method::Patch,
            Method::Options,
        ])
    }

    fn handle(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<(), Error> {
        let status = self.status(req.version());
        let location = self.absolute_location(req);
        let escaped = escape_html(&location);

        resp.status(status)
            .header("Location", &location)
            .header("Content-Type", "text/html; charset=utf-8");
        resp.body(format!(
            "<!DOCTYPE html>\n<html>\n<head><title>{} {}</title></head>\n\
             <body><p>Moved to <a href=\"{escaped}\">{escaped}</a>.</p></body>\n</html>\n",
            status.as_u16(),
            status.canonical_reason(),
        ))
    }
}

/// Serves a fixed body under a prefix.
#[derive(Debug, Clone)]
pub struct Text {
    prefix: String,
    body: String,
    content_type: String,
    status: StatusCode,
}

impl Text {
    pub fn new(prefix: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            body: body.into(),
            content_type: "text/plain; charset=utf-8".to_owned(),
            status: StatusCode::OK,
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

impl Resource for Text {
    fn matches(&self, uri: &Uri) -> bool {
        path_matches(&self.prefix, uri.path())
    }

    fn handle(&self, _req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<(), Error> {
        resp.status(self.status)
            .header("Content-Type", &self.content_type);
        resp.body(&self.body)
    }
}
