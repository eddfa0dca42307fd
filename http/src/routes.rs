use std::{borrow::Cow, sync::Arc};

use base64::{engine::general_purpose, Engine as _};
use http_body_util::Full;
use hyper::{
    body::Bytes,
    header::{self, HeaderMap, HeaderValue},
    Method, Request, Response, StatusCode,
};
use mailsink_utils::{AuthEngine, MemoryStore, MessageFilter};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use tracing::{debug, info, warn};

pub type HttpResponse = Response<Full<Bytes>>;

const REALM: &str = "Basic realm=\"mailsink\"";

/// Maps API requests onto the store.
///
/// Routing is synchronous, every store operation is an in-memory lookup.
pub struct Router {
    store: Arc<MemoryStore>,
    auth: Option<Arc<dyn AuthEngine>>,
}

enum Route<'a> {
    Emails,
    Email(Cow<'a, str>),
    Attachment(Cow<'a, str>, usize),
    NotFound,
}

impl Router {
    pub fn new(store: Arc<MemoryStore>, auth: Option<Arc<dyn AuthEngine>>) -> Self {
        Self { store, auth }
    }

    pub fn handle<B>(&self, request: &Request<B>) -> HttpResponse {
        let mut response = self.dispatch(request);
        with_cors(response.headers_mut());
        response
    }

    fn dispatch<B>(&self, request: &Request<B>) -> HttpResponse {
        if request.method() == Method::OPTIONS {
            return empty(StatusCode::NO_CONTENT);
        }
        if !self.is_authorized(request.headers()) {
            let mut response = text(StatusCode::UNAUTHORIZED, "Unauthorized");
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(REALM));
            return response;
        }

        match (request.method(), parse_route(request.uri().path())) {
            (_, Route::NotFound) => text(StatusCode::NOT_FOUND, "Not found"),
            (&Method::GET, Route::Emails) => self.list(request.uri().query().unwrap_or("")),
            (&Method::DELETE, Route::Emails) => {
                self.store.clear();
                info!("Deleted all emails");
                empty(StatusCode::OK)
            }
            (&Method::GET, Route::Email(id)) => self.raw(&id),
            (&Method::DELETE, Route::Email(id)) => {
                self.store.delete(&id);
                info!(message_id = %id, "Deleted email");
                empty(StatusCode::OK)
            }
            (&Method::GET, Route::Attachment(id, index)) => self.attachment(&id, index),
            _ => text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),
        }
    }

    fn list(&self, query: &str) -> HttpResponse {
        let filter = match MessageFilter::from_query(query) {
            Ok(filter) => filter,
            Err(error) => return text(StatusCode::BAD_REQUEST, &error.to_string()),
        };
        debug!(filter = ?filter, "Listing emails");
        match serde_json::to_vec(&self.store.list(&filter)) {
            Ok(body) => bytes(StatusCode::OK, "application/json", body),
            Err(error) => {
                warn!(error = %error, "Failed to serialize email listing");
                text(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
            }
        }
    }

    fn raw(&self, message_id: &str) -> HttpResponse {
        match self.store.get_raw(message_id) {
            Ok(raw) => {
                info!(message_id = %message_id, size = raw.len(), "Downloaded email");
                let mut response = bytes(StatusCode::OK, "message/rfc822", Bytes::from_owner(raw));
                set_disposition(response.headers_mut(), &raw_filename(message_id));
                response
            }
            Err(error) => text(StatusCode::NOT_FOUND, &error.to_string()),
        }
    }

    fn attachment(&self, message_id: &str, index: usize) -> HttpResponse {
        match self.store.get_attachment(message_id, index) {
            Ok(attachment) => {
                info!(
                    message_id = %message_id,
                    index = index,
                    filename = %attachment.filename,
                    "Downloaded attachment"
                );
                let mut response = bytes(
                    StatusCode::OK,
                    &attachment.content_type,
                    Bytes::from_owner(attachment.content),
                );
                set_disposition(response.headers_mut(), &attachment.filename);
                response
            }
            Err(error) => text(StatusCode::NOT_FOUND, &error.to_string()),
        }
    }

    fn is_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(engine) = &self.auth else {
            return true;
        };
        let Some((username, password)) = basic_credentials(headers) else {
            info!("Missing or malformed authorization");
            return false;
        };
        match engine.authenticate(&username, &password) {
            Ok(true) => true,
            Ok(false) => {
                info!(user = %username, "Wrong credentials");
                false
            }
            Err(error) => {
                warn!(error = %error, "HTTP authentication engine failed");
                false
            }
        }
    }
}

fn parse_route(path: &str) -> Route<'_> {
    let segments: Vec<&str> = path
        .trim_start_matches('/')
        .trim_end_matches('/')
        .split('/')
        .collect();

    match segments.as_slice() {
        ["api", "emails"] => Route::Emails,
        ["api", "emails", id] => match decode_segment(*id) {
            Some(id) => Route::Email(id),
            None => Route::NotFound,
        },
        ["api", "attachment", id, index] => {
            match (decode_segment(*id), index.parse::<usize>()) {
                (Some(id), Ok(index)) => Route::Attachment(id, index),
                _ => Route::NotFound,
            }
        }
        _ => Route::NotFound,
    }
}

fn decode_segment(segment: &str) -> Option<Cow<'_, str>> {
    let decoded = percent_decode_str(segment).decode_utf8().ok()?;
    (!decoded.is_empty()).then_some(decoded)
}

/// Decodes `Authorization: Basic ...`, accepting padded and unpadded values.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = match value.split_once(' ') {
        Some((scheme, encoded)) if scheme.eq_ignore_ascii_case("Basic") => encoded.trim(),
        _ => return None,
    };
    let decoded = general_purpose::STANDARD_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Download name of a raw message, the identifier local part plus `.eml`.
fn raw_filename(message_id: &str) -> String {
    let local = message_id.split('@').next().unwrap_or(message_id);
    let local = local.trim_start_matches('<').trim_end_matches('>');
    let local = if local.is_empty() { "message" } else { local };
    format!("{local}.eml")
}

fn set_disposition(headers: &mut HeaderMap, filename: &str) {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != '\\' => c,
            _ => '_',
        })
        .collect();
    let mut value = format!("attachment; filename=\"{fallback}\"");
    if fallback != filename {
        let encoded = utf8_percent_encode(filename, NON_ALPHANUMERIC);
        value.push_str(&format!("; filename*=UTF-8''{encoded}"));
    }
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}

fn with_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Origin, X-Requested-With, Content-Type, Accept, Authorization"),
    );
}

fn bytes(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    let content_type = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    response
}

fn text(status: StatusCode, message: &str) -> HttpResponse {
    bytes(status, "text/plain; charset=utf-8", message.as_bytes().to_vec())
}

fn empty(status: StatusCode) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
