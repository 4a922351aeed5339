//! Effects the core asks its host shell to perform.

pub mod http;

pub use self::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport,
    ValidatedUrl,
};
