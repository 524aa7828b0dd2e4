//! HTTP `Date` header values.
//!
//! Formatting a date for every response is wasted work when thousands of
//! responses share the same second. [`DateService`] keeps the formatted
//! value in an [`ArcSwap`] and refreshes it from a background task.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bref_api::environment::Environment;
use bref_api::pipeline::TransformHandler;
use bref_api::protocol::{HeaderValue, HttpRequest, HttpResponse, header};
use bytes::Bytes;
use once_cell::sync::Lazy;
use tracing::trace;

const UPDATE_INTERVAL: Duration = Duration::from_millis(800);

/// Keeps the current HTTP date string up to date.
#[derive(Debug)]
pub struct DateService {
    current: Arc<ArcSwap<Bytes>>,
    handle: tokio::task::JoinHandle<()>,
}

static DATE_SERVICE: Lazy<DateService> = Lazy::new(|| DateService::new_with_update_interval(UPDATE_INTERVAL));

impl DateService {
    /// The process wide instance. Must first be used from within a tokio
    /// runtime, which runs the refresh task.
    pub fn get_global_instance() -> &'static DateService {
        &DATE_SERVICE
    }

    fn new_with_update_interval(update_interval: Duration) -> Self {
        let current = Arc::new(ArcSwap::from_pointee(now()));
        let current_arc = Arc::clone(&current);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(update_interval).await;
                current_arc.store(Arc::new(now()));
            }
        });

        DateService { current, handle }
    }

    /// Calls `f` with the current date as a header value.
    pub fn with_http_date<F>(&self, mut f: F)
    where
        F: FnMut(HeaderValue),
    {
        let date = self.current.load().as_ref().clone();
        match HeaderValue::from_maybe_shared(date) {
            Ok(value) => f(value),
            Err(e) => trace!(cause = %e, "skipping malformed date"),
        }
    }
}

impl Drop for DateService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn now() -> Bytes {
    let mut buf = faf_http_date::get_date_buff_no_key();
    faf_http_date::get_date_no_key(&mut buf);
    Bytes::from_owner(buf)
}

/// Pre-send hook stamping every response with a `Date` header.
pub(crate) fn insert_date(_env: &Environment, _request: &HttpRequest, response: &mut HttpResponse) -> TransformHandler {
    DateService::get_global_instance().with_http_date(|date| {
        response.headers_mut().insert(header::DATE, date);
    });
    TransformHandler::empty()
}
