use futures::future::{MapOk, TryFutureExt as _};
use hyper::{
    header::{HeaderMap, HeaderValue, CACHE_CONTROL, EXPIRES, PRAGMA},
    service::Service,
    Response,
};

pub const CACHE_CONTROL_VALUE: &str = "no-cache, no-store, must-revalidate";
pub const PRAGMA_VALUE: &str = "no-cache";
pub const EXPIRES_VALUE: &str = "0";

/// Overwrites the caching headers so neither the browser nor a proxy keeps a copy.
pub fn apply(headers: &mut HeaderMap) {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_VALUE));
    headers.insert(PRAGMA, HeaderValue::from_static(PRAGMA_VALUE));
    headers.insert(EXPIRES, HeaderValue::from_static(EXPIRES_VALUE));
}

pub fn decorate<B>(mut response: Response<B>) -> Response<B> {
    apply(response.headers_mut());
    response
}

/// Wraps a service and runs [`decorate`] on every response it produces,
/// whatever the status.
#[derive(Debug, Clone)]
pub struct NoCache<S> {
    inner: S,
}

impl<S> NoCache<S> {
    pub fn new(inner: S) -> Self {
        NoCache { inner }
    }
}

impl<S, Req, B> Service<Req> for NoCache<S>
where
    S: Service<Req, Response = Response<B>>,
{
    type Response = Response<B>;
    type Error = S::Error;
    type Future = MapOk<S::Future, fn(Response<B>) -> Response<B>>;

    fn call(&self, req: Req) -> Self::Future {
        self.inner
            .call(req)
            .map_ok(decorate::<B> as fn(Response<B>) -> Response<B>)
    }
}
