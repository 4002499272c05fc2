use crate::body::CompressionBody;
use crate::decompress::{self, DecompressRequest, NoDecompress};
use crate::future::ResponseFuture;
use crate::layer::{CompressionLayer, Settings};
use crate::policy;
use http::{Request, Response};
use http_body::Body;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// A Tower service that compresses HTTP response bodies and, depending on
/// its strategy `D`, decompresses request bodies.
///
/// Each call negotiates once from the request head, runs the request
/// through the decompression gate, calls the inner service and installs the
/// response interceptor on the returned head. The negotiated
/// [`Negotiation`](crate::Negotiation) is stored in the request extensions.
#[derive(Debug, Clone)]
pub struct CompressionService<S, D = NoDecompress> {
    inner: S,
    settings: Arc<Settings>,
    decompress: D,
}

impl<S> CompressionService<S> {
    /// Creates a new compression service with default settings wrapping the given inner service.
    pub fn new(inner: S) -> Self {
        CompressionLayer::new().layer(inner)
    }
}

impl<S, D> CompressionService<S, D> {
    pub(crate) fn from_parts(inner: S, settings: Arc<Settings>, decompress: D) -> Self {
        Self {
            inner,
            settings,
            decompress,
        }
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, D, ReqBody, ResBody> Service<Request<ReqBody>> for CompressionService<S, D>
where
    D: DecompressRequest<ReqBody>,
    S: Service<Request<D::Body>, Response = Response<ResBody>>,
    ResBody: Body,
{
    type Response = Response<CompressionBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let settings = &self.settings;
        let negotiation = policy::negotiate(
            &req,
            settings.codec,
            &settings.exclusions,
            self.decompress.enabled(),
        );
        tracing::trace!(
            ?negotiation,
            method = %req.method(),
            path = req.uri().path(),
            "negotiated compression"
        );
        req.extensions_mut().insert(negotiation);

        let req = decompress::gate(
            req,
            negotiation.decompresses_request(),
            settings.codec,
            &settings.pool,
            &self.decompress,
        );

        let compress = negotiation
            .compresses_response()
            .then(|| Arc::clone(&self.settings));

        let inner = self.inner.call(req);

        ResponseFuture::new(inner, compress)
    }
}
