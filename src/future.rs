use crate::body::CompressionBody;
use crate::layer::Settings;
use crate::policy;
use http::{Response, header};
use http_body::Body;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pin_project! {
    /// Future for compression service responses.
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        settings: Option<Arc<Settings>>,
    }
}

impl<F> ResponseFuture<F> {
    /// `settings` is `None` when negotiation already ruled out compression.
    pub(crate) fn new(inner: F, settings: Option<Arc<Settings>>) -> Self {
        Self { inner, settings }
    }
}

impl<F, B, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Body,
{
    type Output = Result<Response<CompressionBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.inner.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(response)) => {
                let response = wrap_response(response, this.settings.as_deref());
                Poll::Ready(Ok(response))
            }
        }
    }
}

/// Wraps the response body with compression if appropriate.
///
/// Runs on the response head before any body byte is polled, so header
/// changes always precede the first compressed byte.
fn wrap_response<B>(response: Response<B>, settings: Option<&Settings>) -> Response<CompressionBody<B>>
where
    B: Body,
{
    let Some(settings) = settings else {
        return response.map(CompressionBody::passthrough);
    };

    let (mut parts, body) = response.into_parts();

    if let Some(reason) = settings
        .response
        .veto(parts.status, &parts.headers, &body.size_hint())
    {
        tracing::trace!(reason, "response not compressed");
        return Response::from_parts(parts, CompressionBody::passthrough(body));
    }

    let encoder = match settings.pool.acquire_encoder(settings.codec, settings.level) {
        Ok(encoder) => encoder,
        Err(error) => {
            // Send the original bytes rather than fail the response
            tracing::warn!(%error, "no encoder available, response not compressed");
            return Response::from_parts(parts, CompressionBody::passthrough(body));
        }
    };

    let always_flush = policy::is_streaming(&parts.headers);

    // Add Content-Encoding header
    parts.headers.insert(
        header::CONTENT_ENCODING,
        header::HeaderValue::from_static(settings.codec.content_encoding()),
    );

    // Remove Content-Length since compressed size is unknown; the server
    // falls back to chunked (HTTP/1.1) or streamed (HTTP/2) framing.
    parts.headers.remove(header::CONTENT_LENGTH);

    // Remove Accept-Ranges since we can't support ranges on compressed content
    parts.headers.remove(header::ACCEPT_RANGES);

    // Add Accept-Encoding to Vary header if not present
    add_vary_accept_encoding(&mut parts.headers);

    tracing::trace!(
        codec = %settings.codec,
        encoder = encoder.id(),
        always_flush,
        "compressing response"
    );

    Response::from_parts(parts, CompressionBody::compressed(body, encoder, always_flush))
}

/// Adds Accept-Encoding to the Vary header if not already present.
fn add_vary_accept_encoding(headers: &mut header::HeaderMap) {
    // Check all Vary headers to see if Accept-Encoding is already present
    for vary in headers.get_all(header::VARY) {
        if let Ok(vary_str) = vary.to_str() {
            let covered = vary_str.split(',').any(|v| {
                let v = v.trim();
                v.eq_ignore_ascii_case("*") || v.eq_ignore_ascii_case("accept-encoding")
            });
            if covered {
                return;
            }
        }
    }

    // Append Accept-Encoding to Vary header
    headers.append(
        header::VARY,
        header::HeaderValue::from_static("accept-encoding"),
    );
}
