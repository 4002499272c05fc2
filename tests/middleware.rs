use bytes::Bytes;
use flate2::Compression;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use flate2::write::GzEncoder;
use http::{HeaderMap, Request, Response, StatusCode, header};
use http_body::{Body, Frame};
use http_body_util::{BodyExt, Full};
use http_body_compression::{
    BoxError, Codec, CodecPool, CompressionLayer, CompressionLevel, DecompressionBody,
    Negotiation,
};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::io::{Read, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, ServiceExt, service_fn};

const LOREM: &str = "nulla facilisi morbi tempus iaculis urna id volutpat lacus laoreet non curabitur gravida arcu ac tortor dignissim convallis aenean et tortor at risus viverra adipiscing ";

type Decompressed = DecompressionBody<Full<Bytes>>;

fn text(words: usize) -> String {
    LOREM.split_whitespace().cycle().take(words).collect::<Vec<_>>().join(" ")
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    MultiGzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

async fn echo<B>(req: Request<B>) -> Result<Response<Full<Bytes>>, BoxError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(Into::<BoxError>::into)?
        .to_bytes();
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Full::new(body))?)
}

async fn strict(req: Request<Decompressed>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.into_body().collect().await {
        Ok(collected) => Response::new(Full::new(collected.to_bytes())),
        Err(err) if err.is_decompression() => Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Full::new(Bytes::from_static(b"invalid request body")))
            .unwrap(),
        Err(_) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::new(Bytes::new()))
            .unwrap(),
    };
    Ok(response)
}

fn gzip_request(uri: &str, body: Vec<u8>) -> Request<Full<Bytes>> {
    Request::post(uri)
        .header(header::CONTENT_ENCODING, "gzip")
        .header(header::ACCEPT_ENCODING, "gzip")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn plain_request(uri: &str, accept: Option<&str>, body: &str) -> Request<Full<Bytes>> {
    let mut builder = Request::post(uri);
    if let Some(accept) = accept {
        builder = builder.header(header::ACCEPT_ENCODING, accept);
    }
    builder
        .body(Full::new(Bytes::copy_from_slice(body.as_bytes())))
        .unwrap()
}

async fn read_body<B>(body: B) -> Bytes
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Debug,
{
    body.collect().await.unwrap().to_bytes()
}

fn assert_compressed_head(headers: &HeaderMap, encoding: &str) {
    assert_eq!(headers.get(header::CONTENT_ENCODING).unwrap(), encoding);
    assert!(headers.get(header::CONTENT_LENGTH).is_none());
    assert!(
        headers
            .get_all(header::VARY)
            .iter()
            .any(|v| v.to_str().unwrap().contains("accept-encoding"))
    );
}

/// Response body yielding a fixed list of chunks.
struct Chunks(VecDeque<Bytes>);

impl Body for Chunks {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        Poll::Ready(self.0.pop_front().map(|chunk| Ok(Frame::data(chunk))))
    }
}

#[tokio::test]
async fn test_echo_round_trip_sizes() {
    let layer = CompressionLayer::new().decompress_requests();

    for words in [0, 25, 1_000, 10_000, 1_550 * 100] {
        let payload = if words == 0 { String::new() } else { text(words) };
        let svc = layer.layer(service_fn(echo::<Decompressed>));

        let response = svc
            .oneshot(gzip_request("/echo", gzip(payload.as_bytes())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_compressed_head(response.headers(), "gzip");

        let body = read_body(response.into_body()).await;
        assert_eq!(gunzip(&body), payload.as_bytes(), "size {words} words");
    }
}

#[tokio::test]
async fn test_plain_request_gets_compressed_response() {
    let svc = CompressionLayer::new()
        .decompress_requests()
        .layer(service_fn(echo::<Decompressed>));
    let payload = text(500);

    let response = svc
        .oneshot(plain_request("/echo", Some("gzip"), &payload))
        .await
        .unwrap();

    assert_compressed_head(response.headers(), "gzip");
    let body = read_body(response.into_body()).await;
    assert_eq!(gunzip(&body), payload.as_bytes());
}

#[tokio::test]
async fn test_no_accept_encoding_passes_through() {
    let svc = CompressionLayer::new()
        .decompress_requests()
        .layer(service_fn(echo::<Decompressed>));
    let payload = text(100);

    let response = svc
        .oneshot(plain_request("/echo", None, &payload))
        .await
        .unwrap();

    assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    assert_eq!(
        response.headers().get(header::CONTENT_LENGTH).unwrap(),
        payload.len().to_string().as_str()
    );
    assert_eq!(read_body(response.into_body()).await, payload.as_bytes());
}

#[tokio::test]
async fn test_request_decompression_is_opt_in() {
    let svc = CompressionLayer::new().layer(service_fn(|req: Request<Full<Bytes>>| async move {
        let encoding = req.headers().get(header::CONTENT_ENCODING).cloned();
        let body = req.into_body().collect().await?.to_bytes();
        let mut response = Response::new(Full::new(body));
        if let Some(encoding) = encoding {
            response.headers_mut().insert("x-request-encoding", encoding);
        }
        Ok::<_, Infallible>(response)
    }));
    let compressed = gzip(b"hello");

    let response = svc
        .oneshot(gzip_request("/raw", compressed.clone()))
        .await
        .unwrap();

    assert_eq!(response.headers().get("x-request-encoding").unwrap(), "gzip");
    let body = read_body(response.into_body()).await;
    // the handler saw the compressed bytes, then the response was compressed again
    assert_eq!(gunzip(&body), compressed);
}

#[tokio::test]
async fn test_handler_encoded_response_is_not_recompressed() {
    let precompressed = Bytes::from(gzip(text(200).as_bytes()));
    let expected = precompressed.clone();
    let svc = CompressionLayer::new().layer(service_fn(move |_req: Request<Full<Bytes>>| {
        let body = precompressed.clone();
        async move {
            Ok::<_, Infallible>(
                Response::builder()
                    .header(header::CONTENT_ENCODING, "gzip")
                    .body(Full::new(body))
                    .unwrap(),
            )
        }
    }));

    let response = svc
        .oneshot(plain_request("/pre", Some("gzip"), ""))
        .await
        .unwrap();

    assert_eq!(response.headers().get(header::CONTENT_ENCODING).unwrap(), "gzip");
    assert_eq!(read_body(response.into_body()).await, expected);
}

#[tokio::test]
async fn test_excluded_paths_match_unwrapped_handler() {
    let payload = text(300);
    let baseline = echo(plain_request("/static/app.json", None, &payload))
        .await
        .unwrap();
    let baseline_body = read_body(baseline.into_body()).await;

    let layer = CompressionLayer::new()
        .exclude_paths(["/static"])
        .exclude_path_patterns([r"^/v[0-9]+/raw/"])
        .unwrap();

    for uri in ["/static/app.json", "/logo.png", "/v2/raw/dump"] {
        let svc = layer.layer(service_fn(echo::<Full<Bytes>>));
        let response = svc
            .oneshot(plain_request(uri, Some("gzip"), &payload))
            .await
            .unwrap();

        assert!(
            response.headers().get(header::CONTENT_ENCODING).is_none(),
            "{uri} was compressed"
        );
        assert_eq!(read_body(response.into_body()).await, baseline_body);
    }
}

#[tokio::test]
async fn test_corrupt_request_body_reaches_handler_as_error() {
    let svc = CompressionLayer::new()
        .decompress_requests()
        .layer(service_fn(strict));

    let response = svc
        .oneshot(gzip_request("/upload", b"definitely not gzip".to_vec()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_truncated_request_body_reaches_handler_as_error() {
    let svc = CompressionLayer::new()
        .decompress_requests()
        .layer(service_fn(strict));
    let mut compressed = gzip(text(1_000).as_bytes());
    compressed.truncate(compressed.len() / 2);

    let response = svc
        .oneshot(gzip_request("/upload", compressed))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_write_patterns_produce_same_head() {
    for chunks in [0, 1, 64] {
        let svc = CompressionLayer::new().layer(service_fn(move |_req: Request<Full<Bytes>>| {
            let parts = (0..chunks)
                .map(|i| Bytes::from(format!("chunk {i} {LOREM}")))
                .collect::<VecDeque<_>>();
            let total: usize = parts.iter().map(Bytes::len).sum();
            async move {
                Ok::<_, Infallible>(
                    Response::builder()
                        .header(header::CONTENT_TYPE, "text/plain")
                        .header(header::CONTENT_LENGTH, total)
                        .body(Chunks(parts))
                        .unwrap(),
                )
            }
        }));

        let response = svc
            .oneshot(plain_request("/stream", Some("gzip, deflate"), ""))
            .await
            .unwrap();

        assert_compressed_head(response.headers(), "gzip");
        let body = read_body(response.into_body()).await;
        let expected: String = (0..chunks).map(|i| format!("chunk {i} {LOREM}")).collect();
        assert_eq!(gunzip(&body), expected.as_bytes(), "{chunks} writes");
    }
}

#[tokio::test]
async fn test_deflate_response() {
    let svc = CompressionLayer::with_codec(Codec::Deflate, CompressionLevel::Best)
        .unwrap()
        .layer(service_fn(echo::<Full<Bytes>>));
    let payload = text(2_000);

    let response = svc
        .oneshot(plain_request("/echo", Some("gzip, deflate"), &payload))
        .await
        .unwrap();

    assert_compressed_head(response.headers(), "deflate");
    let body = read_body(response.into_body()).await;
    let mut out = Vec::new();
    ZlibDecoder::new(&body[..]).read_to_end(&mut out).unwrap();
    assert_eq!(out, payload.as_bytes());
}

#[tokio::test]
async fn test_zstd_both_directions() {
    let codecs = Arc::new(CodecPool::new());
    let svc = CompressionLayer::with_codec(Codec::Zstd, CompressionLevel::Default)
        .unwrap()
        .pool(Arc::clone(&codecs))
        .decompress_requests()
        .layer(service_fn(echo::<Decompressed>));
    let payload = text(5_000);

    let client = CodecPool::new();
    let client = Arc::new(client);
    let mut encoder = client
        .acquire_encoder(Codec::Zstd, CompressionLevel::Default)
        .unwrap();
    let mut compressed = encoder.encode(payload.as_bytes()).unwrap().to_vec();
    compressed.extend_from_slice(&encoder.finish().unwrap());

    let request = Request::post("/echo")
        .header(header::CONTENT_ENCODING, "zstd")
        .header(header::ACCEPT_ENCODING, "zstd")
        .body(Full::new(Bytes::from(compressed)))
        .unwrap();
    let response = svc.oneshot(request).await.unwrap();

    assert_compressed_head(response.headers(), "zstd");
    let body = read_body(response.into_body()).await;
    let decoded = client.acquire_decoder(Codec::Zstd).decode(&body).unwrap();
    assert!(decoded.done);
    assert_eq!(decoded.output, payload.as_bytes());
    assert_eq!(codecs.outstanding(), 0);
}

#[tokio::test]
async fn test_negotiation_visible_to_handler() {
    let cases = [
        (None, None, Negotiation::Skip),
        (Some("gzip"), None, Negotiation::DecompressRequest),
        (None, Some("gzip"), Negotiation::CompressResponse),
        (Some("gzip"), Some("gzip"), Negotiation::Both),
    ];

    for (content_encoding, accept_encoding, expected) in cases {
        let svc = CompressionLayer::new()
            .decompress_requests()
            .layer(service_fn(|req: Request<Decompressed>| async move {
                let negotiation = req.extensions().get::<Negotiation>().copied();
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(format!(
                    "{negotiation:?}"
                )))))
            }));

        let mut builder = Request::get("/negotiate");
        if let Some(value) = content_encoding {
            builder = builder.header(header::CONTENT_ENCODING, value);
        }
        if let Some(value) = accept_encoding {
            builder = builder.header(header::ACCEPT_ENCODING, value);
        }
        let body = match content_encoding {
            Some(_) => Bytes::from(gzip(b"")),
            None => Bytes::new(),
        };
        let response = svc
            .oneshot(builder.body(Full::new(body)).unwrap())
            .await
            .unwrap();

        let compressed = response.headers().contains_key(header::CONTENT_ENCODING);
        let body = read_body(response.into_body()).await;
        let body = if compressed { gunzip(&body) } else { body.to_vec() };
        assert_eq!(body, format!("{:?}", Some(expected)).as_bytes());
    }
}

#[tokio::test]
async fn test_negotiation_without_decompression_gate() {
    let cases = [
        (None, Negotiation::Skip),
        (Some("gzip"), Negotiation::CompressResponse),
    ];

    for (accept_encoding, expected) in cases {
        let svc = CompressionLayer::new().layer(service_fn(|req: Request<Full<Bytes>>| async move {
            let negotiation = req.extensions().get::<Negotiation>().copied();
            let body = req.into_body().collect().await?.to_bytes();
            let mut response = Response::new(Full::new(body));
            response.headers_mut().insert(
                "x-negotiation",
                format!("{negotiation:?}").parse().unwrap(),
            );
            Ok::<_, Infallible>(response)
        }));

        let compressed = gzip(b"still compressed");
        let mut builder = Request::post("/upload").header(header::CONTENT_ENCODING, "gzip");
        if let Some(value) = accept_encoding {
            builder = builder.header(header::ACCEPT_ENCODING, value);
        }
        let response = svc
            .oneshot(builder.body(Full::new(Bytes::from(compressed.clone()))).unwrap())
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("x-negotiation").unwrap(),
            format!("{:?}", Some(expected)).as_str()
        );
        let responded = response.headers().contains_key(header::CONTENT_ENCODING);
        let body = read_body(response.into_body()).await;
        let body = if responded { gunzip(&body) } else { body.to_vec() };
        // the handler received the request bytes untouched
        assert_eq!(body, compressed);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_return_every_handle() {
    let codecs = Arc::new(CodecPool::new());
    let svc = CompressionLayer::new()
        .pool(Arc::clone(&codecs))
        .decompress_requests()
        .layer(service_fn(echo::<Decompressed>));

    let handles = (0..128)
        .map(|i| {
            let svc = svc.clone();
            let payload = format!("request {i}: {}", text(200 + i));
            tokio::spawn(async move {
                let response = svc
                    .oneshot(gzip_request("/echo", gzip(payload.as_bytes())))
                    .await
                    .unwrap();
                let body = read_body(response.into_body()).await;
                assert_eq!(gunzip(&body), payload.as_bytes());
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(codecs.outstanding(), 0);
    assert!(codecs.idle_decoders(Codec::Gzip) > 0);
    assert!(codecs.idle_encoders(Codec::Gzip, CompressionLevel::Default) > 0);
}
