use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use preview_shim_http::bindings::wasi::http::outgoing_handler::Host as _;
use preview_shim_http::bindings::wasi::http::types::{
    Host as _, HostFields, HostFutureIncomingResponse, HostFutureTrailers, HostIncomingBody,
    HostIncomingResponse, HostOutgoingBody, HostOutgoingRequest, HostRequestOptions,
};
use preview_shim_http::body::HyperOutgoingBody;
use preview_shim_http::http_impl::send_request_sync;
use preview_shim_http::p3::{self, Request};
use preview_shim_http::types::{
    self, IncomingResponse, Method, OutgoingRequestConfig, Scheme,
};
use preview_shim_http::{
    ErrorCode, Fields, HeaderError, HttpError, HttpResult, WasiHttpCtx, WasiHttpCtxView,
    WasiHttpImpl, WasiHttpView,
};
use preview_shim_io::bindings::wasi::io::streams::{HostInputStream, HostOutputStream};
use preview_shim_io::bridge::SyncBridge;
use preview_shim_io::p3::{future, stream};
use preview_shim_io::{IoImpl, Resource, ResourceTable, StreamError, poll};
use std::time::Duration;
use tokio::sync::oneshot;

mod http_server;

use http_server::Server;

#[derive(Default)]
struct Host {
    ctx: WasiHttpCtx,
    table: ResourceTable,
}

impl Host {
    fn http(&mut self) -> WasiHttpImpl<WasiHttpCtxView<'_>> {
        WasiHttpImpl(WasiHttpCtxView {
            ctx: &mut self.ctx,
            table: &mut self.table,
        })
    }

    fn io(&mut self) -> IoImpl<&mut ResourceTable> {
        IoImpl(&mut self.table)
    }

    async fn wait_for_response(
        &mut self,
        future: &Resource<types::HostFutureIncomingResponse>,
    ) -> Result<Resource<types::HostIncomingResponse>, ErrorCode> {
        let ready = HostFutureIncomingResponse::subscribe(&mut self.http(), future.borrowed())
            .unwrap();
        poll::block(&mut self.table, &ready).await.unwrap();
        poll::delete(&mut self.table, ready).unwrap();
        match HostFutureIncomingResponse::get(&mut self.http(), future.borrowed()).unwrap() {
            Some(Ok(result)) => result,
            other => panic!("response should be ready, got {other:?}"),
        }
    }
}

fn entry(name: &str, value: &str) -> (String, Vec<u8>) {
    (name.to_string(), value.as_bytes().to_vec())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn p2_fields_errors() {
    let mut host = Host::default();

    let err = HostFields::from_list(&mut host.http(), vec![entry("Host", "x")]).unwrap_err();
    assert_eq!(err.tag(), Some("forbidden"));
    assert_eq!(
        host.http().convert_header_error(err).unwrap(),
        HeaderError::Forbidden
    );

    let err = HostFields::from_list(&mut host.http(), vec![entry("bad name", "x")]).unwrap_err();
    assert_eq!(err.tag(), Some("invalid-syntax"));

    let fields = HostFields::from_list(&mut host.http(), vec![entry("a", "1")]).unwrap();
    let copy = HostFields::clone(&mut host.http(), fields.borrowed()).unwrap();
    HostFields::append(&mut host.http(), copy.borrowed(), "a".into(), b"2".to_vec()).unwrap();
    assert_eq!(
        HostFields::get(&mut host.http(), fields.borrowed(), "a".into()).unwrap(),
        vec![b"1".to_vec()]
    );
    assert_eq!(
        HostFields::get_and_delete(&mut host.http(), copy.borrowed(), "A".into()).unwrap(),
        vec![b"1".to_vec(), b"2".to_vec()]
    );

    HostFields::drop(&mut host.http(), fields).unwrap();
    HostFields::drop(&mut host.http(), copy).unwrap();
    assert!(host.table.is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn p2_fields_mutators() {
    let mut host = Host::default();

    let fields = HostFields::new(&mut host.http()).unwrap();
    let mut http = host.http();
    HostFields::set(&mut http, fields.borrowed(), "x-a".into(), vec![b"1".to_vec()]).unwrap();
    HostFields::append(&mut http, fields.borrowed(), "X-A".into(), b"2".to_vec()).unwrap();
    let err = HostFields::set(&mut http, fields.borrowed(), "connection".into(), vec![]).unwrap_err();
    assert_eq!(http.convert_header_error(err).unwrap(), HeaderError::Forbidden);
    let err = HostFields::append(&mut http, fields.borrowed(), "x-a".into(), b"\n".to_vec())
        .unwrap_err();
    assert_eq!(http.convert_header_error(err).unwrap(), HeaderError::InvalidSyntax);
    assert_eq!(
        HostFields::get(&mut http, fields.borrowed(), "x-a".into()).unwrap(),
        vec![b"1".to_vec(), b"2".to_vec()]
    );
    HostFields::delete(&mut http, fields.borrowed(), "x-a".into()).unwrap();
    assert!(!HostFields::has(&mut http, fields.borrowed(), "x-a".into()).unwrap());

    // Headers reached through a request cannot be changed.
    let req = HostOutgoingRequest::new(&mut http, fields).unwrap();
    let headers = HostOutgoingRequest::headers(&mut http, req.borrowed()).unwrap();
    let err = HostFields::set(&mut http, headers.borrowed(), "x-b".into(), vec![b"1".to_vec()])
        .unwrap_err();
    assert_eq!(http.convert_header_error(err).unwrap(), HeaderError::Immutable);
    let err = HostFields::get_and_delete(&mut http, headers.borrowed(), "x-b".into()).unwrap_err();
    assert_eq!(http.convert_header_error(err).unwrap(), HeaderError::Immutable);

    HostFields::drop(&mut http, headers).unwrap();
    HostOutgoingRequest::drop(&mut http, req).unwrap();
    assert!(host.table.is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn p2_post_with_body() {
    let server = Server::http1(1).unwrap();
    let mut host = Host::default();

    let headers = HostFields::from_list(
        &mut host.http(),
        vec![entry("content-type", "text/plain"), entry("content-length", "5")],
    )
    .unwrap();
    let req = HostOutgoingRequest::new(&mut host.http(), headers).unwrap();
    let mut http = host.http();
    http.set_method(req.borrowed(), Method::Post).unwrap().unwrap();
    http.set_scheme(req.borrowed(), Some(Scheme::Http)).unwrap().unwrap();
    http.set_authority(req.borrowed(), Some(server.addr())).unwrap().unwrap();
    http.set_path_with_query(req.borrowed(), Some("/echo?x=1".into()))
        .unwrap()
        .unwrap();
    assert!(
        http.set_authority(req.borrowed(), Some("bad authority".into()))
            .unwrap()
            .is_err()
    );

    // Headers of a request are a read-only view.
    let view = HostOutgoingRequest::headers(&mut http, req.borrowed()).unwrap();
    let err = HostFields::append(&mut http, view.borrowed(), "x-late".into(), b"1".to_vec())
        .unwrap_err();
    assert_eq!(err.tag(), Some("immutable"));
    assert_eq!(
        HostFields::get(&mut http, view.borrowed(), "content-length".into()).unwrap(),
        vec![b"5".to_vec()]
    );
    HostFields::drop(&mut http, view).unwrap();

    let body = HostOutgoingRequest::body(&mut http, req.borrowed()).unwrap().unwrap();
    assert!(HostOutgoingRequest::body(&mut http, req.borrowed()).unwrap().is_err());
    let out = HostOutgoingBody::write(&mut http, body.borrowed()).unwrap().unwrap();
    assert!(HostOutgoingBody::write(&mut http, body.borrowed()).unwrap().is_err());

    let future = http.handle(req, None).unwrap();

    host.io()
        .blocking_write_and_flush(out.borrowed(), b"hello".to_vec())
        .await
        .unwrap();
    HostOutputStream::drop(&mut host.io(), out).await.unwrap();
    HostOutgoingBody::finish(&mut host.http(), body, None).unwrap();

    let resp = host.wait_for_response(&future).await.unwrap();
    // The response can only be taken once.
    assert!(matches!(
        HostFutureIncomingResponse::get(&mut host.http(), future.borrowed()).unwrap(),
        Some(Err(()))
    ));

    let mut http = host.http();
    assert_eq!(HostIncomingResponse::status(&mut http, resp.borrowed()).unwrap(), 200);
    let headers = HostIncomingResponse::headers(&mut http, resp.borrowed()).unwrap();
    assert_eq!(
        HostFields::get(&mut http, headers.borrowed(), "x-shim-test-method".into()).unwrap(),
        vec![b"POST".to_vec()]
    );
    assert_eq!(
        HostFields::get(&mut http, headers.borrowed(), "x-shim-test-uri".into()).unwrap(),
        vec![b"/echo?x=1".to_vec()]
    );
    // Forbidden headers never reach the guest.
    assert!(!HostFields::has(&mut http, headers.borrowed(), "connection".into()).unwrap());
    HostFields::drop(&mut http, headers).unwrap();

    let incoming = HostIncomingResponse::consume(&mut http, resp.borrowed())
        .unwrap()
        .unwrap();
    assert!(HostIncomingResponse::consume(&mut http, resp.borrowed()).unwrap().is_err());
    let input = HostIncomingBody::stream(&mut http, incoming.borrowed())
        .unwrap()
        .unwrap();
    assert!(HostIncomingBody::stream(&mut http, incoming.borrowed()).unwrap().is_err());

    let mut data = Vec::new();
    loop {
        match host.io().blocking_read(input.borrowed(), 1024).await {
            Ok(bytes) => data.extend(bytes),
            Err(StreamError::Closed) => break,
            Err(e) => panic!("unexpected stream error: {e:?}"),
        }
    }
    assert_eq!(data, b"hello");
    HostInputStream::drop(&mut host.io(), input).await.unwrap();

    let trailers = HostIncomingBody::finish(&mut host.http(), incoming).unwrap();
    let ready = HostFutureTrailers::subscribe(&mut host.http(), trailers.borrowed()).unwrap();
    poll::block(&mut host.table, &ready).await.unwrap();
    poll::delete(&mut host.table, ready).unwrap();
    assert!(matches!(
        HostFutureTrailers::get(&mut host.http(), trailers.borrowed()).unwrap(),
        Some(Ok(Ok(None)))
    ));
    assert!(matches!(
        HostFutureTrailers::get(&mut host.http(), trailers.borrowed()).unwrap(),
        Some(Err(()))
    ));

    HostFutureTrailers::drop(&mut host.http(), trailers).unwrap();
    HostIncomingResponse::drop(&mut host.http(), resp).unwrap();
    HostFutureIncomingResponse::drop(&mut host.http(), future).unwrap();
    assert!(host.table.is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn p2_connection_refused() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let mut host = Host::default();

    let options = HostRequestOptions::new(&mut host.http()).unwrap();
    HostRequestOptions::set_connect_timeout(&mut host.http(), options.borrowed(), Some(5_000_000_000))
        .unwrap()
        .unwrap();
    assert_eq!(
        HostRequestOptions::connect_timeout(&mut host.http(), options.borrowed()).unwrap(),
        Some(5_000_000_000)
    );

    let headers = HostFields::new(&mut host.http()).unwrap();
    let req = HostOutgoingRequest::new(&mut host.http(), headers).unwrap();
    let mut http = host.http();
    http.set_scheme(req.borrowed(), Some(Scheme::Http)).unwrap().unwrap();
    http.set_authority(req.borrowed(), Some(addr.to_string())).unwrap().unwrap();
    let future = http.handle(req, Some(options.borrowed())).unwrap();

    let err = host.wait_for_response(&future).await.unwrap_err();
    assert_eq!(err, ErrorCode::ConnectionRefused);
    assert_eq!(err.tag(), "connection-refused");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn p2_unsupported_scheme_fails_the_call() {
    let mut host = Host::default();
    let headers = HostFields::new(&mut host.http()).unwrap();
    let req = HostOutgoingRequest::new(&mut host.http(), headers).unwrap();
    let mut http = host.http();
    http.set_scheme(req.borrowed(), Some(Scheme::Other("ftp".into())))
        .unwrap()
        .unwrap();
    http.set_authority(req.borrowed(), Some("example.com".into()))
        .unwrap()
        .unwrap();
    let err = http.handle(req, None).unwrap_err();
    assert_eq!(
        http.convert_error_code(err).unwrap(),
        ErrorCode::HttpProtocolError
    );
}

/// A host that answers every request itself once it is told to.
struct GatedHost {
    ctx: WasiHttpCtx,
    table: ResourceTable,
    release: Option<oneshot::Receiver<()>>,
    used_tls: Option<bool>,
}

impl WasiHttpView for GatedHost {
    fn ctx(&mut self) -> &mut WasiHttpCtx {
        &mut self.ctx
    }

    fn table(&mut self) -> &mut ResourceTable {
        &mut self.table
    }

    fn send_request(
        &mut self,
        request: hyper::Request<HyperOutgoingBody>,
        config: OutgoingRequestConfig,
    ) -> HttpResult<types::HostFutureIncomingResponse> {
        assert_eq!(request.uri().host(), Some("example.com"));
        self.used_tls = Some(config.use_tls);
        let release = self
            .release
            .take()
            .ok_or_else(|| HttpError::trap(anyhow::anyhow!("only one request expected")))?;
        let handle = preview_shim_io::runtime::spawn(async move {
            _ = release.await;
            let resp = http::Response::builder()
                .status(204)
                .header("connection", "close")
                .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())?;
            Ok::<_, anyhow::Error>(Ok(IncomingResponse {
                resp,
                worker: None,
                between_bytes_timeout: Duration::from_secs(1),
            }))
        });
        Ok(types::HostFutureIncomingResponse::pending(handle))
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn pending_response_reads_as_none() {
    let (release, gate) = oneshot::channel();
    let mut host = GatedHost {
        ctx: WasiHttpCtx::new(),
        table: ResourceTable::new(),
        release: Some(gate),
        used_tls: None,
    };
    let mut http = WasiHttpImpl(&mut host);

    let headers = HostFields::new(&mut http).unwrap();
    let req = HostOutgoingRequest::new(&mut http, headers).unwrap();
    http.set_authority(req.borrowed(), Some("example.com".into()))
        .unwrap()
        .unwrap();
    let future = http.handle(req, None).unwrap();

    for _ in 0..3 {
        assert!(
            HostFutureIncomingResponse::get(&mut http, future.borrowed())
                .unwrap()
                .is_none()
        );
    }

    release.send(()).unwrap();
    let ready = HostFutureIncomingResponse::subscribe(&mut http, future.borrowed()).unwrap();
    poll::block(http.table(), &ready).await.unwrap();
    poll::delete(http.table(), ready).unwrap();
    let resp = match HostFutureIncomingResponse::get(&mut http, future.borrowed()).unwrap() {
        Some(Ok(Ok(resp))) => resp,
        other => panic!("expected a response, got {other:?}"),
    };
    assert_eq!(HostIncomingResponse::status(&mut http, resp.borrowed()).unwrap(), 204);
    let headers = HostIncomingResponse::headers(&mut http, resp.borrowed()).unwrap();
    assert!(HostFields::entries(&mut http, headers.borrowed()).unwrap().is_empty());

    drop(http);
    // Requests default to https.
    assert_eq!(host.used_tls, Some(true));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn p3_request_round_trip() {
    let server = Server::http1(1).unwrap();
    let mut host = Host::default();

    let headers = Fields::from_list(&host.ctx, [entry("x-p3", "yes")]).unwrap();
    let (contents_tx, contents) = stream();
    let (mut trailers_tx, trailers) = future();
    let (mut req, transmitted) = Request::new(headers, Some(contents), trailers, None);
    req.set_method(Method::Put).unwrap();
    req.set_scheme(Some(Scheme::Http)).unwrap();
    req.set_authority(Some(server.addr())).unwrap();
    req.set_path_with_query(Some("/p3".into())).unwrap();

    let writer = tokio::spawn(async move {
        contents_tx.write(b"ping".to_vec()).await.unwrap();
        contents_tx.close();
        trailers_tx.write(Ok(None));
    });

    let mut resp = p3::send_request(&mut host.http(), req).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("x-shim-test-method"), vec![b"PUT".to_vec()]);
    assert!(resp.headers().is_immutable());

    let (mut body, trailers) = resp.body().unwrap();
    assert!(resp.body().is_err());
    assert_eq!(body.read_all().await, b"ping");
    assert_eq!(trailers.read().await, Some(Ok(None)));
    assert_eq!(transmitted.read().await, Some(Ok(())));
    writer.await.unwrap();
}

#[test_log::test]
fn sync_request() {
    let server = Server::http1(1).unwrap();
    let bridge = SyncBridge::new("http-sync").unwrap();

    let request = http::Request::builder()
        .method("POST")
        .uri(format!("http://{}/sync", server.addr()))
        .header("host", server.addr())
        .body(Bytes::from_static(b"sync body"))
        .unwrap();
    let resp = send_request_sync(&bridge, request, OutgoingRequestConfig::default())
        .unwrap()
        .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.headers["x-shim-test-uri"], "/sync");
    assert_eq!(resp.body, "sync body");
    assert!(resp.trailers.is_none());
}

#[test_log::test]
fn sync_request_reports_transport_errors() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let bridge = SyncBridge::new("http-sync").unwrap();
    let request = http::Request::builder()
        .uri(format!("http://{addr}/"))
        .body(Bytes::new())
        .unwrap();
    let err = send_request_sync(&bridge, request, OutgoingRequestConfig::default())
        .unwrap()
        .unwrap_err();
    assert_eq!(err, ErrorCode::ConnectionRefused);
}
