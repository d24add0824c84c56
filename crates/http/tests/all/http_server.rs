use anyhow::{Context as _, Result};
use hyper::service::service_fn;
use hyper::{Request, Response};
use preview_shim_http::io::TokioIo;
use std::future::Future;
use std::net::{SocketAddr, TcpStream};
use std::thread::JoinHandle;
use tokio::net::TcpListener;
use tracing::{debug, trace, warn};

/// Answers every request with its own body, reporting the method and URI it
/// saw in response headers.
async fn echo(
    req: Request<hyper::body::Incoming>,
) -> http::Result<Response<hyper::body::Incoming>> {
    debug!(?req, "preparing echo response for request");
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    Response::builder()
        .header("x-shim-test-method", method)
        .header("x-shim-test-uri", uri)
        .body(req.into_body())
}

pub struct Server {
    conns: usize,
    addr: SocketAddr,
    worker: Option<JoinHandle<()>>,
}

impl Server {
    fn new<F>(
        conns: usize,
        run: impl Fn(TokioIo<tokio::net::TcpStream>) -> F + Send + 'static,
    ) -> Result<Self>
    where
        F: Future<Output = Result<()>>,
    {
        let thread = std::thread::spawn(|| -> Result<_> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to start tokio runtime")?;
            let listener = rt.block_on(async move {
                let addr = SocketAddr::from(([127, 0, 0, 1], 0));
                TcpListener::bind(addr).await.context("failed to bind")
            })?;
            Ok((rt, listener))
        });
        let (rt, listener) = thread.join().unwrap()?;
        let addr = listener.local_addr().context("failed to get local addr")?;
        let worker = std::thread::spawn(move || {
            rt.block_on(async move {
                for i in 0..conns {
                    match listener.accept().await {
                        Ok((stream, ..)) => {
                            debug!(i, "accepted connection");
                            if let Err(err) = run(TokioIo::new(stream)).await {
                                warn!(i, ?err, "failed to serve connection");
                            }
                        }
                        Err(err) => {
                            warn!(i, ?err, "failed to accept connection");
                        }
                    };
                }
            })
        });
        Ok(Self {
            conns,
            worker: Some(worker),
            addr,
        })
    }

    /// An HTTP/1.1 echo server accepting `conns` connections.
    pub fn http1(conns: usize) -> Result<Self> {
        Self::new(conns, |io| async move {
            let mut builder = hyper::server::conn::http1::Builder::new();
            let http = builder.keep_alive(false).pipeline_flush(true);
            let conn = http.serve_connection(io, service_fn(echo)).await;
            trace!("connection result {:?}", conn);
            conn?;
            Ok(())
        })
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("shutting down http1 server");
        for _ in 0..self.conns {
            // Force a connection to happen in case one hasn't happened already.
            let _ = TcpStream::connect(self.addr);
        }
        if let Some(worker) = self.worker.take() {
            worker.join().unwrap();
        }
    }
}
