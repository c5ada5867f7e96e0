use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use telepresence_runner::Runner;
use tokio::net::TcpListener;

use crate::SshError;

/// A dumb HTTP server for the proxy pod to poll: 200 for any HEAD request.
/// Doubles as keep-alive traffic so `kubectl port-forward` never idles out.
pub async fn launch_local_server(runner: &Arc<Runner>, port: u16) -> Result<(), SshError> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(SshError::Beacon)?;
    runner.write(&format!("Web server for proxy poll running on port {}", port));

    let runner = runner.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                break;
            };
            let runner = runner.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<hyper::body::Incoming>| {
                    let runner = runner.clone();
                    async move {
                        let status = if request.method() == Method::HEAD {
                            runner.write("(proxy checking local liveness)");
                            StatusCode::OK
                        } else {
                            StatusCode::METHOD_NOT_ALLOWED
                        };
                        let response = Response::builder()
                            .status(status)
                            .body(Empty::<Bytes>::new())
                            .expect("static response builds");
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::find_free_port;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn answers_head_requests_with_200() {
        let runner = Runner::new("-", false, "0.0.0-test").unwrap();
        let port = find_free_port().unwrap();
        launch_local_server(&runner, port).await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream
            .write_all(b"HEAD / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        let head = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(head.starts_with("HTTP/1.1 200"), "got: {}", head);
    }
}
