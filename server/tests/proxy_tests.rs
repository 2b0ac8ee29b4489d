//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! End-to-end proxy tests: client -> ProxyServer -> upstream

use relaygate_server::{ProxyServer, ServerConfig, ServerError};
use relaygate_service::{
    CallbackHandler, IoWorkerPool, PipeAcceptor, ResourceAddress, WorkerPoolConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream echoing every connection, reporting when a connection ends
async fn echo_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = closed_tx.send(());
            });
        }
    });
    (addr, closed)
}

/// Upstream handing each accepted connection to the test
async fn captured_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, streams) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if tx.send(stream).is_err() {
                break;
            }
        }
    });
    (addr, streams)
}

fn config(upstream: ResourceAddress) -> ServerConfig {
    ServerConfig::new("127.0.0.1:0".parse().unwrap(), upstream)
        .with_workers(WorkerPoolConfig::new(2))
        .with_connect_timeout(Duration::from_secs(2))
        .with_shutdown_timeout(Duration::from_secs(5))
}

fn tcp(addr: SocketAddr) -> ResourceAddress {
    format!("tcp://{}", addr).parse().unwrap()
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut data))
        .await
        .unwrap()
        .unwrap();
    data
}

/// Wait until the peer closes the stream
async fn assert_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    loop {
        let read = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
            .await
            .expect("peer did not close in time");
        match read {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_relays_in_order() {
    let (upstream, _closed) = echo_upstream().await;
    let server = ProxyServer::new(config(tcp(upstream))).unwrap();
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut expected = Vec::new();
    for i in 0..50 {
        let chunk = format!("chunk-{:02};", i);
        client.write_all(chunk.as_bytes()).await.unwrap();
        expected.extend_from_slice(chunk.as_bytes());
    }
    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);
    assert_eq!(server.session_count(), 1);

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_close_closes_upstream() {
    let (upstream, mut closed) = echo_upstream().await;
    let server = ProxyServer::new(config(tcp(upstream))).unwrap();
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    assert_eq!(read_exactly(&mut client, 4).await, b"ping");

    drop(client);
    tokio::time::timeout(TIMEOUT, closed.recv())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upstream_close_closes_client() {
    let (upstream, mut streams) = captured_upstream().await;
    let server = ProxyServer::new(config(tcp(upstream))).unwrap();
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut upstream_stream = tokio::time::timeout(TIMEOUT, streams.recv())
        .await
        .unwrap()
        .unwrap();

    upstream_stream.write_all(b"greeting").await.unwrap();
    assert_eq!(read_exactly(&mut client, 8).await, b"greeting");

    drop(upstream_stream);
    assert_eof(&mut client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_upstream_closes_client() {
    let dead = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let server = ProxyServer::new(config(tcp(dead))).unwrap();
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eof(&mut client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_to_pipe_upstream() {
    let workers = Arc::new(IoWorkerPool::new(&WorkerPoolConfig::new(2)).unwrap());
    let pipes = PipeAcceptor::new(workers.clone());
    let shout = CallbackHandler {
        on_message: Some(Box::new(|session, message| {
            if let Some(buffer) = message.as_buffer() {
                session.write(buffer.to_bytes().to_ascii_uppercase());
            }
        })),
        ..Default::default()
    };
    pipes.bind("shout", Arc::new(shout)).unwrap();

    let server = ProxyServer::builder(config("pipe://shout".parse().unwrap()))
        .with_workers(workers)
        .with_connector(Arc::new(pipes.connector()))
        .build()
        .unwrap();
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"quiet").await.unwrap();
    assert_eq!(read_exactly(&mut client, 5).await, b"QUIET");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_sessions_are_closed() {
    let (upstream, _closed) = echo_upstream().await;
    let server = ProxyServer::new(
        config(tcp(upstream))
            .with_idle_timeout(Some(Duration::from_millis(200)))
            .with_idle_check_interval(Duration::from_millis(50)),
    )
    .unwrap();
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eof(&mut client).await;
    assert!(server.metrics().snapshot().idle_closes >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_sessions() {
    let (upstream, mut closed) = echo_upstream().await;
    let server = ProxyServer::new(config(tcp(upstream))).unwrap();
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    assert_eq!(read_exactly(&mut client, 2).await, b"hi");

    server.shutdown().await.unwrap();
    assert_eof(&mut client).await;
    tokio::time::timeout(TIMEOUT, closed.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
    assert!(matches!(server.shutdown().await, Err(ServerError::NotRunning)));
}
