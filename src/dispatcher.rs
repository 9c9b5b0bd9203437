//! 연결 디스패처
//!
//! tokio로 연결을 수락하고, 읽기 가능해질 때마다 요청 처리 작업을 스레드 풀에
//! 넣는다. 작업이 끝날 때까지 그 연결은 다시 감시하지 않으므로 연결당 처리
//! 중인 요청은 항상 하나다.
//!
//! 워커는 `BlockingStream`으로 동기 I/O를 한다. `Handle::block_on`에 의존하므로
//! 멀티 스레드 런타임에서만 동작한다.

use std::future::Future;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::pool::ThreadPool;
use crate::server::Server;
use crate::session::ConnectionId;
use crate::Result;

/// 비동기 소켓을 워커 스레드의 동기 Read/Write로 연결
pub struct BlockingStream {
    stream: Arc<TcpStream>,
    handle: Handle,
}

impl BlockingStream {
    pub fn new(stream: Arc<TcpStream>, handle: Handle) -> Self {
        Self { stream, handle }
    }
}

impl Read for BlockingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.try_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.handle.block_on(self.stream.readable())?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Write for BlockingStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.stream.try_write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.handle.block_on(self.stream.writable())?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 수락 루프 + 연결별 준비 감시
pub struct Dispatcher {
    server: Arc<Server>,
    pool: Arc<ThreadPool>,
}

impl Dispatcher {
    pub fn new(server: Arc<Server>, pool: Arc<ThreadPool>) -> Self {
        Self { server, pool }
    }

    /// `shutdown`이 완료될 때까지 연결 수락
    pub async fn run<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.server.clone();
                            let pool = self.pool.clone();
                            tokio::spawn(drive_connection(server, pool, stream, peer));
                        }
                        Err(e) => warn!("accept 실패: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    info!("Dispatcher stopping");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// 연결 하나: 읽기 가능 -> 풀에 작업 제출 -> 완료 대기 반복
async fn drive_connection(server: Arc<Server>, pool: Arc<ThreadPool>, stream: TcpStream, peer: SocketAddr) {
    let conn = ConnectionId::next();
    let _ = stream.set_nodelay(true);
    server.open_connection(conn);
    info!("Connection from {} ({})", peer, conn);

    let stream = Arc::new(stream);
    let handle = Handle::current();

    loop {
        if let Err(e) = stream.readable().await {
            debug!("{}: readiness error: {}", conn, e);
            break;
        }

        let (done_tx, done_rx) = oneshot::channel();
        let mut io = BlockingStream::new(stream.clone(), handle.clone());
        let task_server = server.clone();
        let task = move || {
            let keep_open = task_server.serve_one(conn, &mut io);
            let _ = done_tx.send(keep_open);
        };

        // 큐가 가득 차면 submit이 블록되므로 블로킹 스레드에서 호출
        let task_pool = pool.clone();
        match tokio::task::spawn_blocking(move || task_pool.submit(task)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("{}: 작업 제출 실패: {}", conn, e);
                break;
            }
            Err(e) => {
                warn!("{}: 제출 스레드 실패: {}", conn, e);
                break;
            }
        }

        // 풀 종료로 작업이 버려지면 송신측이 drop되어 Err
        match done_rx.await {
            Ok(true) => continue,
            Ok(false) | Err(_) => break,
        }
    }

    server.close_connection(conn);
    info!("{} closed ({})", conn, peer);
}
