#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcb_client::{ConnectionConfig, ServerConfig, Status};
use mcb_common::{Header, DATA_TYPE_RAW, HEADER_SIZE, MAGIC_REQUEST, MAGIC_RESPONSE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A request as seen by the fake server.
#[derive(Debug, Clone)]
pub struct Request {
    pub opcode: u8,
    pub sequence: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Request {
    pub fn key_str(&self) -> &str {
        std::str::from_utf8(&self.key).expect("utf8 key")
    }
}

/// Response builder; defaults to an OK reply echoing opcode and sequence.
#[derive(Debug, Clone)]
pub struct Response {
    pub magic: u8,
    pub opcode: u8,
    pub status: u16,
    pub data_type: u8,
    pub sequence: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Response {
    pub fn to(request: &Request) -> Self {
        Response {
            magic: MAGIC_RESPONSE,
            opcode: request.opcode,
            status: Status::OK.code(),
            data_type: DATA_TYPE_RAW,
            sequence: request.sequence,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = status.code();
        self
    }

    pub fn opcode(mut self, opcode: u8) -> Self {
        self.opcode = opcode;
        self
    }

    pub fn magic(mut self, magic: u8) -> Self {
        self.magic = magic;
        self
    }

    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn extras(mut self, extras: &[u8]) -> Self {
        self.extras = extras.to_vec();
        self
    }

    pub fn key(mut self, key: &[u8]) -> Self {
        self.key = key.to_vec();
        self
    }

    pub fn value(mut self, value: &[u8]) -> Self {
        self.value = value.to_vec();
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let header = Header {
            magic: self.magic,
            opcode: self.opcode,
            key_length: self.key.len() as u16,
            extras_length: self.extras.len() as u8,
            data_type: self.data_type,
            status: self.status,
            body_length: (self.extras.len() + self.key.len() + self.value.len()) as u32,
            sequence: self.sequence,
            cas: self.cas,
        };
        let mut out = Vec::with_capacity(HEADER_SIZE + header.body_length as usize);
        header.write(&mut out);
        out.extend_from_slice(&self.extras);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
        out
    }
}

/// Reads one request; `None` on a clean EOF.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Request>> {
    let mut raw = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut raw).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let header = Header::read(&raw);
    assert_eq!(header.magic, MAGIC_REQUEST, "request magic");

    let mut body = vec![0u8; header.body_length as usize];
    reader.read_exact(&mut body).await?;
    let extras_end = header.extras_length as usize;
    let key_end = extras_end + header.key_length as usize;

    Ok(Some(Request {
        opcode: header.opcode,
        sequence: header.sequence,
        cas: header.cas,
        extras: body[..extras_end].to_vec(),
        key: body[extras_end..key_end].to_vec(),
        value: body[key_end..].to_vec(),
    }))
}

/// Accepts connections forever, running `handler(stream, index)` for each.
///
/// Returns the listening port.
pub async fn spawn_server<F, Fut>(handler: F) -> u16
where
    F: Fn(TcpStream, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        let mut index = 0;
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handler(stream, index));
            index += 1;
        }
    });
    port
}

/// Answers every request in order with whatever `respond` returns.
///
/// An empty list leaves the request unanswered.
pub async fn serve<F>(respond: F) -> u16
where
    F: Fn(&Request) -> Vec<Response> + Send + Sync + 'static,
{
    let respond = Arc::new(respond);
    spawn_server(move |mut stream, _| {
        let respond = respond.clone();
        async move {
            while let Ok(Some(request)) = read_request(&mut stream).await {
                let mut out = Vec::new();
                for response in respond(&request) {
                    out.extend_from_slice(&response.encode());
                }
                if stream.write_all(&out).await.is_err() {
                    break;
                }
            }
        }
    })
    .await
}

/// Like [`serve`], additionally recording every request.
pub async fn serve_recording<F>(respond: F) -> (u16, Arc<Mutex<Vec<Request>>>)
where
    F: Fn(&Request) -> Vec<Response> + Send + Sync + 'static,
{
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let port = serve(move |request| {
        log.lock().expect("log").push(request.clone());
        respond(request)
    })
    .await;
    (port, seen)
}

pub fn connection_config(port: u16) -> ConnectionConfig {
    ConnectionConfig::new("127.0.0.1", port).with_timeout(Duration::from_millis(500))
}

pub fn server_config(port: u16) -> ServerConfig {
    ServerConfig::new("127.0.0.1", port).with_timeout(Duration::from_millis(500))
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("addr").port()
}
