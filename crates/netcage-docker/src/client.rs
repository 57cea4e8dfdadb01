use std::ffi::CString;
use std::os::unix::prelude::FileTypeExt;
use std::path::Path;

use http_body_util::{BodyExt, Empty};
use hyper::body::{Buf, Bytes, Incoming};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector};
use nix::unistd::Pid;
use serde::de::DeserializeOwned;

use crate::dto::{ContainerInspect, ContainerSummary, Event};
use crate::error::DockerError;

/// The lifecycle actions we subscribe to on `/events`.
const EVENT_FILTERS: &str = r#"{"type":["container"],"event":["start","unpause","pause","die"]}"#;

#[derive(Debug, Clone)]
pub struct DockerClient {
    socket: String,
    client: Client<UnixConnector, Empty<Bytes>>,
}

impl DockerClient {
    pub fn new() -> Result<Self, DockerError> {
        Self::unix(crate::DEFAULT_SOCKET.to_owned())
    }

    pub fn unix(socket: String) -> Result<Self, DockerError> {
        // Check if input exists and if it is a unix socket
        match std::fs::metadata(&socket) {
            Err(err) => {
                return match err.kind() {
                    std::io::ErrorKind::NotFound => Err(DockerError::SocketNotFound(socket)),
                    _ => Err(DockerError::FailedToGetMetadata(socket)),
                };
            }
            Ok(metadata) => {
                if !metadata.file_type().is_socket() {
                    return Err(DockerError::NotASocket(socket));
                }
            }
        };

        // Engine API requests need write access to the socket.
        let cstring = CString::new(socket.as_str())?;
        let write_permission = unsafe { libc::access(cstring.as_ptr(), libc::W_OK) } == 0;
        if !write_permission {
            return Err(DockerError::NoWritePermission(socket));
        }

        Ok(Self {
            socket,
            client: Client::unix(),
        })
    }

    fn uri<T: AsRef<str>>(&self, path: T) -> Uri {
        hyperlocal::Uri::new(self.socket.clone(), path.as_ref()).into()
    }

    async fn get<T: DeserializeOwned>(&self, uri: Uri) -> Result<T, DockerError> {
        let res = self.request(uri).await?;
        let status = res.status();
        if !status.is_success() {
            let error = res.collect().await?.to_bytes();
            return Err(DockerError::UnexpectedResponse {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&error).into_owned(),
            });
        }
        let buf = res.collect().await?.aggregate();
        Ok(serde_json::from_reader(buf.reader())?)
    }

    async fn request(&self, uri: Uri) -> Result<hyper::Response<Incoming>, DockerError> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Empty::<Bytes>::new())?;
        Ok(self.client.request(req).await?)
    }

    /// IDs of the containers currently running.
    pub async fn running_containers(&self) -> Result<Vec<String>, DockerError> {
        let summaries: Vec<ContainerSummary> = self.get(self.uri("/containers/json")).await?;
        Ok(summaries.into_iter().map(|s| s.id).collect())
    }

    /// Full enforcement-side record of one container.
    pub async fn inspect(
        &self,
        id: &str,
    ) -> Result<netcage_core::container::Container, DockerError> {
        let inspect: ContainerInspect = self.get(self.uri(format!("/containers/{id}/json"))).await?;
        inspect.into_container()
    }

    /// Subscribes to the container lifecycle event feed.
    pub async fn events(&self) -> Result<EventStream, DockerError> {
        let uri = self.uri(format!("/events?filters={}", percent_encode(EVENT_FILTERS)));
        let res = self.request(uri).await?;
        let status = res.status();
        if !status.is_success() {
            let error = res.collect().await?.to_bytes();
            return Err(DockerError::UnexpectedResponse {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&error).into_owned(),
            });
        }
        Ok(EventStream {
            body: res.into_body(),
            buf: Vec::new(),
        })
    }
}

/// The daemon's own PID, from its pidfile. Needed to recognize DNS queries
/// proxied through the embedded resolver.
pub fn daemon_pid(path: &Path) -> Result<Pid, DockerError> {
    let text = std::fs::read_to_string(path).map_err(|source| DockerError::Pidfile {
        source,
        path: path.display().to_string(),
    })?;
    let pid = text
        .trim()
        .parse()
        .map_err(|_| DockerError::MalformedPidfile(path.display().to_string()))?;
    Ok(Pid::from_raw(pid))
}

/// The `/events` endpoint keeps the response open and emits one JSON
/// document per line.
pub struct EventStream {
    body: Incoming,
    buf: Vec<u8>,
}

impl EventStream {
    /// Next lifecycle event, or `None` when the daemon closes the feed.
    pub async fn next(&mut self) -> Result<Option<Event>, DockerError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(serde_json::from_slice(line)?));
            }
            match self.body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.buf.extend_from_slice(&data);
                    }
                }
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(None),
            }
        }
    }
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
