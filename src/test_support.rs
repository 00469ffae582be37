//! In-process directory server for tests. Answers bind, search, extended,
//! add, modify and unbind over a real socket on 127.0.0.1.

use crate::ber;
use crate::connection::DEFAULT_MAX_MESSAGE_SIZE;
use crate::error::ResultCode;
use crate::ldap_protocol::{
    Entry, LdapResult, Request, Response, ResponseMessage, SearchScope, WHO_AM_I_OID,
};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const ENTRY_ALREADY_EXISTS: ResultCode = ResultCode(68);

#[derive(Default)]
struct MockState {
    entries: Mutex<Vec<Entry>>,
    passwords: Mutex<HashMap<String, Vec<u8>>>,
    binds: AtomicUsize,
    sasl_steps: AtomicUsize,
}

impl MockState {
    fn find(&self, dn: &str) -> Option<Entry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.dn().eq_ignore_ascii_case(dn))
            .cloned()
    }

    fn under(&self, base: &str) -> Vec<Entry> {
        let base = base.to_ascii_lowercase();
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.dn().to_ascii_lowercase().ends_with(&base))
            .cloned()
            .collect()
    }
}

pub(crate) struct MockDirectoryServer {
    host: String,
    port: u16,
    state: Arc<MockState>,
    accept: Mutex<Option<JoinHandle<()>>>,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockDirectoryServer {
    pub async fn start(name: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(MockState::default());
        let sessions: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();

        let accept = {
            let state = Arc::clone(&state);
            let sessions = Arc::clone(&sessions);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let handle = tokio::spawn(serve(Arc::clone(&state), socket));
                    sessions.lock().unwrap().push(handle);
                }
            })
        };

        tracing::debug!("Mock directory server {} listening on port {}", name, port);
        Self {
            host: "127.0.0.1".to_string(),
            port,
            state,
            accept: Mutex::new(Some(accept)),
            sessions,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn add_entry(&self, entry: Entry) {
        self.state.entries.lock().unwrap().push(entry);
    }

    pub fn has_entry(&self, dn: &str) -> bool {
        self.state.find(dn).is_some()
    }

    /// Simple binds as `dn` succeed only with this password.
    pub fn require_password(&self, dn: &str, password: &str) {
        self.state
            .passwords
            .lock()
            .unwrap()
            .insert(dn.to_ascii_lowercase(), password.as_bytes().to_vec());
    }

    /// Simple bind requests received, accepted or not.
    pub fn bind_count(&self) -> usize {
        self.state.binds.load(Ordering::SeqCst)
    }

    pub fn sasl_step_count(&self) -> usize {
        self.state.sasl_steps.load(Ordering::SeqCst)
    }

    /// Stop listening and drop every open session.
    pub async fn shutdown(&self) {
        let accept = self.accept.lock().unwrap().take();
        if let Some(handle) = accept {
            handle.abort();
            let _ = handle.await;
        }
        let sessions: Vec<JoinHandle<()>> = self.sessions.lock().unwrap().drain(..).collect();
        for handle in sessions {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for MockDirectoryServer {
    fn drop(&mut self) {
        if let Ok(mut accept) = self.accept.lock() {
            if let Some(handle) = accept.take() {
                handle.abort();
            }
        }
        if let Ok(mut sessions) = self.sessions.lock() {
            for handle in sessions.drain(..) {
                handle.abort();
            }
        }
    }
}

async fn serve(state: Arc<MockState>, mut socket: TcpStream) {
    let mut buf = BytesMut::with_capacity(4096);
    let mut bound_dn = String::new();
    loop {
        let frame = loop {
            match ber::frame_length(&buf, DEFAULT_MAX_MESSAGE_SIZE) {
                Ok(Some(total)) if buf.len() >= total => break buf.split_to(total),
                Ok(_) => {}
                Err(_) => return,
            }
            match socket.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        };
        let Ok((message_id, request)) = Request::decode_message(&frame) else {
            return;
        };
        let responses = match request {
            Request::Unbind => return,
            other => answer(&state, &mut bound_dn, other),
        };
        for response in responses {
            let bytes = ResponseMessage::new(message_id, response).encode();
            if socket.write_all(&bytes).await.is_err() {
                return;
            }
        }
    }
}

fn answer(state: &MockState, bound_dn: &mut String, request: Request) -> Vec<Response> {
    match request {
        Request::SimpleBind(req) => {
            state.binds.fetch_add(1, Ordering::SeqCst);
            let expected = state
                .passwords
                .lock()
                .unwrap()
                .get(&req.dn.to_ascii_lowercase())
                .cloned();
            let result = match expected {
                Some(pw) if pw != req.password => {
                    LdapResult::new(ResultCode::INVALID_CREDENTIALS, "", "invalid credentials")
                }
                _ => {
                    *bound_dn = req.dn.clone();
                    LdapResult::success()
                }
            };
            vec![Response::Bind {
                result,
                server_sasl_credentials: None,
            }]
        }
        Request::SaslBind(req) => {
            state.sasl_steps.fetch_add(1, Ordering::SeqCst);
            if req.credentials.as_deref() == Some(b"final".as_slice()) {
                vec![Response::Bind {
                    result: LdapResult::success(),
                    server_sasl_credentials: None,
                }]
            } else if req.credentials.as_deref() == Some(b"final-mutual".as_slice()) {
                vec![Response::Bind {
                    result: LdapResult::success(),
                    server_sasl_credentials: Some(b"mutual".to_vec()),
                }]
            } else {
                vec![Response::Bind {
                    result: LdapResult::new(ResultCode::SASL_BIND_IN_PROGRESS, "", ""),
                    server_sasl_credentials: Some(b"challenge".to_vec()),
                }]
            }
        }
        Request::Search(req) => {
            if req.scope == SearchScope::BaseObject {
                match state.find(&req.base_dn) {
                    Some(entry) => vec![
                        Response::SearchEntry(entry),
                        Response::SearchDone(LdapResult::success()),
                    ],
                    None => vec![Response::SearchDone(LdapResult::new(
                        ResultCode::NO_SUCH_OBJECT,
                        "",
                        "no such object",
                    ))],
                }
            } else {
                let mut out: Vec<Response> = state
                    .under(&req.base_dn)
                    .into_iter()
                    .map(Response::SearchEntry)
                    .collect();
                out.push(Response::SearchDone(LdapResult::success()));
                out
            }
        }
        Request::Extended(req) if req.oid == WHO_AM_I_OID => {
            let value = if bound_dn.is_empty() {
                None
            } else {
                Some(format!("dn:{}", bound_dn).into_bytes())
            };
            vec![Response::Extended {
                result: LdapResult::success(),
                name: None,
                value,
            }]
        }
        Request::Extended(_) => vec![Response::Extended {
            result: LdapResult::new(ResultCode::PROTOCOL_ERROR, "", "unsupported extended operation"),
            name: None,
            value: None,
        }],
        Request::Add(req) => {
            if state.find(&req.dn).is_some() {
                return vec![Response::Add(LdapResult::new(ENTRY_ALREADY_EXISTS, "", "entry exists"))];
            }
            state.entries.lock().unwrap().push(req.to_entry());
            vec![Response::Add(LdapResult::success())]
        }
        Request::Modify(req) => {
            let result = if state.find(&req.dn).is_some() {
                LdapResult::success()
            } else {
                LdapResult::new(ResultCode::NO_SUCH_OBJECT, "", "no such object")
            };
            vec![Response::Modify(result)]
        }
        Request::Unbind => Vec::new(),
    }
}
